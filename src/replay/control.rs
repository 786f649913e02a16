//! Control state shared by the command listener and the stream producer.
//!
//! The listener mutates, the producer reads. Scalars are atomics, so a
//! change becomes visible to the producer on its next poll at the latest;
//! `changed` wakes it earlier when it is idling.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Smallest accepted batch size
pub const MIN_BATCH_SIZE: usize = 1;

/// Largest accepted batch size
pub const MAX_BATCH_SIZE: usize = 10;

/// Inter-batch delay until the client sends SPEED
pub const DEFAULT_DELAY: Duration = Duration::from_secs(3);

/// Initial values for a fresh control state
#[derive(Debug, Clone, Copy)]
pub struct ControlDefaults {
    /// Sessions start suspended until the client sends RESUME
    pub paused: bool,
    pub delay: Duration,
    pub batch_size: usize,
}

impl Default for ControlDefaults {
    fn default() -> Self {
        Self {
            paused: true,
            delay: DEFAULT_DELAY,
            batch_size: MIN_BATCH_SIZE,
        }
    }
}

/// Clamp a requested batch size into `[MIN_BATCH_SIZE, MAX_BATCH_SIZE]`.
pub fn clamp_batch_size(requested: i64) -> usize {
    requested.clamp(MIN_BATCH_SIZE as i64, MAX_BATCH_SIZE as i64) as usize
}

fn duration_to_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

pub struct ControlState {
    paused: AtomicBool,
    delay_nanos: AtomicU64,
    batch_size: AtomicUsize,
    checkpoint: Mutex<Option<String>>,
    running: watch::Sender<bool>,
    changed: Notify,
    checkpoint_arrived: Notify,
}

impl ControlState {
    pub fn new(defaults: ControlDefaults) -> Self {
        let (running, _) = watch::channel(true);
        Self {
            paused: AtomicBool::new(defaults.paused),
            delay_nanos: AtomicU64::new(duration_to_nanos(defaults.delay)),
            batch_size: AtomicUsize::new(clamp_batch_size(defaults.batch_size as i64)),
            checkpoint: Mutex::new(None),
            running,
            changed: Notify::new(),
            checkpoint_arrived: Notify::new(),
        }
    }

    // -------------------------------------------------------------------------
    // paused
    // -------------------------------------------------------------------------

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        self.changed.notify_one();
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.changed.notify_one();
    }

    // -------------------------------------------------------------------------
    // delay / batch size
    // -------------------------------------------------------------------------

    pub fn delay(&self) -> Duration {
        Duration::from_nanos(self.delay_nanos.load(Ordering::Acquire))
    }

    /// Set the inter-batch delay. Returns `None` (state unchanged) for
    /// negative, non-finite or overflowing values.
    pub fn set_delay_secs(&self, secs: f64) -> Option<Duration> {
        let delay = Duration::try_from_secs_f64(secs).ok()?;
        self.delay_nanos
            .store(duration_to_nanos(delay), Ordering::Release);
        self.changed.notify_one();
        Some(delay)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.load(Ordering::Acquire)
    }

    /// Store the clamped batch size and return it.
    pub fn set_batch_size(&self, requested: i64) -> usize {
        let size = clamp_batch_size(requested);
        self.batch_size.store(size, Ordering::Release);
        self.changed.notify_one();
        size
    }

    // -------------------------------------------------------------------------
    // resume checkpoint
    // -------------------------------------------------------------------------

    pub fn checkpoint(&self) -> Option<String> {
        self.checkpoint
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn clear_checkpoint(&self) {
        *self.checkpoint.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn record_checkpoint(&self, key: impl Into<String>) {
        *self.checkpoint.lock().unwrap_or_else(|e| e.into_inner()) = Some(key.into());
        self.checkpoint_arrived.notify_one();
    }

    /// Wait up to `timeout` for a checkpoint to be recorded.
    pub async fn wait_checkpoint(&self, timeout: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(key) = self.checkpoint() {
                return Some(key);
            }
            // A stale permit only costs one extra loop iteration.
            if tokio::time::timeout_at(deadline, self.checkpoint_arrived.notified())
                .await
                .is_err()
            {
                return self.checkpoint();
            }
        }
    }

    // -------------------------------------------------------------------------
    // running
    // -------------------------------------------------------------------------

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Clear the running flag. Returns true for the call that actually
    /// flipped it; the flag is never set again.
    pub fn stop(&self) -> bool {
        let flipped = self.running.send_if_modified(|running| {
            let was_running = *running;
            *running = false;
            was_running
        });
        if flipped {
            self.changed.notify_one();
        }
        flipped
    }

    /// Resolves once the running flag has been cleared.
    pub async fn wait_stopped(&self) {
        let mut rx = self.running.subscribe();
        // The sender lives in `self`, so this only errors if it is dropped.
        let _ = rx.wait_for(|running| !*running).await;
    }

    /// Idle until a control change is signalled or `poll` elapses.
    pub async fn wait_changed(&self, poll: Duration) {
        let _ = tokio::time::timeout(poll, self.changed.notified()).await;
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new(ControlDefaults::default())
    }
}

impl std::fmt::Debug for ControlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlState")
            .field("paused", &self.is_paused())
            .field("delay", &self.delay())
            .field("batch_size", &self.batch_size())
            .field("checkpoint", &self.checkpoint())
            .field("running", &self.is_running())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_defaults() {
        let control = ControlState::default();
        assert!(control.is_paused());
        assert_eq!(control.delay(), Duration::from_secs(3));
        assert_eq!(control.batch_size(), 1);
        assert_eq!(control.checkpoint(), None);
        assert!(control.is_running());
    }

    #[test]
    fn test_batch_clamp_edges() {
        let control = ControlState::default();
        assert_eq!(control.set_batch_size(0), 1);
        assert_eq!(control.set_batch_size(-7), 1);
        assert_eq!(control.set_batch_size(5), 5);
        assert_eq!(control.set_batch_size(11), 10);
        assert_eq!(control.set_batch_size(i64::MAX), 10);
        assert_eq!(control.set_batch_size(i64::MIN), 1);
        assert_eq!(control.batch_size(), 1);
    }

    #[test]
    fn test_delay_rejects_invalid() {
        let control = ControlState::default();
        assert_eq!(control.set_delay_secs(0.25), Some(Duration::from_millis(250)));
        assert_eq!(control.set_delay_secs(-1.0), None);
        assert_eq!(control.set_delay_secs(f64::NAN), None);
        assert_eq!(control.set_delay_secs(f64::INFINITY), None);
        assert_eq!(control.delay(), Duration::from_millis(250));
        assert_eq!(control.set_delay_secs(0.0), Some(Duration::ZERO));
    }

    #[test]
    fn test_stop_is_sticky() {
        let control = ControlState::default();
        assert!(control.stop());
        assert!(!control.stop());
        assert!(!control.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_checkpoint_times_out() {
        let control = ControlState::default();
        let start = tokio::time::Instant::now();
        assert_eq!(control.wait_checkpoint(Duration::from_secs(2)).await, None);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_checkpoint_wakes_on_record() {
        let control = Arc::new(ControlState::default());
        let writer = Arc::clone(&control);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            writer.record_checkpoint("2024.01.02 08:00");
        });

        let start = tokio::time::Instant::now();
        let key = control.wait_checkpoint(Duration::from_secs(10)).await;
        assert_eq!(key.as_deref(), Some("2024.01.02 08:00"));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_wait_stopped_after_stop() {
        let control = Arc::new(ControlState::default());
        let waiter = {
            let control = Arc::clone(&control);
            tokio::spawn(async move { control.wait_stopped().await })
        };
        control.stop();
        waiter.await.unwrap();
        // already stopped resolves immediately
        control.wait_stopped().await;
    }

    proptest! {
        #[test]
        fn prop_batch_size_always_clamped(n in any::<i64>()) {
            let control = ControlState::default();
            let size = control.set_batch_size(n);
            prop_assert_eq!(size, n.clamp(1, 10) as usize);
            prop_assert!((MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&control.batch_size()));
        }
    }
}
