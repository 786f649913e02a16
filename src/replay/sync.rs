//! Resume synchronization.
//!
//! Decides where the replay starts on a new connection. The client may
//! announce its last rendered bar on its own (`STATUS|<time>`); otherwise
//! it is asked with `QUERY_STATUS` a bounded number of times. Only an exact
//! time-key match resumes; anything else replays from the first bar.

use crate::bars::BarSeries;
use crate::error::{ReplayError, Result};
use crate::replay::channel::Connection;
use crate::replay::control::ControlState;
use crate::replay::protocol::QueryStatus;
use serde::Serialize;
use std::time::Duration;

/// Handshake timings
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long to wait for an unsolicited STATUS
    pub initial_wait: Duration,
    /// Wait after the first QUERY_STATUS
    pub query_wait: Duration,
    /// Number of QUERY_STATUS attempts
    pub query_attempts: u32,
    /// Added to the wait on every further attempt
    pub query_backoff: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            initial_wait: Duration::from_secs(10),
            query_wait: Duration::from_secs(2),
            query_attempts: 5,
            query_backoff: Duration::from_millis(500),
        }
    }
}

impl SyncConfig {
    /// Wait used for the given 0-based query attempt
    pub fn attempt_wait(&self, attempt: u32) -> Duration {
        self.query_wait + self.query_backoff * attempt
    }
}

/// How the start index was chosen
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Checkpoint matched the bar at `index - 1`
    Resumed { checkpoint: String, index: usize },
    /// Checkpoint reported but not present in the data
    CheckpointNotFound { checkpoint: String },
    /// Client never reported a checkpoint
    NoCheckpoint,
}

impl SyncOutcome {
    pub fn start_index(&self) -> usize {
        match self {
            SyncOutcome::Resumed { index, .. } => *index,
            SyncOutcome::CheckpointNotFound { .. } | SyncOutcome::NoCheckpoint => 0,
        }
    }
}

/// Index to resume at for a checkpoint: one past the matching bar.
pub fn resume_index(bars: &BarSeries, checkpoint: &str) -> Option<usize> {
    bars.position_of_key(checkpoint.trim()).map(|i| i + 1)
}

pub struct SyncResolver<'a> {
    config: &'a SyncConfig,
}

impl<'a> SyncResolver<'a> {
    pub fn new(config: &'a SyncConfig) -> Self {
        Self { config }
    }

    /// Forget any checkpoint from an earlier handshake. Must happen before
    /// the command listener can record a fresh STATUS.
    pub fn reset(&self, control: &ControlState) {
        control.clear_checkpoint();
    }

    /// Run the handshake and pick the start index.
    ///
    /// Fails only on channel errors; a missing or unknown checkpoint falls
    /// back to a full replay.
    pub async fn resolve(
        &self,
        connection: &Connection,
        control: &ControlState,
        bars: &BarSeries,
    ) -> Result<SyncOutcome> {
        let outcome = match self.obtain_checkpoint(connection, control).await? {
            Some(checkpoint) => match resume_index(bars, &checkpoint) {
                Some(index) => {
                    tracing::info!(%checkpoint, index, "Resuming after client checkpoint");
                    SyncOutcome::Resumed { checkpoint, index }
                }
                None => {
                    tracing::warn!(
                        %checkpoint,
                        "Checkpoint not found in bar data, replaying from the start"
                    );
                    SyncOutcome::CheckpointNotFound { checkpoint }
                }
            },
            None => {
                tracing::warn!(
                    attempts = self.config.query_attempts,
                    "No checkpoint from client, replaying from the start"
                );
                SyncOutcome::NoCheckpoint
            }
        };
        Ok(outcome)
    }

    async fn obtain_checkpoint(
        &self,
        connection: &Connection,
        control: &ControlState,
    ) -> Result<Option<String>> {
        tracing::info!(
            wait = ?self.config.initial_wait,
            "Waiting for client checkpoint"
        );
        if let Some(checkpoint) = self.wait(control, self.config.initial_wait).await? {
            return Ok(Some(checkpoint));
        }

        for attempt in 0..self.config.query_attempts {
            tracing::debug!(attempt = attempt + 1, "Sending QUERY_STATUS");
            connection.send(&QueryStatus.encode()).await?;

            if let Some(checkpoint) = self.wait(control, self.config.attempt_wait(attempt)).await? {
                return Ok(Some(checkpoint));
            }
        }

        Ok(None)
    }

    async fn wait(&self, control: &ControlState, timeout: Duration) -> Result<Option<String>> {
        tokio::select! {
            biased;
            _ = control.wait_stopped() => Err(ReplayError::ChannelClosed(
                "session stopped during sync".to_string(),
            )),
            checkpoint = control.wait_checkpoint(timeout) => Ok(checkpoint),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bars::Bar;
    use chrono::NaiveDate;
    use proptest::prelude::*;

    fn hourly(count: u32) -> BarSeries {
        let day = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        BarSeries::new(
            (0..count)
                .map(|h| Bar {
                    time: day.and_hms_opt(h, 0, 0).unwrap(),
                    open: 1.0,
                    high: 1.0,
                    low: 1.0,
                    close: 1.0,
                    volume: 1,
                })
                .collect(),
        )
    }

    #[test]
    fn test_resume_index_exact_match() {
        let bars = hourly(5);
        assert_eq!(resume_index(&bars, "2024.01.02 02:00"), Some(3));
        assert_eq!(resume_index(&bars, " 2024.01.02 04:00 "), Some(5));
        assert_eq!(resume_index(&bars, "2024.01.02 02:30"), None);
        assert_eq!(resume_index(&bars, "2024-01-02 02:00:00"), None);
    }

    #[test]
    fn test_attempt_wait_backoff() {
        let config = SyncConfig::default();
        assert_eq!(config.attempt_wait(0), Duration::from_secs(2));
        assert_eq!(config.attempt_wait(2), Duration::from_secs(3));
    }

    #[test]
    fn test_outcome_start_index() {
        assert_eq!(
            SyncOutcome::Resumed {
                checkpoint: "x".into(),
                index: 4
            }
            .start_index(),
            4
        );
        assert_eq!(
            SyncOutcome::CheckpointNotFound {
                checkpoint: "x".into()
            }
            .start_index(),
            0
        );
        assert_eq!(SyncOutcome::NoCheckpoint.start_index(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_uses_proactive_status() {
        let (_client, server) = tokio::io::duplex(1024);
        let (connection, _inbound) = Connection::from_stream(server, "test");
        let control = std::sync::Arc::new(ControlState::default());
        let bars = hourly(5);

        let reporter = std::sync::Arc::clone(&control);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            reporter.record_checkpoint("2024.01.02 01:00");
        });

        let config = SyncConfig::default();
        let outcome = SyncResolver::new(&config)
            .resolve(&connection, &control, &bars)
            .await
            .unwrap();
        assert_eq!(outcome.start_index(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_fails_when_channel_breaks() {
        let (client, server) = tokio::io::duplex(1024);
        let (connection, _inbound) = Connection::from_stream(server, "test");
        let control = ControlState::default();
        drop(client);

        let config = SyncConfig::default();
        let err = SyncResolver::new(&config)
            .resolve(&connection, &control, &hourly(3))
            .await
            .unwrap_err();
        assert!(err.is_channel_fatal());
    }

    proptest! {
        #[test]
        fn prop_resume_index_is_one_past_match(len in 1u32..24, pick in 0u32..24) {
            let bars = hourly(len);
            let pick = pick % len;
            let key = bars.get(pick as usize).unwrap().time_key();
            prop_assert_eq!(resume_index(&bars, &key), Some(pick as usize + 1));
            prop_assert!(resume_index(&bars, "1999.01.01 00:00").is_none());
        }
    }
}
