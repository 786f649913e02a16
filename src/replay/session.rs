//! Replay session.
//!
//! Owns one accepted connection, its control state and its command
//! listener task. `run` performs the resume handshake and then streams the
//! bar series until it is exhausted or the channel fails.

use crate::bars::BarSeries;
use crate::error::Result;
use crate::replay::channel::{Connection, InboundFrames};
use crate::replay::control::{ControlDefaults, ControlState};
use crate::replay::fatal::{fail_all, Terminator};
use crate::replay::listener::CommandListener;
use crate::replay::producer::{ProducerState, StreamProducer, PAUSE_POLL};
use crate::replay::protocol::{Msg, SetRange, VLine};
use crate::replay::sync::{SyncConfig, SyncOutcome, SyncResolver};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Per-session settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub sync: SyncConfig,
    pub control: ControlDefaults,
    /// Producer poll interval while paused
    pub pause_poll: Duration,
    /// Send SET_RANGE with the first and last bar once synced
    pub announce_range: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            control: ControlDefaults::default(),
            pause_poll: PAUSE_POLL,
            announce_range: false,
        }
    }
}

/// Summary of a completed session
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub peer: String,
    pub sync: SyncOutcome,
    pub start_index: usize,
    pub final_index: usize,
    pub bars_sent: u64,
    pub total_bars: usize,
    pub state: ProducerState,
}

pub struct Session {
    connection: Arc<Connection>,
    control: Arc<ControlState>,
    inbound: Option<InboundFrames>,
    listener: Option<JoinHandle<()>>,
    terminator: Arc<dyn Terminator>,
    config: SessionConfig,
}

impl Session {
    pub fn new(
        connection: Arc<Connection>,
        inbound: InboundFrames,
        config: SessionConfig,
        terminator: Arc<dyn Terminator>,
    ) -> Self {
        Self {
            control: Arc::new(ControlState::new(config.control)),
            connection,
            inbound: Some(inbound),
            listener: None,
            terminator,
            config,
        }
    }

    pub fn control(&self) -> &Arc<ControlState> {
        &self.control
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Spawn the command listener. The inbound half can only be handed out
    /// once, so a session never has more than one listener.
    pub fn start_listener(&mut self) -> bool {
        let Some(inbound) = self.inbound.take() else {
            return false;
        };
        let listener = CommandListener::new(
            inbound,
            Arc::clone(&self.control),
            Arc::clone(&self.connection),
            Arc::clone(&self.terminator),
        );
        self.listener = Some(tokio::spawn(listener.run()));
        true
    }

    /// Resume handshake. The listener is started after the reset so a
    /// STATUS sent right on connect is not wiped.
    pub async fn synchronize(&mut self, bars: &BarSeries) -> Result<SyncOutcome> {
        let sync_config = self.config.sync.clone();
        let resolver = SyncResolver::new(&sync_config);
        resolver.reset(&self.control);
        self.start_listener();
        let outcome = resolver
            .resolve(&self.connection, &self.control, bars)
            .await;
        self.check(outcome).await
    }

    /// Handshake, then stream from the resume index.
    pub async fn run(mut self, bars: &BarSeries) -> Result<SessionReport> {
        let sync = self.synchronize(bars).await?;

        if self.config.announce_range {
            if let (Some(first), Some(last)) = (bars.first(), bars.last()) {
                let range = SetRange {
                    start: first.time_key(),
                    end: last.time_key(),
                };
                self.send(&range.encode()).await?;
            }
        }

        let start_index = sync.start_index();
        let mut producer = StreamProducer::new(bars, &self.connection, &self.control)
            .with_pause_poll(self.config.pause_poll);
        producer.start_at(start_index);
        tracing::info!(
            start_index,
            total = bars.len(),
            paused = self.control.is_paused(),
            "Streaming bars"
        );

        let result = producer.run().await;
        let report = SessionReport {
            peer: self.connection.peer().to_string(),
            sync,
            start_index,
            final_index: producer.current_index(),
            bars_sent: producer.bars_sent(),
            total_bars: bars.len(),
            state: producer.state(),
        };
        self.check(result).await?;

        self.finish().await;
        Ok(report)
    }

    /// Out-of-band vertical marker
    pub async fn send_marker(&self, time: &str) -> Result<()> {
        let frame = VLine {
            time: time.to_string(),
        };
        self.send(&frame.encode()).await
    }

    /// Out-of-band range
    pub async fn send_range(&self, start: &str, end: &str) -> Result<()> {
        let frame = SetRange {
            start: start.to_string(),
            end: end.to_string(),
        };
        self.send(&frame.encode()).await
    }

    /// Free-text message for the client's log
    pub async fn send_message(&self, text: &str) -> Result<()> {
        let frame = Msg {
            text: text.to_string(),
        };
        self.send(&frame.encode()).await
    }

    /// Stop the listener and close the channel.
    pub async fn finish(&mut self) {
        self.control.stop();
        self.connection.close().await;
        if let Some(handle) = self.listener.take() {
            // The listener returns once it sees the stop
            if let Err(e) = handle.await {
                tracing::debug!("Command listener ended abnormally: {}", e);
            }
        }
    }

    async fn send(&self, frame: &Bytes) -> Result<()> {
        let result = self.connection.send(frame).await;
        self.check(result).await
    }

    /// Channel failures take the whole session down.
    async fn check<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Err(e) if e.is_channel_fatal() => Err(fail_all(
                &self.control,
                &self.connection,
                self.terminator.as_ref(),
                e,
            )
            .await),
            other => other,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.take() {
            handle.abort();
        }
    }
}
