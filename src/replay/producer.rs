//! Stream producer.
//!
//! Drains the bar series from the resume index in batches, paced by the
//! control state. Batch size and delay are re-read on every iteration, so
//! control changes apply from the next batch on.

use crate::bars::BarSeries;
use crate::error::{ReplayError, Result};
use crate::replay::channel::Connection;
use crate::replay::control::ControlState;
use crate::replay::protocol::AddBar;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Poll interval while paused
pub const PAUSE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerState {
    Syncing,
    Streaming,
    Done,
    Failed,
}

pub struct StreamProducer<'a> {
    bars: &'a BarSeries,
    connection: &'a Connection,
    control: &'a ControlState,
    pause_poll: Duration,
    state: ProducerState,
    current_index: usize,
    bars_sent: u64,
}

impl<'a> StreamProducer<'a> {
    pub fn new(bars: &'a BarSeries, connection: &'a Connection, control: &'a ControlState) -> Self {
        Self {
            bars,
            connection,
            control,
            pause_poll: PAUSE_POLL,
            state: ProducerState::Syncing,
            current_index: 0,
            bars_sent: 0,
        }
    }

    pub fn with_pause_poll(mut self, pause_poll: Duration) -> Self {
        self.pause_poll = pause_poll;
        self
    }

    pub fn state(&self) -> ProducerState {
        self.state
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn bars_sent(&self) -> u64 {
        self.bars_sent
    }

    /// Leave `Syncing` and position the cursor. Out-of-range indices are
    /// clamped to the end of the series.
    pub fn start_at(&mut self, index: usize) {
        self.current_index = index.min(self.bars.len());
        self.state = ProducerState::Streaming;
    }

    /// Stream until the series is exhausted (`Ok`) or the channel fails (`Err`).
    pub async fn run(&mut self) -> Result<()> {
        if self.state == ProducerState::Syncing {
            self.start_at(0);
        }

        let result = self.stream().await;
        self.state = match result {
            Ok(()) => ProducerState::Done,
            Err(_) => ProducerState::Failed,
        };
        result
    }

    async fn stream(&mut self) -> Result<()> {
        while self.current_index < self.bars.len() {
            self.ensure_alive()?;

            while self.control.is_paused() {
                self.ensure_alive()?;
                self.control.wait_changed(self.pause_poll).await;
            }
            self.ensure_alive()?;

            self.send_batch().await?;

            if self.current_index >= self.bars.len() {
                break;
            }

            self.pace().await;
        }

        tracing::info!(
            bars_sent = self.bars_sent,
            index = self.current_index,
            "Replay finished"
        );
        Ok(())
    }

    async fn send_batch(&mut self) -> Result<()> {
        let bars = self.bars;
        let batch = bars.window(self.current_index, self.control.batch_size());

        for bar in batch {
            self.connection.send(&AddBar { bar }.encode()).await?;
            self.current_index += 1;
            self.bars_sent += 1;
        }

        tracing::debug!(
            sent = batch.len(),
            index = self.current_index,
            total = self.bars.len(),
            "Sent batch"
        );
        Ok(())
    }

    /// Inter-batch wait. The delay is measured from the end of the batch
    /// and re-read on every control change, so a new SPEED shortens or
    /// extends a wait already in progress.
    async fn pace(&self) {
        let started = Instant::now();
        loop {
            let deadline = started + self.control.delay();
            tokio::select! {
                biased;
                _ = self.control.wait_stopped() => return,
                _ = tokio::time::sleep_until(deadline) => return,
                _ = self.control.wait_changed(self.pause_poll) => {}
            }
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if !self.control.is_running() {
            return Err(ReplayError::ChannelClosed(
                "session stopped while streaming".to_string(),
            ));
        }
        if !self.connection.is_open() {
            return Err(ReplayError::ChannelClosed(format!(
                "connection to {} is gone",
                self.connection.peer()
            )));
        }
        Ok(())
    }
}
