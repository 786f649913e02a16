//! Command listener task.
//!
//! Sole reader of the channel for the life of the session. Parses control
//! frames and applies them to the shared control state. A closed or broken
//! channel is fatal for the whole session.

use crate::error::ReplayError;
use crate::replay::channel::{Connection, InboundFrames};
use crate::replay::control::ControlState;
use crate::replay::fatal::{fail_all, Terminator};
use crate::replay::protocol::{ControlCommand, FrameError};
use std::sync::Arc;

/// Apply one inbound line to the control state.
/// Returns the command when it changed (or was recognised by) the state.
pub fn apply_frame(control: &ControlState, line: &str) -> Option<ControlCommand> {
    let command = match ControlCommand::parse(line) {
        Ok(command) => command,
        Err(FrameError::Empty) => return None,
        Err(e @ FrameError::Malformed { .. }) => {
            tracing::warn!("Ignoring control frame: {}", e);
            return None;
        }
        Err(e) => {
            tracing::debug!("Ignoring frame '{}': {}", line.trim(), e);
            return None;
        }
    };

    match &command {
        ControlCommand::Pause => {
            control.pause();
            tracing::info!("Replay paused");
        }
        ControlCommand::Resume => {
            control.resume();
            tracing::info!("Replay resumed");
        }
        ControlCommand::Speed(secs) => match control.set_delay_secs(*secs) {
            Some(delay) => tracing::info!(?delay, "Replay speed changed"),
            None => {
                tracing::warn!(secs, "Ignoring unusable SPEED value");
                return None;
            }
        },
        ControlCommand::Batch(requested) => {
            let size = control.set_batch_size(*requested);
            tracing::info!(requested, size, "Batch size changed");
        }
        ControlCommand::Status(key) => {
            tracing::info!(checkpoint = %key, "Client reported checkpoint");
            control.record_checkpoint(key.clone());
        }
        ControlCommand::QueryStatus => {
            tracing::debug!("Ignoring QUERY_STATUS from client");
        }
    }

    Some(command)
}

pub struct CommandListener {
    inbound: InboundFrames,
    control: Arc<ControlState>,
    connection: Arc<Connection>,
    terminator: Arc<dyn Terminator>,
}

impl CommandListener {
    pub fn new(
        inbound: InboundFrames,
        control: Arc<ControlState>,
        connection: Arc<Connection>,
        terminator: Arc<dyn Terminator>,
    ) -> Self {
        Self {
            inbound,
            control,
            connection,
            terminator,
        }
    }

    /// Read and apply frames until the session stops or the channel breaks.
    pub async fn run(mut self) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.control.wait_stopped() => {
                    tracing::debug!("Command listener stopping");
                    return;
                }
                frame = self.inbound.next_frame() => frame,
            };

            let reason = match frame {
                Ok(Some(line)) => {
                    apply_frame(&self.control, &line);
                    continue;
                }
                Ok(None) => ReplayError::ChannelClosed(format!(
                    "{} closed the channel",
                    self.connection.peer()
                )),
                Err(e) => ReplayError::channel(format!("reading from {}", self.connection.peer()), e),
            };

            // A stop we initiated ourselves closes the channel too
            if !self.control.is_running() {
                return;
            }

            fail_all(
                &self.control,
                &self.connection,
                self.terminator.as_ref(),
                reason,
            )
            .await;
            return;
        }
    }
}
