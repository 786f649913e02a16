//! Fatal channel failures.
//!
//! A broken channel invalidates the whole session: whichever task sees it
//! stops the control state, closes the connection and hands the error to
//! the session's `Terminator`, which for the binary ends the process.

use crate::error::ReplayError;
use crate::replay::channel::Connection;
use crate::replay::control::ControlState;

/// What to do once a session has failed.
pub trait Terminator: Send + Sync {
    fn terminate(&self, reason: &ReplayError);
}

/// Exits the process with a non-zero status.
#[derive(Debug, Clone, Copy)]
pub struct ExitProcess {
    pub code: i32,
}

impl Default for ExitProcess {
    fn default() -> Self {
        Self { code: 1 }
    }
}

impl Terminator for ExitProcess {
    fn terminate(&self, reason: &ReplayError) {
        tracing::error!("Replay session failed: {}", reason);
        std::process::exit(self.code);
    }
}

/// Stop, close, terminate. Both the listener and the producer call this;
/// only the first caller terminates.
pub(crate) async fn fail_all(
    control: &ControlState,
    connection: &Connection,
    terminator: &dyn Terminator,
    reason: ReplayError,
) -> ReplayError {
    let first = control.stop();
    connection.close().await;
    if first {
        tracing::warn!(peer = connection.peer(), "Stopping session: {}", reason);
        terminator.terminate(&reason);
    }
    reason
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records termination reasons instead of exiting
    #[derive(Debug, Default)]
    pub struct RecordingTerminator {
        reasons: Mutex<Vec<String>>,
    }

    impl RecordingTerminator {
        pub fn reasons(&self) -> Vec<String> {
            self.reasons.lock().unwrap().clone()
        }
    }

    impl Terminator for RecordingTerminator {
        fn terminate(&self, reason: &ReplayError) {
            self.reasons.lock().unwrap().push(reason.to_string());
        }
    }
}
