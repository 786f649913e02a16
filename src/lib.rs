//! replay-bridge - historical bar replay for chart clients.
//!
//! Loads a bar series from CSV and streams it to a chart client over a
//! local duplex channel (Unix socket or named pipe), honouring the client's
//! pause/resume/speed/batch commands and resuming after the last bar the
//! client already rendered.

pub mod bars;
pub mod config;
pub mod error;
pub mod replay;

pub use error::{ReplayError, Result};
