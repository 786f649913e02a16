//! Replay streaming session.
//!
//! One chart client connects over a local duplex channel. The server
//! streams bars to it while a listener task applies the client's control
//! frames.
//!
//! # Architecture
//!
//! ```text
//!                      +------------------+
//!            +-------> | Command Listener | --(PAUSE/RESUME/SPEED/BATCH/STATUS)--+
//!            |         +------------------+                                      |
//! client ----+                                                                   v
//!   ^                  +------------------+        +--------------+       +--------------+
//!   +----(ADD_BAR)---- |  Stream Producer | <----- | Sync Resolver| <---- | ControlState |
//!                      +------------------+        +--------------+       +--------------+
//! ```
//!
//! A broken channel, seen by either task, stops the session and terminates
//! the process.

pub mod channel;
pub mod control;
pub mod fatal;
pub mod listener;
pub mod producer;
pub mod protocol;
pub mod server;
pub mod session;
pub mod sync;

pub use channel::{
    ChannelListener, Connection, InboundFrames, DEFAULT_CHANNEL_NAME,
};
pub use control::{
    clamp_batch_size, ControlDefaults, ControlState, DEFAULT_DELAY, MAX_BATCH_SIZE,
    MIN_BATCH_SIZE,
};
pub use fatal::{ExitProcess, Terminator};
pub use listener::{apply_frame, CommandListener};
pub use producer::{ProducerState, StreamProducer, PAUSE_POLL};
pub use protocol::{
    write_frame, AddBar, ControlCommand, FrameError, FrameReader, MessageType, Msg, QueryStatus,
    SetRange, VLine,
};
pub use server::ReplayServer;
pub use session::{Session, SessionConfig, SessionReport};
pub use sync::{resume_index, SyncConfig, SyncOutcome, SyncResolver};
