use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Channel error while {context}: {source}")]
    Channel {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Failed to read bars from {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Bar data error: {0}")]
    Data(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ReplayError {
    pub fn channel(context: impl Into<String>, source: io::Error) -> Self {
        ReplayError::Channel {
            context: context.into(),
            source,
        }
    }

    /// True when the error means the duplex channel is unusable and the
    /// session has to be torn down.
    pub fn is_channel_fatal(&self) -> bool {
        matches!(
            self,
            ReplayError::Channel { .. } | ReplayError::ChannelClosed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ReplayError>;
