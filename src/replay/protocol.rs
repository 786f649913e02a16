//! Line protocol spoken with the chart client.
//!
//! Every frame is one UTF-8 line: `PREFIX` or `PREFIX|payload`, terminated
//! by `\n` on the way out. Inbound lines may end in `\r\n`.
//!
//! Outbound (core -> client): ADD_BAR, QUERY_STATUS, VLINE, SET_RANGE, MSG
//! Inbound (client -> core): PAUSE, RESUME, SPEED, BATCH, STATUS

use crate::bars::Bar;
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Field separator between prefix and payload
pub const FIELD_SEPARATOR: char = '|';

/// Maximum inbound line length (matches the 64KB pipe buffer)
pub const MAX_FRAME_LEN: usize = 64 * 1024;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    AddBar,
    QueryStatus,
    VLine,
    SetRange,
    Msg,
    Pause,
    Resume,
    Speed,
    Batch,
    Status,
}

impl MessageType {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::AddBar => "ADD_BAR",
            Self::QueryStatus => "QUERY_STATUS",
            Self::VLine => "VLINE",
            Self::SetRange => "SET_RANGE",
            Self::Msg => "MSG",
            Self::Pause => "PAUSE",
            Self::Resume => "RESUME",
            Self::Speed => "SPEED",
            Self::Batch => "BATCH",
            Self::Status => "STATUS",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "ADD_BAR" => Some(Self::AddBar),
            "QUERY_STATUS" => Some(Self::QueryStatus),
            "VLINE" => Some(Self::VLine),
            "SET_RANGE" => Some(Self::SetRange),
            "MSG" => Some(Self::Msg),
            "PAUSE" => Some(Self::Pause),
            "RESUME" => Some(Self::Resume),
            "SPEED" => Some(Self::Speed),
            "BATCH" => Some(Self::Batch),
            "STATUS" => Some(Self::Status),
            _ => None,
        }
    }
}

fn encode_line(msg_type: MessageType, fields: &[&str]) -> Bytes {
    let prefix = msg_type.prefix();
    let payload_len: usize = fields.iter().map(|f| f.len() + 1).sum();
    let mut buf = BytesMut::with_capacity(prefix.len() + payload_len + 1);

    buf.put_slice(prefix.as_bytes());
    for field in fields {
        buf.put_u8(FIELD_SEPARATOR as u8);
        buf.put_slice(field.as_bytes());
    }
    buf.put_u8(b'\n');

    buf.freeze()
}

// =============================================================================
// ADD_BAR
// =============================================================================

/// One bar: `ADD_BAR|time,open,high,low,close,tick_volume`
#[derive(Debug, Clone, Copy)]
pub struct AddBar<'a> {
    pub bar: &'a Bar,
}

impl AddBar<'_> {
    pub fn encode(&self) -> Bytes {
        let bar = self.bar;
        let payload = format!(
            "{},{},{},{},{},{}",
            bar.time_key(),
            bar.open,
            bar.high,
            bar.low,
            bar.close,
            bar.volume
        );
        encode_line(MessageType::AddBar, &[&payload])
    }
}

// =============================================================================
// QUERY_STATUS
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct QueryStatus;

impl QueryStatus {
    pub fn encode(&self) -> Bytes {
        encode_line(MessageType::QueryStatus, &[])
    }
}

// =============================================================================
// VLINE / SET_RANGE / MSG (out-of-band)
// =============================================================================

/// Vertical marker at a time
#[derive(Debug, Clone)]
pub struct VLine {
    pub time: String,
}

impl VLine {
    pub fn encode(&self) -> Bytes {
        encode_line(MessageType::VLine, &[&self.time])
    }
}

/// Visible replay range
#[derive(Debug, Clone)]
pub struct SetRange {
    pub start: String,
    pub end: String,
}

impl SetRange {
    pub fn encode(&self) -> Bytes {
        encode_line(MessageType::SetRange, &[&self.start, &self.end])
    }
}

/// Free-text diagnostic shown by the client
#[derive(Debug, Clone)]
pub struct Msg {
    pub text: String,
}

impl Msg {
    pub fn encode(&self) -> Bytes {
        encode_line(MessageType::Msg, &[&self.text])
    }
}

// =============================================================================
// Inbound control commands
// =============================================================================

/// A parsed client -> core control frame
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Pause,
    Resume,
    /// Inter-batch delay in seconds
    Speed(f64),
    /// Requested batch size, not yet clamped
    Batch(i64),
    /// Last time key the client rendered
    Status(String),
    /// Only meaningful core -> client; ignored when received
    QueryStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("unknown command '{0}'")]
    Unknown(String),

    #[error("'{prefix}' is not a control command")]
    Outbound { prefix: &'static str },

    #[error("malformed {prefix} payload '{payload}'")]
    Malformed {
        prefix: &'static str,
        payload: String,
    },
}

impl ControlCommand {
    /// Parse one inbound line. Surrounding whitespace is ignored.
    pub fn parse(line: &str) -> Result<Self, FrameError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(FrameError::Empty);
        }

        let (prefix, payload) = match line.split_once(FIELD_SEPARATOR) {
            Some((prefix, payload)) => (prefix.trim(), Some(payload.trim())),
            None => (line, None),
        };

        let msg_type = MessageType::from_prefix(prefix)
            .ok_or_else(|| FrameError::Unknown(prefix.to_string()))?;

        let malformed = |payload: Option<&str>| FrameError::Malformed {
            prefix: msg_type.prefix(),
            payload: payload.unwrap_or_default().to_string(),
        };

        match msg_type {
            MessageType::Pause => Ok(Self::Pause),
            MessageType::Resume => Ok(Self::Resume),
            MessageType::QueryStatus => Ok(Self::QueryStatus),
            MessageType::Speed => payload
                .and_then(|p| p.parse::<f64>().ok())
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(Self::Speed)
                .ok_or_else(|| malformed(payload)),
            MessageType::Batch => payload
                .and_then(|p| p.parse::<i64>().ok())
                .map(Self::Batch)
                .ok_or_else(|| malformed(payload)),
            MessageType::Status => payload
                .filter(|key| !key.is_empty())
                .map(|key| Self::Status(key.to_string()))
                .ok_or_else(|| malformed(payload)),
            MessageType::AddBar | MessageType::VLine | MessageType::SetRange | MessageType::Msg => {
                Err(FrameError::Outbound {
                    prefix: msg_type.prefix(),
                })
            }
        }
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Line reader for inbound frames.
///
/// `next_frame` is cancel safe: a partially received line stays buffered and
/// is completed by the next call, so it can sit in a `select!`.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::with_capacity(256),
        }
    }

    /// Next complete line without its terminator.
    /// Returns `Ok(None)` once the peer has closed its end.
    pub async fn next_frame(&mut self) -> io::Result<Option<String>> {
        // Never buffer more than one byte past the limit
        let limit = (MAX_FRAME_LEN + 1).saturating_sub(self.buf.len()) as u64;
        let n = (&mut self.inner)
            .take(limit)
            .read_until(b'\n', &mut self.buf)
            .await?;
        if n == 0 && self.buf.is_empty() {
            return Ok(None);
        }

        if self.buf.len() > MAX_FRAME_LEN {
            self.buf.clear();
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds {} bytes", MAX_FRAME_LEN),
            ));
        }

        let line = String::from_utf8_lossy(&self.buf)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        self.buf.clear();
        Ok(Some(line))
    }
}

/// Write a pre-encoded frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> io::Result<()> {
    w.write_all(frame).await?;
    w.flush().await
}

// =============================================================================
// Tests
// =============================================================================
