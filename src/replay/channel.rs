//! Channel endpoint - the local duplex stream to the chart client.
//!
//! Provides the listener that accepts exactly one client and the
//! `Connection` the session writes to. Inbound frames are read through a
//! `FrameReader` over the read half, owned by the command listener.

use crate::error::{ReplayError, Result};
use crate::replay::protocol::{write_frame, FrameReader};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

pub type BoxedReader = Box<dyn AsyncRead + Send + Sync + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Reader half handed to the command listener
pub type InboundFrames = FrameReader<BoxedReader>;

/// Default channel name for this platform
#[cfg(unix)]
pub const DEFAULT_CHANNEL_NAME: &str = "/tmp/replay_bridge.sock";

#[cfg(windows)]
pub const DEFAULT_CHANNEL_NAME: &str = r"\\.\pipe\Replay_Bridge";

// =============================================================================
// Connection
// =============================================================================

/// Write side of an accepted connection.
///
/// Shared by the producer (data frames), the sync resolver (QUERY_STATUS)
/// and whichever task detects a failure (close). `close` is idempotent.
pub struct Connection {
    peer: String,
    writer: Mutex<Option<BoxedWriter>>,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(writer: BoxedWriter, peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            writer: Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
        }
    }

    /// Split a duplex stream into a shared connection and its inbound frames.
    pub fn from_stream<S>(stream: S, peer: impl Into<String>) -> (Arc<Connection>, InboundFrames)
    where
        S: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let connection = Arc::new(Connection::new(Box::new(write_half), peer));
        let reader: BoxedReader = Box::new(read_half);
        (connection, FrameReader::new(reader))
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Send one encoded frame. Any write fault is a channel error.
    pub async fn send(&self, frame: &Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(ReplayError::ChannelClosed(format!(
                "connection to {} already closed",
                self.peer
            )));
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| {
            ReplayError::ChannelClosed(format!("connection to {} already closed", self.peer))
        })?;

        write_frame(writer, frame)
            .await
            .map_err(|e| ReplayError::channel(format!("writing to {}", self.peer), e))
    }

    /// Close the write side. Safe to call any number of times from any task;
    /// errors from the shutdown itself are ignored.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(peer = %self.peer, "Ignoring error while closing channel: {}", e);
            }
        }
        tracing::debug!(peer = %self.peer, "Channel closed");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .finish()
    }
}

// =============================================================================
// Listener
// =============================================================================

/// Accepts client connections on one named channel.
#[async_trait]
pub trait ChannelListener: Send {
    /// Channel name or path the listener is bound to
    fn name(&self) -> &str;

    /// Wait until a client connects.
    async fn accept(&mut self) -> Result<(Arc<Connection>, InboundFrames)>;
}

/// Bind the platform listener for `name`.
pub fn bind(name: &str) -> Result<Box<dyn ChannelListener>> {
    #[cfg(unix)]
    {
        Ok(Box::new(unix::UnixSocketListener::bind(name)?))
    }
    #[cfg(windows)]
    {
        Ok(Box::new(windows::NamedPipeListener::bind(name)?))
    }
}

#[cfg(unix)]
pub mod unix {
    use super::*;
    use std::path::{Path, PathBuf};
    use tokio::net::UnixListener;

    /// Unix domain socket listener at a filesystem path
    pub struct UnixSocketListener {
        name: String,
        path: PathBuf,
        listener: UnixListener,
    }

    impl UnixSocketListener {
        pub fn bind(name: &str) -> Result<Self> {
            let path = Path::new(name).to_path_buf();

            // A socket file left by a previous run blocks bind
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| {
                    ReplayError::channel(format!("removing stale socket {}", path.display()), e)
                })?;
            }

            let listener = UnixListener::bind(&path)
                .map_err(|e| ReplayError::channel(format!("binding {}", path.display()), e))?;

            Ok(Self {
                name: name.to_string(),
                path,
                listener,
            })
        }
    }

    #[async_trait]
    impl ChannelListener for UnixSocketListener {
        fn name(&self) -> &str {
            &self.name
        }

        async fn accept(&mut self) -> Result<(Arc<Connection>, InboundFrames)> {
            let (stream, _addr) = self
                .listener
                .accept()
                .await
                .map_err(|e| ReplayError::channel(format!("accepting on {}", self.name), e))?;
            Ok(Connection::from_stream(stream, self.name.clone()))
        }
    }

    impl Drop for UnixSocketListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(windows)]
pub mod windows {
    use super::*;
    use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};

    /// Single-instance duplex named pipe
    pub struct NamedPipeListener {
        name: String,
        next: Option<NamedPipeServer>,
    }

    impl NamedPipeListener {
        pub fn bind(name: &str) -> Result<Self> {
            let server = Self::create(name)?;
            Ok(Self {
                name: name.to_string(),
                next: Some(server),
            })
        }

        fn create(name: &str) -> Result<NamedPipeServer> {
            ServerOptions::new()
                .first_pipe_instance(true)
                .max_instances(1)
                .in_buffer_size(65536)
                .out_buffer_size(65536)
                .create(name)
                .map_err(|e| ReplayError::channel(format!("creating pipe {}", name), e))
        }
    }

    #[async_trait]
    impl ChannelListener for NamedPipeListener {
        fn name(&self) -> &str {
            &self.name
        }

        async fn accept(&mut self) -> Result<(Arc<Connection>, InboundFrames)> {
            // The previous instance must be gone before a new one can exist
            let server = match self.next.take() {
                Some(server) => server,
                None => Self::create(&self.name)?,
            };
            server
                .connect()
                .await
                .map_err(|e| ReplayError::channel(format!("connecting {}", self.name), e))?;
            Ok(Connection::from_stream(server, self.name.clone()))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_send_reaches_peer() {
        let (client, server) = tokio::io::duplex(1024);
        let (connection, _inbound) = Connection::from_stream(server, "test");

        connection.send(&Bytes::from_static(b"QUERY_STATUS\n")).await.unwrap();

        let mut client = client;
        let mut buf = [0u8; 13];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"QUERY_STATUS\n");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_client, server) = tokio::io::duplex(1024);
        let (connection, _inbound) = Connection::from_stream(server, "test");

        assert!(connection.is_open());
        connection.close().await;
        connection.close().await;
        assert!(!connection.is_open());

        let err = connection
            .send(&Bytes::from_static(b"PAUSE\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::ChannelClosed(_)));
    }

    #[tokio::test]
    async fn test_concurrent_close() {
        let (_client, server) = tokio::io::duplex(1024);
        let (connection, _inbound) = Connection::from_stream(server, "test");

        let a = {
            let c = Arc::clone(&connection);
            tokio::spawn(async move { c.close().await })
        };
        let b = {
            let c = Arc::clone(&connection);
            tokio::spawn(async move { c.close().await })
        };
        a.await.unwrap();
        b.await.unwrap();
        assert!(!connection.is_open());
    }

    #[tokio::test]
    async fn test_send_to_vanished_peer_is_channel_error() {
        let (client, server) = tokio::io::duplex(64);
        let (connection, _inbound) = Connection::from_stream(server, "test");
        drop(client);

        let err = connection
            .send(&Bytes::from_static(b"ADD_BAR|x\n"))
            .await
            .unwrap_err();
        assert!(err.is_channel_fatal());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_listener_accepts_one_client() {
        use tokio::net::UnixStream;

        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("bridge.sock");
        let name = path.to_string_lossy().into_owned();

        let mut listener = unix::UnixSocketListener::bind(&name).unwrap();
        assert_eq!(listener.name(), name);

        let client = tokio::spawn({
            let path = path.clone();
            async move {
                let mut stream = UnixStream::connect(&path).await.unwrap();
                stream.write_all(b"RESUME\n").await.unwrap();
                stream
            }
        });

        let (connection, mut inbound) = listener.accept().await.unwrap();
        assert_eq!(inbound.next_frame().await.unwrap(), Some("RESUME".into()));
        assert!(connection.is_open());
        let _stream = client.await.unwrap();

        drop(listener);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_listener_replaces_stale_socket() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("stale.sock");
        std::fs::write(&path, b"").unwrap();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let listener = unix::UnixSocketListener::bind(&path.to_string_lossy());
        assert!(listener.is_ok());
    }
}
