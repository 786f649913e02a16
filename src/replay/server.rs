//! Replay server - binds the channel and hands out sessions.
//!
//! `accept_session` is also the reconnect path: every call waits for a new
//! client and builds a session with fresh control state.

use crate::error::Result;
use crate::replay::channel::{self, ChannelListener};
use crate::replay::fatal::Terminator;
use crate::replay::session::{Session, SessionConfig};
use std::sync::Arc;

pub struct ReplayServer {
    listener: Box<dyn ChannelListener>,
    config: SessionConfig,
    terminator: Arc<dyn Terminator>,
}

impl ReplayServer {
    /// Bind the platform channel under `name`.
    pub fn bind(name: &str, config: SessionConfig, terminator: Arc<dyn Terminator>) -> Result<Self> {
        let listener = channel::bind(name)?;
        Ok(Self::with_listener(listener, config, terminator))
    }

    pub fn with_listener(
        listener: Box<dyn ChannelListener>,
        config: SessionConfig,
        terminator: Arc<dyn Terminator>,
    ) -> Self {
        Self {
            listener,
            config,
            terminator,
        }
    }

    pub fn channel_name(&self) -> &str {
        self.listener.name()
    }

    /// Block until a client connects and wrap it in a new session.
    pub async fn accept_session(&mut self) -> Result<Session> {
        tracing::info!(channel = self.listener.name(), "Waiting for client to connect");
        let (connection, inbound) = self.listener.accept().await?;
        tracing::info!(channel = self.listener.name(), "Client connected");

        Ok(Session::new(
            connection,
            inbound,
            self.config.clone(),
            Arc::clone(&self.terminator),
        ))
    }
}
