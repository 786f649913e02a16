#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use replay_bridge::bars::{Bar, BarSeries};
use replay_bridge::replay::{ChannelListener, Connection, FrameReader, InboundFrames, Terminator};
use replay_bridge::{ReplayError, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{DuplexStream, ReadHalf};
use tokio::sync::mpsc;

pub const BUFFER: usize = 64 * 1024;

/// Hourly bars on 2024.01.02 starting at `first_hour`
pub fn hourly_bars(first_hour: u32, count: u32) -> BarSeries {
    let day = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
    BarSeries::new(
        (0..count)
            .map(|i| Bar {
                time: day.and_hms_opt(first_hour + i, 0, 0).unwrap(),
                open: 1.1,
                high: 1.2,
                low: 1.0,
                close: 1.15,
                volume: 100 + i as u64,
            })
            .collect(),
    )
}

/// Terminator that records instead of exiting
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

/// In-memory channel listener; each `connect` on the paired connector
/// becomes one accepted client.
pub struct DuplexListener {
    incoming: mpsc::UnboundedReceiver<DuplexStream>,
    accepted: usize,
}

#[derive(Clone)]
pub struct DuplexConnector {
    outgoing: mpsc::UnboundedSender<DuplexStream>,
}

pub fn duplex_listener() -> (DuplexListener, DuplexConnector) {
    let (outgoing, incoming) = mpsc::unbounded_channel();
    (
        DuplexListener {
            incoming,
            accepted: 0,
        },
        DuplexConnector { outgoing },
    )
}

impl DuplexConnector {
    pub fn connect(&self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(BUFFER);
        self.outgoing.send(server).unwrap();
        client
    }
}

#[async_trait]
impl ChannelListener for DuplexListener {
    fn name(&self) -> &str {
        "duplex"
    }

    async fn accept(&mut self) -> Result<(Arc<Connection>, InboundFrames)> {
        let stream = self
            .incoming
            .recv()
            .await
            .ok_or_else(|| ReplayError::ChannelClosed("no more clients".to_string()))?;
        self.accepted += 1;
        Ok(Connection::from_stream(
            stream,
            format!("client-{}", self.accepted),
        ))
    }
}

/// Next frame, or `None` if nothing arrives within `wait`
pub async fn frame_within(
    reader: &mut FrameReader<ReadHalf<DuplexStream>>,
    wait: Duration,
) -> Option<String> {
    tokio::time::timeout(wait, reader.next_frame())
        .await
        .ok()
        .and_then(|frame| frame.unwrap())
}
