//! On-disk configuration.
//!
//! A TOML file with every field optional; missing fields fall back to the
//! session defaults. Command-line flags override whatever the file says.

use crate::error::{ReplayError, Result};
use crate::replay::{
    ControlDefaults, SessionConfig, SyncConfig, DEFAULT_CHANNEL_NAME, DEFAULT_DELAY,
    MAX_BATCH_SIZE, MIN_BATCH_SIZE, PAUSE_POLL,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Relative candle body above which a bar counts as a point of interest
pub const DEFAULT_MARKER_THRESHOLD: f64 = 0.002;

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    }
    match (path_str.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplayConfig {
    /// Socket path or pipe name
    pub channel: String,
    /// Bar CSV file
    pub data: Option<PathBuf>,
    /// Keep only bars from this calendar year
    pub year: Option<i32>,
    pub delay_secs: f64,
    pub batch_size: i64,
    pub start_paused: bool,
    /// Send SET_RANGE after the handshake
    pub send_range: bool,
    pub pause_poll_ms: u64,
    pub sync: SyncSection,
    pub markers: MarkersSection,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL_NAME.to_string(),
            data: None,
            year: None,
            delay_secs: DEFAULT_DELAY.as_secs_f64(),
            batch_size: MIN_BATCH_SIZE as i64,
            start_paused: true,
            send_range: false,
            pause_poll_ms: PAUSE_POLL.as_millis() as u64,
            sync: SyncSection::default(),
            markers: MarkersSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSection {
    pub initial_wait_secs: f64,
    pub query_wait_secs: f64,
    pub query_attempts: u32,
    pub query_backoff_ms: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        let sync = SyncConfig::default();
        Self {
            initial_wait_secs: sync.initial_wait.as_secs_f64(),
            query_wait_secs: sync.query_wait.as_secs_f64(),
            query_attempts: sync.query_attempts,
            query_backoff_ms: sync.query_backoff.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MarkersSection {
    pub threshold: f64,
}

impl Default for MarkersSection {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MARKER_THRESHOLD,
        }
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| ReplayError::Config(format!("{} must be a non-negative number, got {}", field, value)))
}

impl ReplayConfig {
    /// Read a config file. A missing file is an error; use `Default` when
    /// no file was given.
    pub fn load(path: &Path) -> Result<Self> {
        let path = expand_tilde(path);
        let text = std::fs::read_to_string(&path).map_err(|e| {
            ReplayError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        toml::from_str(&text)
            .map_err(|e| ReplayError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ReplayError::Config(e.to_string()))
    }

    /// Data path with `~` expanded
    pub fn data_path(&self) -> Option<PathBuf> {
        self.data.as_deref().map(expand_tilde)
    }

    /// Channel name with `~` expanded (socket paths only; pipe names pass
    /// through untouched)
    pub fn channel_name(&self) -> String {
        expand_tilde(Path::new(&self.channel))
            .to_string_lossy()
            .into_owned()
    }

    /// Validate and convert into session timings.
    pub fn session_config(&self) -> Result<SessionConfig> {
        if !(MIN_BATCH_SIZE as i64..=MAX_BATCH_SIZE as i64).contains(&self.batch_size) {
            return Err(ReplayError::Config(format!(
                "batch_size must be between {} and {}, got {}",
                MIN_BATCH_SIZE, MAX_BATCH_SIZE, self.batch_size
            )));
        }
        if self.pause_poll_ms == 0 {
            return Err(ReplayError::Config("pause_poll_ms must be positive".to_string()));
        }
        if !(self.markers.threshold.is_finite() && self.markers.threshold >= 0.0) {
            return Err(ReplayError::Config(format!(
                "markers.threshold must be a non-negative number, got {}",
                self.markers.threshold
            )));
        }

        let sync = SyncConfig {
            initial_wait: seconds("sync.initial_wait_secs", self.sync.initial_wait_secs)?,
            query_wait: seconds("sync.query_wait_secs", self.sync.query_wait_secs)?,
            query_attempts: self.sync.query_attempts,
            query_backoff: Duration::from_millis(self.sync.query_backoff_ms),
        };

        Ok(SessionConfig {
            sync,
            control: ControlDefaults {
                paused: self.start_paused,
                delay: seconds("delay_secs", self.delay_secs)?,
                batch_size: self.batch_size as usize,
            },
            pause_poll: Duration::from_millis(self.pause_poll_ms),
            announce_range: self.send_range,
        })
    }
}
