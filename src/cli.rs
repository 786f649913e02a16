use clap::{Args, Parser, Subcommand};
use replay_bridge::config::ReplayConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "replay-bridge")]
#[command(about = "Replay historical bars to a chart client over a local channel", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Config file (TOML)
    #[arg(short, long, global = true, env = "REPLAY_BRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stream bars to the client, resuming after its last rendered bar
    Stream(StreamArgs),

    /// Step through points of interest, drawing a marker on each
    Markers(MarkersArgs),

    /// Send a test message and marker to check the client is listening
    Probe(ProbeArgs),
}

#[derive(Args, Debug)]
pub struct ChannelArgs {
    /// Socket path (Unix) or pipe name (Windows)
    #[arg(long, env = "REPLAY_BRIDGE_CHANNEL")]
    pub channel: Option<String>,
}

#[derive(Args, Debug)]
pub struct DataArgs {
    /// Bar CSV file
    #[arg(long, env = "REPLAY_BRIDGE_DATA")]
    pub data: Option<PathBuf>,

    /// Keep only bars from this calendar year
    #[arg(long)]
    pub year: Option<i32>,
}

#[derive(Args, Debug)]
pub struct StreamArgs {
    #[command(flatten)]
    pub channel: ChannelArgs,

    #[command(flatten)]
    pub data: DataArgs,

    /// Initial delay between batches in seconds
    #[arg(long)]
    pub delay: Option<f64>,

    /// Initial batch size (1-10)
    #[arg(long)]
    pub batch: Option<i64>,

    /// Start streaming without waiting for RESUME
    #[arg(long)]
    pub start_running: bool,

    /// Send SET_RANGE with the series bounds after the handshake
    #[arg(long)]
    pub send_range: bool,

    /// Print the session report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct MarkersArgs {
    #[command(flatten)]
    pub channel: ChannelArgs,

    #[command(flatten)]
    pub data: DataArgs,

    /// Minimum relative candle body for a point of interest
    #[arg(long)]
    pub threshold: Option<f64>,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub channel: ChannelArgs,

    /// Time key for the test marker
    #[arg(long, default_value = "2024.01.01 00:00")]
    pub marker_time: String,
}

impl ChannelArgs {
    pub fn apply(&self, config: &mut ReplayConfig) {
        if let Some(channel) = &self.channel {
            config.channel = channel.clone();
        }
    }
}

impl DataArgs {
    pub fn apply(&self, config: &mut ReplayConfig) {
        if let Some(data) = &self.data {
            config.data = Some(data.clone());
        }
        if self.year.is_some() {
            config.year = self.year;
        }
    }
}

impl StreamArgs {
    pub fn apply(&self, config: &mut ReplayConfig) {
        self.channel.apply(config);
        self.data.apply(config);
        if let Some(delay) = self.delay {
            config.delay_secs = delay;
        }
        if let Some(batch) = self.batch {
            config.batch_size = batch;
        }
        if self.start_running {
            config.start_paused = false;
        }
        if self.send_range {
            config.send_range = true;
        }
    }
}

impl MarkersArgs {
    pub fn apply(&self, config: &mut ReplayConfig) {
        self.channel.apply(config);
        self.data.apply(config);
        if let Some(threshold) = self.threshold {
            config.markers.threshold = threshold;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_overrides_config() {
        let cli = Cli::try_parse_from([
            "replay-bridge",
            "stream",
            "--data",
            "bars.csv",
            "--delay",
            "0.5",
            "--batch",
            "3",
            "--start-running",
        ])
        .unwrap();

        let Command::Stream(args) = cli.command else {
            panic!("expected stream");
        };
        let mut config = ReplayConfig::default();
        args.apply(&mut config);
        assert_eq!(config.data, Some(PathBuf::from("bars.csv")));
        assert_eq!(config.delay_secs, 0.5);
        assert_eq!(config.batch_size, 3);
        assert!(!config.start_paused);
        assert!(!config.send_range);
    }

    #[test]
    fn test_verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["replay-bridge", "-v", "-q", "probe"]).is_err());
    }
}
