mod cli;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Cli, Command, ProbeArgs, StreamArgs};
use colored::Colorize;
use replay_bridge::bars::{load_csv, BarSeries, LoadOptions};
use replay_bridge::config::ReplayConfig;
use replay_bridge::replay::{ExitProcess, ReplayServer, SessionConfig, SessionReport, SyncOutcome};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Pause between the probe's frames so both show up on the client
const PROBE_STEP: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let mut config = match &cli.config {
        Some(path) => ReplayConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ReplayConfig::default(),
    };

    match cli.command {
        Command::Stream(args) => {
            args.apply(&mut config);
            stream(&config, &args).await
        }
        Command::Markers(args) => {
            args.apply(&mut config);
            markers(&config).await
        }
        Command::Probe(args) => {
            args.channel.apply(&mut config);
            probe(&config, &args).await
        }
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default_level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_bars(config: &ReplayConfig) -> Result<BarSeries> {
    let Some(path) = config.data_path() else {
        bail!("No bar data given (use --data or set `data` in the config file)");
    };
    let options = LoadOptions { year: config.year };
    load_csv(&path, &options).with_context(|| format!("Failed to load bars from {}", path.display()))
}

fn bind(config: &ReplayConfig, session: SessionConfig) -> Result<ReplayServer> {
    let channel = config.channel_name();
    ReplayServer::bind(&channel, session, Arc::new(ExitProcess::default()))
        .with_context(|| format!("Failed to open channel {}", channel))
}

// ============================================================================
// stream
// ============================================================================

async fn stream(config: &ReplayConfig, args: &StreamArgs) -> Result<()> {
    let bars = load_bars(config)?;
    let session_config = config.session_config()?;
    let mut server = bind(config, session_config)?;

    if !args.json {
        println!(
            "{} {} bars, waiting on {}",
            "Loaded".green().bold(),
            bars.len(),
            server.channel_name().cyan()
        );
    }

    let session = server.accept_session().await?;
    let report = tokio::select! {
        report = session.run(&bars) => report?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, closing session");
            return Ok(());
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &SessionReport) {
    let sync = match &report.sync {
        SyncOutcome::Resumed { checkpoint, .. } => format!("resumed after {}", checkpoint),
        SyncOutcome::CheckpointNotFound { checkpoint } => {
            format!("checkpoint {} not found, replayed from start", checkpoint)
                .yellow()
                .to_string()
        }
        SyncOutcome::NoCheckpoint => "no checkpoint, replayed from start".yellow().to_string(),
    };

    println!("{}", "Replay finished".green().bold());
    println!("  Client:     {}", report.peer);
    println!("  Sync:       {}", sync);
    println!(
        "  Bars sent:  {} ({} -> {} of {})",
        report.bars_sent, report.start_index, report.final_index, report.total_bars
    );
}

// ============================================================================
// markers
// ============================================================================

/// Position in the list of points of interest
#[derive(Debug, Default)]
struct MarkerCursor {
    current: Option<usize>,
}

impl MarkerCursor {
    fn next(&mut self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let next = self.current.map_or(0, |i| (i + 1).min(len - 1));
        self.current = Some(next);
        self.current
    }

    fn previous(&mut self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let prev = self.current.map_or(0, |i| i.saturating_sub(1));
        self.current = Some(prev);
        self.current
    }
}

fn prompt(position: Option<usize>, total: usize) -> Result<()> {
    let shown = position.map_or(0, |i| i + 1);
    print!("\nPoint [{}/{}] (Enter=next, p=previous, q=quit) > ", shown, total);
    std::io::stdout().flush()?;
    Ok(())
}

async fn markers(config: &ReplayConfig) -> Result<()> {
    let bars = load_bars(config)?;
    // Validates the marker threshold
    config.session_config()?;
    let points = bars.points_of_interest(config.markers.threshold);
    if points.is_empty() {
        bail!(
            "No bars with a body above {} in {} bars",
            config.markers.threshold,
            bars.len()
        );
    }
    println!(
        "{} {} points of interest in {} bars",
        "Found".green().bold(),
        points.len(),
        bars.len()
    );

    let mut server = bind(config, SessionConfig::default())?;
    let mut session = server.accept_session().await?;
    session.start_listener();

    if let (Some(first), Some(last)) = (bars.first(), bars.last()) {
        session.send_range(&first.time_key(), &last.time_key()).await?;
    }

    let mut cursor = MarkerCursor::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let control = Arc::clone(session.control());

    loop {
        prompt(cursor.current, points.len())?;
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = control.wait_stopped() => break,
        };
        let Some(line) = line else { break };

        let position = match line.trim().to_lowercase().as_str() {
            "q" => break,
            "p" => cursor.previous(points.len()),
            _ => cursor.next(points.len()),
        };
        let Some(bar) = position.and_then(|i| bars.get(points[i])) else {
            continue;
        };

        let key = bar.time_key();
        println!("{} {} close {}", "Marker".cyan().bold(), key, bar.close);
        session.send_marker(&key).await?;
    }

    session.finish().await;
    Ok(())
}

// ============================================================================
// probe
// ============================================================================

async fn probe(config: &ReplayConfig, args: &ProbeArgs) -> Result<()> {
    let mut server = bind(config, SessionConfig::default())?;
    let mut session = server.accept_session().await?;

    session.send_message("System Check: OK").await?;
    tokio::time::sleep(PROBE_STEP).await;
    session.send_marker(&args.marker_time).await?;
    tokio::time::sleep(PROBE_STEP).await;

    session.finish().await;
    println!("{} client on {}", "Probed".green().bold(), server.channel_name());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_cursor_stays_in_bounds() {
        let mut cursor = MarkerCursor::default();
        assert_eq!(cursor.previous(3), Some(0));
        assert_eq!(cursor.next(3), Some(1));
        assert_eq!(cursor.next(3), Some(2));
        assert_eq!(cursor.next(3), Some(2));
        assert_eq!(cursor.previous(3), Some(1));
        assert_eq!(MarkerCursor::default().next(0), None);
    }
}
