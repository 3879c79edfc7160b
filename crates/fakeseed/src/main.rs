use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use libfakeseed::{
    Session, SessionOptions,
    config::SeedConfig,
    events::SeedEvent,
    manifest::load_manifest,
    spawn_utils::spawn,
    tracing_subscriber_config_utils::{InitLoggingOptions, init_logging},
};
use size_format::SizeFormatterBinary as SF;
use tokio::{io::AsyncBufReadExt, sync::broadcast::error::RecvError};
use tracing::{debug, error_span, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Parser)]
#[command(version, author, about)]
struct Opts {
    /// The console loglevel
    #[arg(value_enum, short = 'v')]
    log_level: Option<LogLevel>,

    /// The log filename to also write to in addition to the console.
    #[arg(long = "log-file", env = "FAKESEED_LOG_FILE")]
    log_file: Option<String>,

    /// The value for RUST_LOG in the log file
    #[arg(
        long = "log-file-rust-log",
        default_value = "info,libfakeseed=debug",
        env = "FAKESEED_LOG_FILE_RUST_LOG"
    )]
    log_file_rust_log: String,

    /// JSON configuration file. Defaults are used for anything missing.
    #[arg(short = 'c', long = "config", env = "FAKESEED_CONFIG")]
    config: Option<PathBuf>,

    /// How long to wait for trackers to acknowledge STOP on exit, e.g. 10s.
    /// Overrides the configuration file.
    #[arg(long = "stop-timeout", value_parser = parse_duration::parse)]
    stop_timeout: Option<Duration>,

    /// How often to print stats, e.g. 1m. 0 disables.
    #[arg(long = "stats-interval", value_parser = parse_duration::parse, default_value = "1m")]
    stats_interval: Duration,

    /// Read new RUST_LOG values from stdin, one per line.
    #[arg(long = "reload-log-from-stdin")]
    reload_log_from_stdin: bool,

    /// Set this flag if you want to use tokio's single threaded runtime.
    #[arg(short, long)]
    single_thread_runtime: bool,

    /// How many threads to spawn for the executor.
    #[arg(short = 't', long)]
    worker_threads: Option<usize>,

    /// Torrent manifests (JSON) to seed.
    #[arg(required = true)]
    manifests: Vec<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let mut rt_builder = match opts.single_thread_runtime {
        true => tokio::runtime::Builder::new_current_thread(),
        false => {
            let mut b = tokio::runtime::Builder::new_multi_thread();
            if let Some(e) = opts.worker_threads {
                b.worker_threads(e);
            }
            b
        }
    };

    let rt = rt_builder.enable_time().enable_io().build()?;

    rt.block_on(async_main(opts))
}

async fn async_main(opts: Opts) -> anyhow::Result<()> {
    let log_config = init_logging(InitLoggingOptions {
        default_rust_log_value: Some(match opts.log_level.unwrap_or(LogLevel::Info) {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }),
        log_file: opts.log_file.as_deref(),
        log_file_rust_log: Some(&opts.log_file_rust_log),
    })?;

    if opts.reload_log_from_stdin {
        let reload_tx = log_config.rust_log_reload_tx;
        spawn(error_span!("stdin_rust_log_reader"), async move {
            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await.context("error reading stdin")? {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if reload_tx.send(line.to_owned()).is_err() {
                    break;
                }
            }
            Ok(())
        });
    }

    let mut config = match &opts.config {
        Some(path) => SeedConfig::from_json_file(path)?,
        None => SeedConfig::default(),
    };
    if let Some(stop_timeout) = opts.stop_timeout {
        config.stop_timeout = stop_timeout;
    }

    let session = Session::new(SessionOptions {
        config,
        ..Default::default()
    })
    .context("error initializing fakeseed session")?;
    info!(peer_id = ?session.peer_id(), "session created");

    for path in opts.manifests.iter() {
        for meta in load_manifest(path)? {
            let name = meta.display_name();
            if let Err(e) = session.add_torrent(meta) {
                warn!(%name, "error adding torrent: {e:#}");
            }
        }
    }
    if session.torrents().is_empty() {
        anyhow::bail!("no torrents to seed");
    }

    spawn(
        error_span!("event_logger"),
        log_events(session.events().subscribe()),
    );
    if !opts.stats_interval.is_zero() {
        spawn(
            error_span!("stats_printer"),
            print_stats(session.clone(), opts.stats_interval),
        );
    }

    session.start();
    tokio::signal::ctrl_c()
        .await
        .context("error waiting for Ctrl-C")?;
    info!("Ctrl-C received, stopping");
    session.stop().await;
    print_summary(&session);
    Ok(())
}

async fn log_events(mut rx: tokio::sync::broadcast::Receiver<SeedEvent>) -> anyhow::Result<()> {
    loop {
        match rx.recv().await {
            Ok(SeedEvent::AnnounceFailed {
                info_hash,
                tracker,
                event,
                error,
            }) => {
                warn!(info_hash = %info_hash.short(), %tracker, %event, "announce failed: {error}")
            }
            Ok(SeedEvent::AnnounceSucceeded {
                info_hash,
                tracker,
                event,
                interval_secs,
                seeders,
                leechers,
            }) => info!(
                info_hash = %info_hash.short(),
                %tracker,
                %event,
                interval_secs,
                seeders,
                leechers,
                "announced"
            ),
            Ok(SeedEvent::GlobalBandwidthChanged { bytes_per_second }) => {
                info!("upload rate is now {}/s", SF::new(bytes_per_second))
            }
            Ok(e) => debug!(event = ?e),
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "event logger fell behind"),
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

async fn print_stats(session: Arc<Session>, every: Duration) -> anyhow::Result<()> {
    loop {
        tokio::time::sleep(every).await;
        if !session.is_running() {
            continue;
        }
        info!(
            "upload rate {}/s, {} torrents",
            SF::new(session.current_bandwidth()),
            session.torrents().len()
        );
        print_summary(&session);
    }
}

fn print_summary(session: &Session) {
    for t in session.torrents() {
        info!(
            "[{}] {:?}: uploaded {}, seeders {}, leechers {}",
            t.name,
            t.state,
            SF::new(t.stats.uploaded),
            t.swarm.seeders,
            t.swarm.leechers,
        );
    }
}
