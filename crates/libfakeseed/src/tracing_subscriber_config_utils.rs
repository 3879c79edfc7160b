use std::{fs::File, io::LineWriter, sync::Mutex};

use anyhow::Context;
use libfakeseed_core::spawn_utils::spawn;
use tracing::{error_span, info, warn};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

/// What goes to the JSON log file unless told otherwise.
pub const DEFAULT_LOG_FILE_RUST_LOG: &str =
    "info,libfakeseed=debug,libfakeseed_tracker_comms=debug";

pub struct InitLoggingOptions<'a> {
    /// Used for stderr when RUST_LOG isn't set.
    pub default_rust_log_value: Option<&'a str>,
    pub log_file: Option<&'a str>,
    pub log_file_rust_log: Option<&'a str>,
}

pub struct InitLoggingResult {
    /// Send a new RUST_LOG value here to change what gets printed to stderr.
    pub rust_log_reload_tx: tokio::sync::mpsc::UnboundedSender<String>,
}

fn parse_filter(rust_log: &str) -> anyhow::Result<EnvFilter> {
    EnvFilter::builder()
        .parse(rust_log)
        .with_context(|| format!("can't parse filter {rust_log:?}"))
}

fn stderr_filter(default_rust_log: &str) -> anyhow::Result<EnvFilter> {
    match std::env::var("RUST_LOG") {
        Ok(rust_log) => parse_filter(&rust_log).context("invalid RUST_LOG value"),
        Err(_) => parse_filter(default_rust_log),
    }
}

fn open_log_file(path: &str) -> anyhow::Result<Mutex<LineWriter<File>>> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("error opening log file {path:?}"))?;
    Ok(Mutex::new(LineWriter::new(file)))
}

/// Logs to stderr, and as JSON lines to `log_file` if given. Must be called from within a
/// tokio runtime.
#[inline(never)]
pub fn init_logging(opts: InitLoggingOptions) -> anyhow::Result<InitLoggingResult> {
    let (stderr_filter, reload_handle) =
        reload::Layer::new(stderr_filter(opts.default_rust_log_value.unwrap_or("info"))?);

    let file_layer = match opts.log_file {
        Some(path) => Some(
            fmt::layer()
                .with_ansi(false)
                .json()
                .with_writer(open_log_file(path)?)
                .with_filter(parse_filter(
                    opts.log_file_rust_log.unwrap_or(DEFAULT_LOG_FILE_RUST_LOG),
                )?),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_filter(stderr_filter))
        .with(file_layer)
        .try_init()
        .context("can't init logging")?;

    let (reload_tx, mut reload_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    spawn(error_span!("rust_log_reloader"), async move {
        while let Some(rust_log) = reload_rx.recv().await {
            if let Err(e) = reload_stderr_filter(&reload_handle, &rust_log) {
                warn!("{e:#}");
            }
        }
        Ok(())
    });
    Ok(InitLoggingResult {
        rust_log_reload_tx: reload_tx,
    })
}

fn reload_stderr_filter(
    handle: &reload::Handle<EnvFilter, Registry>,
    rust_log: &str,
) -> anyhow::Result<()> {
    let filter = parse_filter(rust_log)?;
    handle
        .reload(filter)
        .context("logging subscriber is gone")?;
    info!(rust_log, "stderr filter changed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filter() {
        assert!(parse_filter(DEFAULT_LOG_FILE_RUST_LOG).is_ok());
        assert!(parse_filter("debug,libfakeseed::orchestrator=trace").is_ok());
        assert!(parse_filter("libfakeseed=notalevel").is_err());
    }
}
