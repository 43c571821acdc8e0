use std::path::Path;

use tracing_appender::rolling;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use fg_config::LoggingSettings;
use fg_types::{FlowgateError, Result};

const DEFAULT_LOG_FILE: &str = "flowgate.log";

/// Initialize the tracing/logging system.
///
/// Console output is human-readable or JSON; an optional daily-rolling file
/// layer mirrors it without ANSI colours. `RUST_LOG` overrides the level.
pub fn init_logging(settings: &LoggingSettings) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));

    let console = if settings.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_ansi(true)
            .boxed()
    };

    let file = settings.file.as_deref().map(|path| {
        let (dir, filename) = split_log_path(path);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(rolling::daily(dir, filename))
            .with_target(true)
            .with_ansi(false);
        if settings.json {
            layer.json().boxed()
        } else {
            layer.boxed()
        }
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| FlowgateError::Config(format!("Logging already initialized: {e}")))
}

fn split_log_path(path: &Path) -> (&Path, String) {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| DEFAULT_LOG_FILE.to_string());
    (dir, filename)
}
