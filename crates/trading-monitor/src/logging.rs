//! Logging setup.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber.
///
/// `RUST_LOG` overrides `level` when set. With `file`, logs are also
/// written to a daily-rolling file next to the given path; keep the
/// returned guard alive until exit or buffered lines are lost.
pub fn setup_logging(level: &str, json: bool, file: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let mut layers: Vec<BoxedLayer> = Vec::new();
    let console = fmt::layer().with_writer(std::io::stderr);
    layers.push(if json {
        console.json().boxed()
    } else {
        console.pretty().boxed()
    });

    let guard = file.map(|path| {
        let (dir, name) = split_log_path(path);
        let appender = tracing_appender::rolling::daily(dir, name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer().with_ansi(false).with_writer(writer);
        layers.push(if json { layer.json().boxed() } else { layer.boxed() });
        guard
    });

    // A second call (tests, embedding) keeps the first subscriber
    if tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global subscriber already installed");
    }
    guard
}

/// Directory and file-name prefix for the rolling appender.
fn split_log_path(path: &Path) -> (PathBuf, OsString) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("trading-bot.log"));
    (dir, name)
}
