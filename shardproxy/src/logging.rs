//! Logging and the slow-log (§10.3): a `tracing-subscriber` fmt layer to
//! stderr or a log file, verbosity driven by `-v`/config, plus a second
//! non-blocking file writer gated on the `slowlog` target.

use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Guards returned by `init` must stay alive for the process lifetime — the
/// non-blocking writers they back flush on drop (`tracing-appender`'s
/// documented contract).
pub struct LoggingGuards {
    _main: Option<WorkerGuard>,
    _slow: Option<WorkerGuard>,
}

fn level_for(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initializes the primary `tracing` subscriber and, if `slow_log_file` is
/// set, a second filtered target writing `{ts, pool, command, key,
/// elapsed_ms}` lines once a request exceeds the slow-query threshold.
pub fn init(verbosity: u8, log_file: Option<&Path>, slow_log_file: Option<&Path>) -> LoggingGuards {
    let level = level_for(verbosity);
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let (writer, main_guard) = match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
            let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "shardproxy.log".to_string());
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let main_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_filter(env_filter);

    let (slow_layer, slow_guard) = match slow_log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "slow.log".to_string());
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_target(false)
                .with_filter(tracing_subscriber::filter::Targets::new().with_target("slowlog", Level::WARN));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(main_layer)
        .with(slow_layer)
        .init();

    LoggingGuards {
        _main: main_guard,
        _slow: slow_guard,
    }
}
