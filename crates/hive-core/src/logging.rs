//! Logging infrastructure for hive.
//!
//! Structured logging via the `tracing` ecosystem: a human-readable stderr
//! layer plus an optional JSON-lines file layer. Filter precedence is
//! `RUST_LOG` first, then the cluster debug channel: when the `NODE_DEBUG`
//! environment variable contains the substring `cluster`, the default level
//! for hive crates is raised to `debug`. Supervisor and agent diagnostics
//! carry `pid` and `role` fields so a debug line identifies its process as
//! `<pid>,<master|worker>`.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::error::{HiveError, Result};

/// Environment variable carrying debug-channel selectors.
pub const NODE_DEBUG: &str = "NODE_DEBUG";

/// The selector within [`NODE_DEBUG`] that enables cluster diagnostics.
pub const DEBUG_SELECTOR: &str = "cluster";

/// Guard that must be held to ensure log flushing on shutdown.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Returns true if the debug channel is enabled for the cluster.
pub fn debug_requested(node_debug: Option<&str>) -> bool {
    node_debug.is_some_and(|v| v.contains(DEBUG_SELECTOR))
}

/// Initialize the hive logging system.
///
/// Sets up a compact stderr layer and, when `log_dir` is given, a JSON
/// lines file layer under that directory. `verbose` forces `debug` level;
/// otherwise the level comes from `RUST_LOG`, the `NODE_DEBUG` cluster
/// selector, or defaults to `info`.
///
/// Returns a [`LogGuard`] that must be held for the application lifetime.
pub fn init_logging(log_dir: Option<PathBuf>, verbose: bool) -> Result<LogGuard> {
    let default_level = if verbose || debug_requested(std::env::var(NODE_DEBUG).ok().as_deref()) {
        "debug"
    } else {
        "info"
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hive={default_level}")));

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .with_file(verbose)
        .with_line_number(verbose)
        .compact();

    let (file_layer, file_guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)
                .map_err(|e| HiveError::io(format!("creating log directory {}", dir.display()), e))?;
            let appender = tracing_appender::rolling::daily(&dir, "hive.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .json()
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    tracing::debug!(verbose, "logging initialized");

    Ok(LogGuard {
        _file_guard: file_guard,
    })
}

/// Initialize minimal console-only logging for tests.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_requested() {
        assert!(debug_requested(Some("cluster")));
        assert!(debug_requested(Some("net,cluster,http")));
        assert!(!debug_requested(Some("net")));
        assert!(!debug_requested(None));
    }

    #[test]
    fn test_init_test_logging() {
        // Should not panic, even when called twice
        init_test_logging();
        init_test_logging();
    }
}
