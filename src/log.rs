//! Structured logging setup, mirroring the teacher's `slog` stack:
//! async-draining, JSON-formatted, filterable by env directives, and
//! installed as the global `log` facade so that dependencies emitting
//! through `log::*` are captured in the same stream.

use slog::Drain;

/// Builds and installs the global logger. Returns a guard that must be
/// kept alive for the process lifetime; dropping it stops the async
/// drain's worker thread.
#[must_use]
pub fn init() -> slog_scope::GlobalLoggerGuard {
    let drain = slog_json::Json::default(std::io::stdout()).fuse();
    let drain = slog_envlogger::new(drain);
    let drain = slog_async::Async::new(drain).build().fuse();
    let logger = slog::Logger::root(drain, slog::o!("component" => "confcore"));

    let guard = slog_scope::set_global_logger(logger);
    slog_stdlog::init().ok();
    guard
}

/// Shorthand for fetching the ambient contextual logger from anywhere in
/// the codebase without threading a `Logger` through every signature,
/// matching the teacher's `slog_scope::logger()` usage.
#[must_use]
pub fn logger() -> slog::Logger {
    slog_scope::logger()
}
