//! Tracing subscriber setup for binaries and tests that embed the reader.

use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{ApfsError, Result};

/// Installs a global `fmt` subscriber filtered by `level`.
///
/// `level` accepts any `EnvFilter` directive, e.g. `"info"` or
/// `"apfs_btree=trace"`. Fails if the directive does not parse or a global
/// subscriber is already installed.
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level).map_err(|_| ApfsError::Invalid("invalid log level"))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| ApfsError::Invalid("logging already initialized"))
}
