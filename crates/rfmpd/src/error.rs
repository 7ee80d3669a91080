//! Daemon error types.

use rfmp_proto::ProtocolError;
use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by the daemon to its callers.
///
/// Ingress-side decode and store failures never appear here; those are
/// logged and counted where they happen so a bad frame or a transient store
/// hiccup cannot take the engine down.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration could not be loaded or failed validation. Fatal at
    /// startup; fix the file and restart.
    #[error("configuration error: {0}")]
    Config(String),

    /// Outbound construction failed validation (bad channel, priority,
    /// body, reply id). The message was not queued.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The persistent store rejected an operation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Filesystem or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The daemon is not running.
    #[error("daemon is not running")]
    NotRunning,
}
