//! Error taxonomy: fatal run-level failures vs. per-case failures that are
//! recovered into a verdict.

use thiserror::Error;

use crate::sync::SessionId;

/// Failures that abort the whole run. Only configuration problems and
/// session establishment fall in this bucket.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("test engine {addr} unreachable: {reason}")]
    EngineUnreachable {
        addr: std::net::SocketAddr,
        reason: String,
    },
}

/// Failures scoped to a single test case. The orchestrator converts these
/// into an ERROR verdict and moves on.
#[derive(Debug, Error)]
pub enum CaseError {
    #[error("device unavailable: {reason}")]
    DeviceUnavailable { reason: String },

    #[error("timed out waiting for {kind} on session {session}")]
    ProtocolTimeout { session: SessionId, kind: String },

    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Misuse of the response synchronizer.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a pending response for {kind} on session {session} is already registered")]
    AlreadyPending { session: SessionId, kind: String },
}
