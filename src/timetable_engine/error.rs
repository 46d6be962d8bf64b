//! Error taxonomy shared by the transport, the parsers, and the orchestrator.

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Failure kinds surfaced by the extraction engine.
///
/// The route layer maps each kind to an HTTP status and a short category
/// string; messages never contain cookie values or raw upstream HTML.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller supplied bad input (missing cookie, empty student id, bad options).
    #[error("bad request: {0}")]
    Input(String),

    /// The upstream rejected the session, typically by redirecting to login.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The upstream answered but violated the expected page protocol.
    #[error("upstream protocol violation: {0}")]
    UpstreamProtocol(String),

    /// The upstream returned a non-retryable HTTP error status.
    #[error("upstream returned status {status}")]
    UpstreamStatus { status: u16 },

    /// Transport-level failure, including retry exhaustion.
    #[error("network failure: {0}")]
    Network(String),

    /// An assembled timetable failed the schema invariants.
    #[error("payload validation failed: {0}")]
    Validation(String),

    /// Anything that should never happen.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Short machine-readable category for the JSON error body.
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Input(_) => "bad_request",
            EngineError::Auth(_) => "auth_error",
            EngineError::UpstreamProtocol(_)
            | EngineError::UpstreamStatus { .. }
            | EngineError::Validation(_) => "upstream_error",
            EngineError::Network(_) => "network_error",
            EngineError::Internal(_) => "internal_error",
        }
    }
}
