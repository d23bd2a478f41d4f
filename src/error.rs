use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// Bus and network transport failures surface as [`AgentError::Connection`],
/// deadline overruns as [`AgentError::Timeout`], malformed or unexpected
/// messages as [`AgentError::Protocol`]. Register writes that are rejected
/// or unconfirmed get their own variant so command originators can be
/// negatively acknowledged, and scheduler overflow is reported to the
/// enqueuing caller rather than crashing the loop.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("write to register {address} failed: {reason}")]
    Write { address: u16, reason: String },

    #[error("{0} queue at capacity")]
    Capacity(&'static str),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// True for errors that should tear the current uplink session down.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, AgentError::Connection(_) | AgentError::Io(_))
    }
}
