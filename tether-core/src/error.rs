use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Error taxonomy shared across the workspace.
///
/// Transient network failures are retried locally with backoff and never
/// surfaced unless sustained; fatal variants abort startup.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("config: {0}")]
    Config(String),
    #[error("protocol: {0}")]
    Protocol(String),
    /// Remote end vanished or the socket died under us. The per-peer FSM
    /// applies the retry policy when it sees this.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// Presented certificate did not hash to the expected peer id.
    #[error("peer authentication failed: expected {expected}, presented {presented}")]
    PeerAuth { expected: String, presented: String },
    #[error("timed out: {0}")]
    Timeout(&'static str),
    /// A transfer made no progress for longer than the stall budget.
    #[error("transfer stalled: {0}")]
    TransferStalled(String),
    #[error("transfer failed: {0}")]
    TransferFailed(String),
    /// Disk write failed; received chunks stay in memory and are retried.
    #[error("storage: {0}")]
    Storage(String),
    /// Unrecoverable startup failure (missing certificate, unbindable port).
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Whether the retry machinery should treat this as transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::ConnectionLost(_) | Error::Io(_)
        )
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
