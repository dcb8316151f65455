use thiserror::Error;

#[derive(Debug, Error)]
pub enum SheafError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("map is closed: {0}")]
    MapClosed(String),

    #[error("map is read only: {0}")]
    ReadOnly(String),

    #[error("invalid transaction state: {0}")]
    InvalidTransactionState(String),

    #[error("lock wait timed out: {0}")]
    LockTimeout(String),

    #[error("deadlock detected: {0}")]
    Deadlock(String),

    #[error("replication error: {0}")]
    Replication(String),

    #[error("replication quorum not reached: {0}")]
    QuorumFailed(String),
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct StorageError(pub String);

impl SheafError {
    /// Errors a caller may retry locally (network hiccups, quorum rounds).
    pub fn is_transient(&self) -> bool {
        matches!(self, SheafError::Replication(_) | SheafError::Io(_))
    }
}
