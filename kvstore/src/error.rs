use kvstore_shared::error::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Message used for every operation that ran out of time.
pub(crate) const TIMEOUT_HINT: &str = "kvstore client timeout exceeded";

#[derive(Error, Debug, Clone)]
pub enum Error {
    /// A lock-qualified operation ran after the lock's session was lost. Never retried by the
    /// client, retrying could cross the mutual exclusion boundary.
    #[error("transaction did not succeed: lock lease expired")]
    LockLeaseExpired,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("TLS Error - {0}")]
    Tls(String),

    #[error("Connection Error - {0}")]
    Connection(String),

    #[error("unable to acquire lock: {0}")]
    Lock(String),

    #[error("{0}")]
    Quorum(String),

    #[error("{TIMEOUT_HINT}")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,
}

impl From<kvstore_throttling::Error> for Error {
    fn from(value: kvstore_throttling::Error) -> Self {
        match value {
            kvstore_throttling::Error::Cancelled => Error::Cancelled,
            kvstore_throttling::Error::Config(msg) => Error::Config(msg),
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

impl Error {
    /// The lease the failed call referred to no longer exists remotely.
    pub fn is_lease_not_found(&self) -> bool {
        matches!(self, Error::Store(StoreError::LeaseNotFound))
    }

    pub fn is_compacted(&self) -> bool {
        matches!(self, Error::Store(StoreError::Compacted { .. }))
    }

    /// Rewrites errors into something actionable for the operator, deadline errors from the
    /// transport become [`Error::Timeout`].
    pub fn hint(self) -> Self {
        match self {
            Error::Store(StoreError::DeadlineExceeded(_)) => Error::Timeout,
            other => other,
        }
    }
}
