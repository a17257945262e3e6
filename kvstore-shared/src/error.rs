use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The requested revision has been garbage collected by the store.
    #[error("required revision has been compacted (compact revision {compact_revision})")]
    Compacted { compact_revision: u64 },

    #[error("requested lease not found")]
    LeaseNotFound,

    #[error("Unavailable - {0}")]
    Unavailable(String),

    #[error("deadline exceeded - {0}")]
    DeadlineExceeded(String),

    #[error("store client is closed")]
    Closed,

    #[error("Store Error - {0}")]
    Other(String),
}
