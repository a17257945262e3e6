use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("CancellationToken Cancelled")]
    Cancelled,

    #[error("Config Error - {0}")]
    Config(String),
}
