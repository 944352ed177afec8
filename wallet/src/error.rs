use chainlib::error::ChainError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WalletError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decode {0}")]
    Decode(String),
    #[error("duplicate alias {0:?}")]
    DuplicateAlias(String),
    #[error("alias {0:?} not found")]
    AliasNotFound(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("quorum must be between 1 and {0}")]
    BadQuorum(usize),
    #[error("shutting down")]
    ShuttingDown,
}

impl From<serde_json::Error> for WalletError {
    fn from(e: serde_json::Error) -> Self {
        WalletError::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WalletError>;
