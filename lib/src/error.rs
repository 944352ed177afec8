use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode {0}")]
    Encode(String),
    #[error("failed to decode {0}")]
    Decode(String),
    #[error("invalid hex string")]
    InvalidHex,
    #[error("invalid key")]
    InvalidKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid block height: expected {expected}, got {got}")]
    InvalidHeight { expected: u64, got: u64 },
    #[error("block {height} does not extend the current tip")]
    PrevHashMismatch { height: u64 },
    #[error("genesis block mismatch")]
    GenesisMismatch,
    #[error("invalid merkle root")]
    InvalidMerkleRoot,
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("unknown database backend {0:?}")]
    UnknownBackend(String),
}

pub type Result<T> = std::result::Result<T, ChainError>;
