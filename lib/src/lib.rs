pub mod chain;
pub mod consensus;
pub mod crypto;
pub mod db;
pub mod error;
pub mod sha256;
pub mod store;
pub mod types;
pub mod util;

// maximum age of a transaction in the pool in seconds
pub const MAX_TXPOOL_TRANSACTION_AGE: u64 = 600;
