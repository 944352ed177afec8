//! Wallet indexing for the node: accounts, assets, keys, and the durable
//! pin cursors that let block processing resume after a restart.

pub mod account;
pub mod asset;
pub mod error;
pub mod pin;
pub mod pseudohsm;

pub use error::{Result, WalletError};
