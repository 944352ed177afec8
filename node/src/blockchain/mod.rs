pub mod reactor;
pub mod request;

pub use reactor::{BlockchainMessage, BlockchainReactor, BLOCKCHAIN_CHANNEL};
pub use request::{AliasResolver, BuildRequest};
