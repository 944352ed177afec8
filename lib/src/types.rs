mod block;
mod transaction;

pub use block::{Block, BlockHeader};
pub use transaction::{Transaction, TxInput, TxOutput};
