//! Network parameters and the genesis block derived from them.

use crate::sha256::Hash;
use crate::types::{Block, BlockHeader, Transaction, TxInput, TxOutput};
use crate::util::MerkleRoot;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub const NETWORK: &str = "chain0";
pub const BLOCK_VERSION: u64 = 1;
// 2017-06-01T00:00:00Z
pub const GENESIS_TIMESTAMP: i64 = 1_496_275_200;
pub const INITIAL_BLOCK_SUBSIDY: u64 = 140_700_041_250_000_000;
pub const GENESIS_CONTROL_PROGRAM: &[u8] = b"genesis:unspendable";

pub fn native_asset_id() -> Hash {
    Hash::hash(&(NETWORK, "native"))
}

/// The fixed first block of the chain. Building it twice yields the same
/// hash; it sits at height 1 so that a store height of 0 means "empty".
pub fn init_block() -> Block {
    let coinbase = Transaction::new(
        vec![TxInput::Issuance {
            asset_id: native_asset_id(),
            amount: INITIAL_BLOCK_SUBSIDY,
            nonce: Uuid::nil(),
        }],
        vec![TxOutput {
            asset_id: native_asset_id(),
            amount: INITIAL_BLOCK_SUBSIDY,
            control_program: GENESIS_CONTROL_PROGRAM.to_vec(),
            unique_id: Uuid::nil(),
        }],
    );
    let transactions = vec![coinbase];
    let timestamp = DateTime::<Utc>::from_timestamp(GENESIS_TIMESTAMP, 0).unwrap_or_default();
    let header = BlockHeader::new(
        BLOCK_VERSION,
        1,
        Hash::zero(),
        timestamp,
        MerkleRoot::calculate(&transactions),
    );
    Block::new(header, transactions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_is_deterministic() {
        assert_eq!(init_block().hash(), init_block().hash());
        assert_eq!(init_block().height(), 1);
        assert!(init_block().verify_merkle_root().is_ok());
    }
}
