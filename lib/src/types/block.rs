use super::Transaction;
use crate::error::{ChainError, Result};
use crate::sha256::Hash;
use crate::util::{MerkleRoot, Saveable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{Error as IoError, ErrorKind as IoErrorKind, Read, Result as IoResult, Write};

// save and load expecting CBOR from ciborium as format
impl Saveable for Block {
    fn load<I: Read>(reader: I) -> IoResult<Self> {
        ciborium::de::from_reader(reader)
            .map_err(|_| IoError::new(IoErrorKind::InvalidData, "Failed to deserialize Block"))
    }
    fn save<O: Write>(&self, writer: O) -> IoResult<()> {
        ciborium::ser::into_writer(self, writer)
            .map_err(|_| IoError::new(IoErrorKind::InvalidData, "Failed to serialize Block"))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Block {
            header,
            transactions,
        }
    }
    /// Builds the block that extends `prev` with `transactions`.
    pub fn next(prev: &Block, transactions: Vec<Transaction>, timestamp: DateTime<Utc>) -> Self {
        let header = BlockHeader::new(
            prev.header.version,
            prev.height() + 1,
            prev.hash(),
            timestamp,
            MerkleRoot::calculate(&transactions),
        );
        Block::new(header, transactions)
    }
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }
    pub fn height(&self) -> u64 {
        self.header.height
    }
    pub fn verify_merkle_root(&self) -> Result<()> {
        if MerkleRoot::calculate(&self.transactions) != self.header.transactions_merkle_root {
            return Err(ChainError::InvalidMerkleRoot);
        }
        Ok(())
    }
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = vec![];
        ciborium::ser::into_writer(self, &mut out).map_err(|e| ChainError::Encode(e.to_string()))?;
        Ok(out)
    }
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::de::from_reader(bytes).map_err(|e| ChainError::Decode(e.to_string()))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u64,
    pub height: u64,
    pub previous_block_hash: Hash,
    pub timestamp: DateTime<Utc>,
    pub transactions_merkle_root: MerkleRoot,
}

impl BlockHeader {
    pub fn new(
        version: u64,
        height: u64,
        previous_block_hash: Hash,
        timestamp: DateTime<Utc>,
        transactions_merkle_root: MerkleRoot,
    ) -> Self {
        BlockHeader {
            version,
            height,
            previous_block_hash,
            timestamp,
            transactions_merkle_root,
        }
    }
    pub fn hash(&self) -> Hash {
        Hash::hash(self)
    }
}
