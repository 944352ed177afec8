use crate::db::{BatchOp, Db};
use crate::error::Result;
use crate::sha256::Hash;
use crate::types::Block;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

const HEIGHT_KEY: &[u8] = b"meta:height";
const BLOCK_PREFIX: &[u8] = b"blk:";

fn block_key(height: u64) -> Vec<u8> {
    let mut key = BLOCK_PREFIX.to_vec();
    key.extend_from_slice(&height.to_be_bytes());
    key
}

/// Committed blocks by height. Height 0 means no block was ever saved.
pub struct Store {
    db: Arc<dyn Db>,
    height: AtomicU64,
}

impl Store {
    pub fn new(db: Arc<dyn Db>) -> Self {
        let height = db
            .get(HEIGHT_KEY)
            .and_then(|raw| raw.try_into().ok())
            .map(u64::from_be_bytes)
            .unwrap_or(0);
        Store {
            db,
            height: AtomicU64::new(height),
        }
    }
    pub fn height(&self) -> u64 {
        self.height.load(Ordering::SeqCst)
    }
    pub fn get_block(&self, height: u64) -> Result<Option<Block>> {
        self.db
            .get(&block_key(height))
            .map(|raw| Block::from_bytes(&raw))
            .transpose()
    }
    pub fn hash_at(&self, height: u64) -> Result<Option<Hash>> {
        Ok(self.get_block(height)?.map(|block| block.hash()))
    }
    pub fn latest_block(&self) -> Result<Option<Block>> {
        self.get_block(self.height())
    }
    /// Persists the block and moves the height to it in one batch.
    pub fn save_block(&self, block: &Block) -> Result<()> {
        self.db.write_batch(vec![
            BatchOp::Set(block_key(block.height()), block.to_bytes()?),
            BatchOp::Set(HEIGHT_KEY.to_vec(), block.height().to_be_bytes().to_vec()),
        ])?;
        self.height.store(block.height(), Ordering::SeqCst);
        Ok(())
    }
}
