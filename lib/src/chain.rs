//! The chain as seen by the node core: append blocks, read them back, and
//! wait for new ones. Validation is limited to linkage; consensus rules
//! belong elsewhere.

use crate::error::{ChainError, Result};
use crate::sha256::Hash;
use crate::store::Store;
use crate::types::{Block, Transaction};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

pub struct Chain {
    genesis_hash: Hash,
    store: Arc<Store>,
    txpool: Arc<TxPool>,
    // serializes appends; reads go straight to the store
    append: Mutex<()>,
    tip: watch::Sender<u64>,
}

impl Chain {
    pub fn new(genesis_hash: Hash, store: Arc<Store>, txpool: Arc<TxPool>) -> Result<Self> {
        if store.height() >= 1 && store.hash_at(1)? != Some(genesis_hash) {
            return Err(ChainError::GenesisMismatch);
        }
        let (tip, _) = watch::channel(store.height());
        Ok(Chain {
            genesis_hash,
            store,
            txpool,
            append: Mutex::new(()),
            tip,
        })
    }
    pub fn genesis_hash(&self) -> Hash {
        self.genesis_hash
    }
    pub fn height(&self) -> u64 {
        self.store.height()
    }
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }
    pub fn txpool(&self) -> &Arc<TxPool> {
        &self.txpool
    }
    pub fn get_block(&self, height: u64) -> Result<Option<Block>> {
        self.store.get_block(height)
    }
    pub fn add_block(&self, block: &Block) -> Result<()> {
        let _guard = self.append.lock();
        let height = self.store.height();
        if block.height() != height + 1 {
            return Err(ChainError::InvalidHeight {
                expected: height + 1,
                got: block.height(),
            });
        }
        if height == 0 {
            if block.hash() != self.genesis_hash {
                return Err(ChainError::GenesisMismatch);
            }
        } else if self.store.hash_at(height)? != Some(block.header.previous_block_hash) {
            return Err(ChainError::PrevHashMismatch {
                height: block.height(),
            });
        }
        block.verify_merkle_root()?;
        self.store.save_block(block)?;
        self.txpool.remove_confirmed(block);
        debug!(height = block.height(), hash = %block.hash(), "block committed");
        self.tip.send_replace(block.height());
        Ok(())
    }
    /// Resolves once the chain holds a block at `height`.
    pub async fn block_waiter(&self, height: u64) {
        let mut rx = self.tip.subscribe();
        // the sender lives as long as `self`, so this cannot observe a close
        let _ = rx.wait_for(|tip| *tip >= height).await;
    }
    pub fn subscribe_tip(&self) -> watch::Receiver<u64> {
        self.tip.subscribe()
    }
}

/// Unconfirmed transactions, keyed by id.
#[derive(Default)]
pub struct TxPool {
    pool: RwLock<HashMap<Hash, (DateTime<Utc>, Transaction)>>,
}

impl TxPool {
    pub fn new() -> Self {
        Self::default()
    }
    /// Returns false when the transaction was already pooled.
    pub fn add(&self, tx: Transaction) -> bool {
        let id = tx.id();
        let mut pool = self.pool.write();
        if pool.contains_key(&id) {
            return false;
        }
        pool.insert(id, (Utc::now(), tx));
        true
    }
    pub fn contains(&self, id: &Hash) -> bool {
        self.pool.read().contains_key(id)
    }
    pub fn count(&self) -> usize {
        self.pool.read().len()
    }
    pub fn transactions(&self) -> Vec<Transaction> {
        self.pool.read().values().map(|(_, tx)| tx.clone()).collect()
    }
    pub fn remove_confirmed(&self, block: &Block) {
        let mut pool = self.pool.write();
        for tx in &block.transactions {
            pool.remove(&tx.id());
        }
    }
    pub fn flush(&self) {
        self.pool.write().clear();
    }
    // drop transactions older than `max_age_secs`
    pub fn clean(&self, max_age_secs: u64) -> usize {
        let now = Utc::now();
        let mut pool = self.pool.write();
        let before = pool.len();
        pool.retain(|_, (added, _)| now - *added <= chrono::Duration::seconds(max_age_secs as i64));
        before - pool.len()
    }
}
