//! Durable progress cursors for asynchronous block consumers.
//!
//! A pin records the height of the last block its consumer fully applied.
//! [`PinStore::process_blocks`] only advances a pin after the consumer's
//! apply step returned successfully, so a crash in between replays that
//! block on restart. Consumers must therefore apply blocks idempotently.
//! Each pin has exactly one writer: the loop that processes blocks for it.

use crate::error::{Result, WalletError};
use chainlib::chain::Chain;
use chainlib::db::Db;
use chainlib::types::Block;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

const PIN_PREFIX: &[u8] = b"pin:";
const RETRY_DELAY: Duration = Duration::from_secs(1);

fn pin_key(name: &str) -> Vec<u8> {
    let mut key = PIN_PREFIX.to_vec();
    key.extend_from_slice(name.as_bytes());
    key
}

fn decode_height(raw: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| WalletError::Decode("pin height".to_string()))?;
    Ok(u64::from_be_bytes(bytes))
}

/// Resolves once shutdown was requested or its sender is gone.
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

pub struct Pin {
    name: String,
    height: watch::Sender<u64>,
    db: Arc<dyn Db>,
}

impl Pin {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn height(&self) -> u64 {
        *self.height.borrow()
    }
    // durable first, then visible; never moves backwards
    fn raise(&self, height: u64) -> Result<()> {
        if height <= self.height() {
            return Ok(());
        }
        self.db.set(&pin_key(&self.name), &height.to_be_bytes())?;
        self.height.send_replace(height);
        Ok(())
    }
    pub async fn wait_for(&self, height: u64) {
        let mut rx = self.height.subscribe();
        let _ = rx.wait_for(|h| *h >= height).await;
    }
}

pub struct PinStore {
    db: Arc<dyn Db>,
    pins: RwLock<HashMap<String, Arc<Pin>>>,
    // bumped whenever a pin appears
    created: watch::Sender<u64>,
}

impl PinStore {
    pub fn new(db: Arc<dyn Db>) -> Self {
        let (created, _) = watch::channel(0);
        PinStore {
            db,
            pins: RwLock::new(HashMap::new()),
            created,
        }
    }

    fn new_pin(&self, name: &str, height: u64) -> Arc<Pin> {
        let (tx, _) = watch::channel(height);
        Arc::new(Pin {
            name: name.to_string(),
            height: tx,
            db: self.db.clone(),
        })
    }

    /// Loads every persisted pin. Must complete before any consumer starts.
    pub fn load_all(&self) -> Result<()> {
        let mut loaded = 0;
        {
            let mut pins = self.pins.write();
            for (key, value) in self.db.iter_prefix(PIN_PREFIX) {
                let name = String::from_utf8(key[PIN_PREFIX.len()..].to_vec())
                    .map_err(|_| WalletError::Decode("pin name".to_string()))?;
                let height = decode_height(&value)?;
                pins.insert(name.clone(), self.new_pin(&name, height));
                loaded += 1;
            }
        }
        self.created.send_modify(|n| *n += 1);
        info!(loaded, "pins loaded");
        Ok(())
    }

    /// Creates `name` at `height` unless it already exists, in which case the
    /// stored height wins.
    pub fn create_pin(&self, name: &str, height: u64) -> Result<()> {
        {
            let mut pins = self.pins.write();
            if pins.contains_key(name) {
                return Ok(());
            }
            self.db.set(&pin_key(name), &height.to_be_bytes())?;
            pins.insert(name.to_string(), self.new_pin(name, height));
        }
        self.created.send_modify(|n| *n += 1);
        debug!(pin = name, height, "pin created");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Pin>> {
        self.pins.read().get(name).cloned()
    }

    /// Height of `name`, 0 when it does not exist.
    pub fn height(&self, name: &str) -> u64 {
        self.get(name).map(|pin| pin.height()).unwrap_or(0)
    }

    pub fn heights(&self) -> Vec<(String, u64)> {
        let mut out: Vec<_> = self
            .pins
            .read()
            .values()
            .map(|pin| (pin.name.clone(), pin.height()))
            .collect();
        out.sort();
        out
    }

    /// Waits until `name` exists.
    pub async fn pin(&self, name: &str) -> Arc<Pin> {
        let mut rx = self.created.subscribe();
        loop {
            if let Some(pin) = self.get(name) {
                return pin;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    pub async fn wait_for_pin(&self, name: &str, height: u64) {
        self.pin(name).await.wait_for(height).await
    }

    /// Waits until every currently known pin reached `height`.
    pub async fn all_waiter(&self, height: u64) {
        let pins: Vec<_> = self.pins.read().values().cloned().collect();
        for pin in pins {
            pin.wait_for(height).await;
        }
    }

    /// Feeds every block above the pin to `apply`, advancing the pin after
    /// each success, until shutdown is signalled. Shutdown is only observed
    /// between blocks, never while `apply` runs.
    pub async fn process_blocks<F, Fut>(
        &self,
        chain: &Chain,
        pin_name: &str,
        mut shutdown: watch::Receiver<bool>,
        apply: F,
    ) where
        F: Fn(Block) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let pin = tokio::select! {
            pin = self.pin(pin_name) => pin,
            _ = shutdown_requested(&mut shutdown) => return,
        };
        let mut height = pin.height();
        info!(pin = pin_name, height, "block processing started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                _ = chain.block_waiter(height + 1) => {}
            }
            let next = height + 1;
            let block = match chain.get_block(next) {
                Ok(Some(block)) => block,
                Ok(None) => {
                    error!(pin = pin_name, height = next, "block missing from store");
                    if retry_later(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
                Err(err) => {
                    error!(pin = pin_name, height = next, %err, "failed to load block");
                    if retry_later(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };
            if let Err(err) = apply(block).await {
                error!(pin = pin_name, height = next, %err, "failed to apply block");
                if retry_later(&mut shutdown).await {
                    break;
                }
                continue;
            }
            if let Err(err) = pin.raise(next) {
                // the block gets applied again, which apply tolerates
                error!(pin = pin_name, height = next, %err, "failed to advance pin");
                if retry_later(&mut shutdown).await {
                    break;
                }
                continue;
            }
            height = next;
        }
        info!(pin = pin_name, height, "block processing stopped");
    }
}

// true when shutdown arrived while waiting
async fn retry_later(shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = shutdown_requested(shutdown) => true,
        _ = tokio::time::sleep(RETRY_DELAY) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainlib::chain::TxPool;
    use chainlib::consensus;
    use chainlib::db::MemDb;
    use chainlib::store::Store;
    use chrono::Utc;
    use parking_lot::Mutex;

    fn chain_with_blocks(n: u64) -> Arc<Chain> {
        let store = Arc::new(Store::new(Arc::new(MemDb::new())));
        let chain =
            Chain::new(consensus::init_block().hash(), store, Arc::new(TxPool::new())).unwrap();
        let mut prev = consensus::init_block();
        chain.add_block(&prev).unwrap();
        for _ in 1..n {
            let next = Block::next(&prev, vec![], Utc::now());
            chain.add_block(&next).unwrap();
            prev = next;
        }
        Arc::new(chain)
    }

    #[test]
    fn load_all_restores_persisted_heights() {
        let db: Arc<dyn Db> = Arc::new(MemDb::new());
        let store = PinStore::new(db.clone());
        store.create_pin("account", 7).unwrap();
        store.get("account").unwrap().raise(9).unwrap();

        let reloaded = PinStore::new(db);
        reloaded.load_all().unwrap();
        assert_eq!(reloaded.height("account"), 9);
        // an existing pin is not reset by a later create
        reloaded.create_pin("account", 0).unwrap();
        assert_eq!(reloaded.height("account"), 9);
    }

    #[test]
    fn raise_never_lowers() {
        let store = PinStore::new(Arc::new(MemDb::new()));
        store.create_pin("p", 5).unwrap();
        let pin = store.get("p").unwrap();
        pin.raise(3).unwrap();
        assert_eq!(pin.height(), 5);
    }

    #[tokio::test]
    async fn process_blocks_applies_each_block_once_in_order() {
        let chain = chain_with_blocks(4);
        let store = Arc::new(PinStore::new(Arc::new(MemDb::new())));
        store.create_pin("p", 1).unwrap();
        let seen = Arc::new(Mutex::new(vec![]));
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = {
            let (store, chain, seen) = (store.clone(), chain.clone(), seen.clone());
            tokio::spawn(async move {
                store
                    .process_blocks(&chain, "p", stop_rx, |block| {
                        let seen = seen.clone();
                        async move {
                            seen.lock().push(block.height());
                            Ok(())
                        }
                    })
                    .await
            })
        };

        store.wait_for_pin("p", 4).await;
        // a block committed later wakes the loop up
        let tip = chain.get_block(4).unwrap().unwrap();
        chain.add_block(&Block::next(&tip, vec![], Utc::now())).unwrap();
        store.wait_for_pin("p", 5).await;

        stop_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(*seen.lock(), vec![2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn failed_apply_does_not_advance_pin() {
        let chain = chain_with_blocks(2);
        let store = Arc::new(PinStore::new(Arc::new(MemDb::new())));
        store.create_pin("p", 1).unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let attempts = Arc::new(Mutex::new(0));

        let task = {
            let (store, chain, attempts) = (store.clone(), chain.clone(), attempts.clone());
            tokio::spawn(async move {
                store
                    .process_blocks(&chain, "p", stop_rx, |_block| {
                        let attempts = attempts.clone();
                        async move {
                            *attempts.lock() += 1;
                            Err(WalletError::NotFound("test".to_string()))
                        }
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();
        task.await.unwrap();
        assert!(*attempts.lock() >= 1);
        assert_eq!(store.height("p"), 1);
    }

    #[tokio::test]
    async fn process_blocks_waits_for_pin_creation() {
        let chain = chain_with_blocks(1);
        let store = Arc::new(PinStore::new(Arc::new(MemDb::new())));
        let (_stop_tx, stop_rx) = watch::channel(false);
        let task = {
            let (store, chain) = (store.clone(), chain.clone());
            tokio::spawn(async move {
                store
                    .process_blocks(&chain, "late", stop_rx, |_b| async { Ok(()) })
                    .await
            })
        };
        store.create_pin("late", 0).unwrap();
        tokio::time::timeout(Duration::from_secs(1), store.wait_for_pin("late", 1))
            .await
            .unwrap();
        task.abort();
    }

    mod properties {
        use super::super::PinStore;
        use chainlib::db::MemDb;
        use proptest::prelude::*;
        use std::sync::Arc;

        proptest! {
            #[test]
            fn create_pin_keeps_first_height(name in "[a-z]{1,12}", first in any::<u64>(), second in any::<u64>()) {
                let store = PinStore::new(Arc::new(MemDb::new()));
                store.create_pin(&name, first).unwrap();
                store.create_pin(&name, second).unwrap();
                prop_assert_eq!(store.height(&name), first);
            }
        }
    }
}
