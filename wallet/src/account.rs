//! Accounts and the account UTXO index.
//!
//! Two pins drive the index: [`PIN_NAME`] records outputs paid to account
//! control programs, [`DELETE_SPENTS_PIN_NAME`] removes outputs once they are
//! spent. Both steps are keyed by output id, so replaying a block leaves the
//! index unchanged.

use crate::error::{Result, WalletError};
use crate::pin::{PinStore, shutdown_requested};
use chainlib::chain::Chain;
use chainlib::crypto::PublicKey;
use chainlib::db::{BatchOp, Db};
use chainlib::sha256::Hash;
use chainlib::types::Block;
use crossbeam_skiplist::SkipMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

pub const PIN_NAME: &str = "account";
pub const DELETE_SPENTS_PIN_NAME: &str = "delete-account-spent-outputs";

const ACCOUNT_PREFIX: &str = "acc:";
const ALIAS_PREFIX: &str = "alias:";
const PROGRAM_PREFIX: &str = "cp:";
const UTXO_PREFIX: &str = "utxo:";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Account {
    pub id: String,
    pub alias: Option<String>,
    pub xpubs: Vec<PublicKey>,
    pub quorum: usize,
    #[serde(with = "hex::serde")]
    pub control_program: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AccountUtxo {
    pub output_id: Hash,
    pub account_id: String,
    pub asset_id: Hash,
    pub amount: u64,
    pub block_height: u64,
    pub source_tx: Hash,
}

pub struct Manager {
    db: Arc<dyn Db>,
    utxo_db: Arc<dyn Db>,
    chain: Arc<Chain>,
    pin_store: Arc<PinStore>,
    // accounts by alias
    cache: SkipMap<String, Account>,
}

impl Manager {
    pub fn new(
        db: Arc<dyn Db>,
        utxo_db: Arc<dyn Db>,
        chain: Arc<Chain>,
        pin_store: Arc<PinStore>,
    ) -> Result<Self> {
        let cache = SkipMap::new();
        for (_, raw) in db.iter_prefix(ACCOUNT_PREFIX.as_bytes()) {
            let account: Account = serde_json::from_slice(&raw)?;
            if let Some(alias) = account.alias.clone() {
                cache.insert(alias, account);
            }
        }
        Ok(Manager {
            db,
            utxo_db,
            chain,
            pin_store,
            cache,
        })
    }

    pub fn create(
        &self,
        xpubs: Vec<PublicKey>,
        quorum: usize,
        alias: Option<String>,
    ) -> Result<Account> {
        if quorum == 0 || quorum > xpubs.len() {
            return Err(WalletError::BadQuorum(xpubs.len()));
        }
        let alias = alias.map(|a| a.trim().to_string()).filter(|a| !a.is_empty());
        if let Some(alias) = &alias {
            if self.db.get(format!("{ALIAS_PREFIX}{alias}").as_bytes()).is_some() {
                return Err(WalletError::DuplicateAlias(alias.clone()));
            }
        }
        let id = Uuid::new_v4().to_string();
        let keys: Vec<String> = xpubs.iter().map(|k| k.to_hex()).collect();
        let control_program = Hash::hash(&(&keys, quorum, &id)).as_bytes().to_vec();
        let account = Account {
            id: id.clone(),
            alias: alias.clone(),
            xpubs,
            quorum,
            control_program,
        };

        let mut ops = vec![
            BatchOp::Set(
                format!("{ACCOUNT_PREFIX}{id}").into_bytes(),
                serde_json::to_vec(&account)?,
            ),
            BatchOp::Set(
                format!("{PROGRAM_PREFIX}{}", hex::encode(&account.control_program)).into_bytes(),
                id.clone().into_bytes(),
            ),
        ];
        if let Some(alias) = &alias {
            ops.push(BatchOp::Set(
                format!("{ALIAS_PREFIX}{alias}").into_bytes(),
                id.clone().into_bytes(),
            ));
        }
        self.db.write_batch(ops)?;
        if let Some(alias) = alias {
            self.cache.insert(alias, account.clone());
        }
        info!(account = %id, "account created");
        Ok(account)
    }

    pub fn find_by_id(&self, id: &str) -> Result<Account> {
        let raw = self
            .db
            .get(format!("{ACCOUNT_PREFIX}{id}").as_bytes())
            .ok_or_else(|| WalletError::NotFound(format!("account {id}")))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn find_by_alias(&self, alias: &str) -> Result<Account> {
        if let Some(entry) = self.cache.get(alias) {
            return Ok(entry.value().clone());
        }
        let id = self
            .db
            .get(format!("{ALIAS_PREFIX}{alias}").as_bytes())
            .ok_or_else(|| WalletError::AliasNotFound(alias.to_string()))?;
        let id = String::from_utf8(id).map_err(|_| WalletError::Decode("account id".into()))?;
        self.find_by_id(&id)
    }

    pub fn list(&self) -> Result<Vec<Account>> {
        self.db
            .iter_prefix(ACCOUNT_PREFIX.as_bytes())
            .into_iter()
            .map(|(_, raw)| serde_json::from_slice(&raw).map_err(WalletError::from))
            .collect()
    }

    fn account_for_program(&self, program: &[u8]) -> Option<String> {
        self.db
            .get(format!("{PROGRAM_PREFIX}{}", hex::encode(program)).as_bytes())
            .and_then(|raw| String::from_utf8(raw).ok())
    }

    pub fn list_unspent_outputs(&self, account_id: Option<&str>) -> Result<Vec<AccountUtxo>> {
        let mut out = vec![];
        for (_, raw) in self.utxo_db.iter_prefix(UTXO_PREFIX.as_bytes()) {
            let utxo: AccountUtxo = serde_json::from_slice(&raw)?;
            if account_id.is_none_or(|id| id == utxo.account_id) {
                out.push(utxo);
            }
        }
        Ok(out)
    }

    /// Records every output in `block` that pays an account. Outputs spent
    /// inside the same block are skipped so that a replay cannot resurrect
    /// them after the spent cleanup already ran.
    pub fn index_account_utxos(&self, block: &Block) -> Result<()> {
        let spent_here: HashSet<Hash> = block
            .transactions
            .iter()
            .flat_map(|tx| tx.spent_output_ids().copied())
            .collect();
        let mut ops = vec![];
        for tx in &block.transactions {
            let tx_id = tx.id();
            for (index, output) in tx.outputs.iter().enumerate() {
                let Some(account_id) = self.account_for_program(&output.control_program) else {
                    continue;
                };
                let output_id = tx.output_id(index);
                if spent_here.contains(&output_id) {
                    continue;
                }
                let utxo = AccountUtxo {
                    output_id,
                    account_id,
                    asset_id: output.asset_id,
                    amount: output.amount,
                    block_height: block.height(),
                    source_tx: tx_id,
                };
                ops.push(BatchOp::Set(
                    format!("{UTXO_PREFIX}{output_id}").into_bytes(),
                    serde_json::to_vec(&utxo)?,
                ));
            }
        }
        if !ops.is_empty() {
            debug!(height = block.height(), outputs = ops.len(), "indexing account outputs");
            self.utxo_db.write_batch(ops)?;
        }
        Ok(())
    }

    pub fn delete_spent_outputs(&self, block: &Block) -> Result<()> {
        let ops: Vec<_> = block
            .transactions
            .iter()
            .flat_map(|tx| tx.spent_output_ids())
            .map(|id| format!("{UTXO_PREFIX}{id}").into_bytes())
            .filter(|key| self.utxo_db.get(key).is_some())
            .map(BatchOp::Delete)
            .collect();
        if !ops.is_empty() {
            debug!(height = block.height(), outputs = ops.len(), "deleting spent account outputs");
            self.utxo_db.write_batch(ops)?;
        }
        Ok(())
    }

    /// Spawns the two indexing loops. Both exit once `shutdown` flips to
    /// true, after finishing the block they are working on.
    pub fn process_blocks(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let indexer = {
            let manager = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let pins = manager.pin_store.clone();
                let chain = manager.chain.clone();
                pins.process_blocks(&chain, PIN_NAME, shutdown, |block| {
                    let manager = manager.clone();
                    async move { manager.index_account_utxos(&block) }
                })
                .await
            })
        };
        let cleaner = {
            let manager = self.clone();
            tokio::spawn(async move {
                let pins = manager.pin_store.clone();
                let chain = manager.chain.clone();
                let stop = shutdown.clone();
                pins.process_blocks(&chain, DELETE_SPENTS_PIN_NAME, shutdown, |block| {
                    let manager = manager.clone();
                    let mut stop = stop.clone();
                    async move {
                        // outputs of this block must be indexed before they can be deleted
                        tokio::select! {
                            _ = manager.pin_store.wait_for_pin(PIN_NAME, block.height()) => {}
                            _ = shutdown_requested(&mut stop) => return Err(WalletError::ShuttingDown),
                        }
                        manager.delete_spent_outputs(&block)
                    }
                })
                .await
            })
        };
        vec![indexer, cleaner]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainlib::chain::TxPool;
    use chainlib::consensus;
    use chainlib::crypto::PrivateKey;
    use chainlib::db::MemDb;
    use chainlib::store::Store;
    use chainlib::types::{Transaction, TxInput, TxOutput};
    use chrono::Utc;

    struct Fixture {
        chain: Arc<Chain>,
        accounts_db: Arc<dyn Db>,
        utxo_db: Arc<dyn Db>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(Store::new(Arc::new(MemDb::new())));
            let chain =
                Chain::new(consensus::init_block().hash(), store, Arc::new(TxPool::new()))
                    .unwrap();
            chain.add_block(&consensus::init_block()).unwrap();
            Fixture {
                chain: Arc::new(chain),
                accounts_db: Arc::new(MemDb::new()),
                utxo_db: Arc::new(MemDb::new()),
            }
        }
        fn manager(&self) -> Arc<Manager> {
            let pins = Arc::new(PinStore::new(self.utxo_db.clone()));
            pins.load_all().unwrap();
            Arc::new(
                Manager::new(
                    self.accounts_db.clone(),
                    self.utxo_db.clone(),
                    self.chain.clone(),
                    pins,
                )
                .unwrap(),
            )
        }
        fn commit(&self, txs: Vec<Transaction>) -> Block {
            let tip = self.chain.get_block(self.chain.height()).unwrap().unwrap();
            let block = Block::next(&tip, txs, Utc::now());
            self.chain.add_block(&block).unwrap();
            block
        }
    }

    fn pay(program: &[u8], amount: u64) -> Transaction {
        Transaction::new(
            vec![TxInput::Issuance {
                asset_id: consensus::native_asset_id(),
                amount,
                nonce: Uuid::new_v4(),
            }],
            vec![TxOutput {
                asset_id: consensus::native_asset_id(),
                amount,
                control_program: program.to_vec(),
                unique_id: Uuid::new_v4(),
            }],
        )
    }

    fn spend(output_id: Hash) -> Transaction {
        Transaction::new(
            vec![TxInput::Spend {
                spent_output_id: output_id,
            }],
            vec![],
        )
    }

    #[test]
    fn aliases_are_unique() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let xpub = PrivateKey::new_key().public_key();
        let alice = manager.create(vec![xpub.clone()], 1, Some("alice".into())).unwrap();
        assert_eq!(manager.find_by_alias("alice").unwrap(), alice);
        assert!(matches!(
            manager.create(vec![xpub], 1, Some("alice".into())),
            Err(WalletError::DuplicateAlias(_))
        ));
        assert!(matches!(
            manager.find_by_alias("bob"),
            Err(WalletError::AliasNotFound(_))
        ));
    }

    #[test]
    fn rejects_bad_quorum() {
        let fx = Fixture::new();
        let xpub = PrivateKey::new_key().public_key();
        assert!(matches!(
            fx.manager().create(vec![xpub], 2, None),
            Err(WalletError::BadQuorum(1))
        ));
    }

    #[test]
    fn replaying_a_block_is_a_no_op() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let acc = manager
            .create(vec![PrivateKey::new_key().public_key()], 1, None)
            .unwrap();
        let block = fx.commit(vec![pay(&acc.control_program, 10)]);
        manager.index_account_utxos(&block).unwrap();
        let once = manager.list_unspent_outputs(None).unwrap();
        manager.index_account_utxos(&block).unwrap();
        assert_eq!(manager.list_unspent_outputs(None).unwrap(), once);
        assert_eq!(once.len(), 1);
        assert_eq!(once[0].account_id, acc.id);
    }

    #[test]
    fn outputs_spent_in_their_own_block_are_never_indexed() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let acc = manager
            .create(vec![PrivateKey::new_key().public_key()], 1, None)
            .unwrap();
        let funding = pay(&acc.control_program, 3);
        let spender = spend(funding.output_id(0));
        let block = fx.commit(vec![funding, spender]);
        manager.index_account_utxos(&block).unwrap();
        assert!(manager.list_unspent_outputs(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn crash_between_apply_and_advance_converges() {
        // reference run without interruption
        let clean = Fixture::new();
        let clean_mgr = clean.manager();
        let acc = clean_mgr
            .create(vec![PrivateKey::new_key().public_key()], 1, Some("a".into()))
            .unwrap();
        let funding = pay(&acc.control_program, 5);
        let spent_id = funding.output_id(0);
        let b2 = clean.commit(vec![funding, pay(&acc.control_program, 7)]);
        let b3 = clean.commit(vec![spend(spent_id)]);

        // crashed run: block 2 applied, pin left at 1
        let crashed = Fixture::new();
        crashed.accounts_db.write_batch(
            clean
                .accounts_db
                .iter_prefix(b"")
                .into_iter()
                .map(|(k, v)| BatchOp::Set(k, v))
                .collect(),
        )
        .unwrap();
        crashed.chain.add_block(&b2).unwrap();
        crashed.chain.add_block(&b3).unwrap();
        {
            let mgr = crashed.manager();
            mgr.pin_store.create_pin(PIN_NAME, 1).unwrap();
            mgr.pin_store.create_pin(DELETE_SPENTS_PIN_NAME, 1).unwrap();
            mgr.index_account_utxos(&b2).unwrap();
        }

        for (fx, fresh) in [(&clean, true), (&crashed, false)] {
            let mgr = fx.manager();
            if fresh {
                mgr.pin_store.create_pin(PIN_NAME, 1).unwrap();
                mgr.pin_store.create_pin(DELETE_SPENTS_PIN_NAME, 1).unwrap();
            }
            let (stop_tx, stop_rx) = watch::channel(false);
            let handles = mgr.process_blocks(stop_rx);
            mgr.pin_store.wait_for_pin(DELETE_SPENTS_PIN_NAME, 3).await;
            stop_tx.send(true).unwrap();
            for handle in handles {
                handle.await.unwrap();
            }
        }

        let expected = clean.manager().list_unspent_outputs(None).unwrap();
        let actual = crashed.manager().list_unspent_outputs(None).unwrap();
        assert_eq!(expected.len(), 1);
        assert_eq!(expected[0].amount, 7);
        assert_eq!(actual, expected);
    }
}
