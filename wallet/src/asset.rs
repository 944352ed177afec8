//! Asset definitions known to this wallet.

use crate::error::{Result, WalletError};
use chainlib::consensus;
use chainlib::crypto::PublicKey;
use chainlib::db::{BatchOp, Db};
use chainlib::sha256::Hash;
use crossbeam_skiplist::SkipMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;

pub const NATIVE_ALIAS: &str = "native";

const ASSET_PREFIX: &str = "asset:";
const ALIAS_PREFIX: &str = "asset-alias:";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Asset {
    pub id: Hash,
    pub alias: Option<String>,
    pub xpubs: Vec<PublicKey>,
    pub quorum: usize,
    #[serde(with = "hex::serde")]
    pub issuance_program: Vec<u8>,
    pub definition: Map<String, Value>,
}

pub struct Registry {
    db: Arc<dyn Db>,
    genesis_hash: Hash,
    by_alias: SkipMap<String, Hash>,
}

impl Registry {
    pub fn new(db: Arc<dyn Db>, genesis_hash: Hash) -> Result<Self> {
        let by_alias = SkipMap::new();
        by_alias.insert(NATIVE_ALIAS.to_string(), consensus::native_asset_id());
        for (_, raw) in db.iter_prefix(ASSET_PREFIX.as_bytes()) {
            let asset: Asset = serde_json::from_slice(&raw)?;
            if let Some(alias) = asset.alias {
                by_alias.insert(alias, asset.id);
            }
        }
        Ok(Registry {
            db,
            genesis_hash,
            by_alias,
        })
    }

    /// Defines a new asset. Its id commits to the issuance program, the
    /// chain's genesis block and the definition.
    pub fn define(
        &self,
        xpubs: Vec<PublicKey>,
        quorum: usize,
        definition: Map<String, Value>,
        alias: Option<String>,
    ) -> Result<Asset> {
        if quorum == 0 || quorum > xpubs.len() {
            return Err(WalletError::BadQuorum(xpubs.len()));
        }
        let alias = alias.map(|a| a.trim().to_string()).filter(|a| !a.is_empty());
        if let Some(alias) = &alias {
            if self.by_alias.contains_key(alias) {
                return Err(WalletError::DuplicateAlias(alias.clone()));
            }
        }
        let keys: Vec<String> = xpubs.iter().map(|k| k.to_hex()).collect();
        let issuance_program = Hash::hash(&(&keys, quorum, uuid::Uuid::new_v4()))
            .as_bytes()
            .to_vec();
        let encoded_definition = serde_json::to_string(&definition)?;
        let id = Hash::hash(&(
            hex::encode(&issuance_program),
            self.genesis_hash,
            encoded_definition,
        ));
        let asset = Asset {
            id,
            alias: alias.clone(),
            xpubs,
            quorum,
            issuance_program,
            definition,
        };

        let mut ops = vec![BatchOp::Set(
            format!("{ASSET_PREFIX}{id}").into_bytes(),
            serde_json::to_vec(&asset)?,
        )];
        if let Some(alias) = &alias {
            ops.push(BatchOp::Set(
                format!("{ALIAS_PREFIX}{alias}").into_bytes(),
                id.to_hex().into_bytes(),
            ));
        }
        self.db.write_batch(ops)?;
        if let Some(alias) = alias {
            self.by_alias.insert(alias, id);
        }
        info!(asset = %id, "asset defined");
        Ok(asset)
    }

    pub fn find_by_id(&self, id: &Hash) -> Result<Asset> {
        let raw = self
            .db
            .get(format!("{ASSET_PREFIX}{id}").as_bytes())
            .ok_or_else(|| WalletError::NotFound(format!("asset {id}")))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Resolves an alias to an asset id. The native asset is always known.
    pub fn find_id_by_alias(&self, alias: &str) -> Result<Hash> {
        self.by_alias
            .get(alias)
            .map(|entry| *entry.value())
            .ok_or_else(|| WalletError::AliasNotFound(alias.to_string()))
    }

    pub fn list(&self) -> Result<Vec<Asset>> {
        self.db
            .iter_prefix(ASSET_PREFIX.as_bytes())
            .into_iter()
            .map(|(_, raw)| serde_json::from_slice(&raw).map_err(WalletError::from))
            .collect()
    }
}
