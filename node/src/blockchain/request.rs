use crate::error::BuildRequestError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use wallet::account::Manager;
use wallet::asset::Registry;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct BuildRequest {
    #[serde(rename = "base_transaction", default)]
    pub tx: Option<Value>,
    pub actions: Vec<Map<String, Value>>,
    /// Seconds the built template stays valid.
    #[serde(default)]
    pub ttl: u64,
}

/// Looks up ids for the aliases used in build requests.
pub trait AliasResolver {
    fn asset_id(&self, alias: &str) -> Option<String>;
    fn account_id(&self, alias: &str) -> Option<String>;
}

pub struct WalletAliases {
    pub accounts: Arc<Manager>,
    pub assets: Arc<Registry>,
}

impl AliasResolver for WalletAliases {
    fn asset_id(&self, alias: &str) -> Option<String> {
        self.assets.find_id_by_alias(alias).ok().map(|id| id.to_hex())
    }

    fn account_id(&self, alias: &str) -> Option<String> {
        self.accounts.find_by_alias(alias).ok().map(|acc| acc.id)
    }
}

fn non_empty_str<'a>(action: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    action.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

impl BuildRequest {
    /// Returns a copy with `asset_alias`/`account_alias` resolved into
    /// `asset_id`/`account_id` wherever the id is missing. On failure
    /// nothing is returned and `self` is untouched.
    pub fn filter_aliases(
        &self,
        resolver: &impl AliasResolver,
    ) -> Result<BuildRequest, BuildRequestError> {
        let mut resolved = self.clone();
        for (index, action) in resolved.actions.iter_mut().enumerate() {
            if non_empty_str(action, "asset_id").is_none() {
                if let Some(alias) = non_empty_str(action, "asset_alias") {
                    let id = resolver.asset_id(alias).ok_or_else(|| {
                        BuildRequestError::InvalidAssetAlias {
                            index,
                            alias: alias.to_string(),
                        }
                    })?;
                    action.insert("asset_id".to_string(), Value::String(id));
                }
            }
            if non_empty_str(action, "account_id").is_none() {
                if let Some(alias) = non_empty_str(action, "account_alias") {
                    let id = resolver.account_id(alias).ok_or_else(|| {
                        BuildRequestError::InvalidAccountAlias {
                            index,
                            alias: alias.to_string(),
                        }
                    })?;
                    action.insert("account_id".to_string(), Value::String(id));
                }
            }
        }
        Ok(resolved)
    }
}
