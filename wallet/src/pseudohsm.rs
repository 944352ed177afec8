//! File backed key storage. Each key lives in its own JSON file under the
//! keys directory, named after its public key.

use crate::error::{Result, WalletError};
use chainlib::crypto::{PrivateKey, PublicKey, Signature};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct XPub {
    pub alias: Option<String>,
    pub xpub: PublicKey,
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    alias: Option<String>,
    xpub: PublicKey,
    xprv: String,
}

pub struct PseudoHsm {
    dir: PathBuf,
    keys: RwLock<HashMap<String, (XPub, PrivateKey)>>,
}

impl PseudoHsm {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let mut keys = HashMap::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let file: KeyFile = match fs::read(&path)
                .map_err(WalletError::from)
                .and_then(|raw| Ok(serde_json::from_slice(&raw)?))
            {
                Ok(file) => file,
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping unreadable key file");
                    continue;
                }
            };
            let xprv = PrivateKey::from_hex(&file.xprv)?;
            let xpub = XPub {
                alias: file.alias,
                xpub: file.xpub,
            };
            keys.insert(xpub.xpub.to_hex(), (xpub, xprv));
        }
        info!(dir = %dir.display(), keys = keys.len(), "key store opened");
        Ok(PseudoHsm {
            dir: dir.to_path_buf(),
            keys: RwLock::new(keys),
        })
    }

    fn key_path(&self, xpub: &PublicKey) -> PathBuf {
        self.dir.join(format!("{}.json", xpub.to_hex()))
    }

    pub fn xcreate(&self, alias: Option<String>) -> Result<XPub> {
        let alias = alias.map(|a| a.trim().to_string()).filter(|a| !a.is_empty());
        let mut keys = self.keys.write();
        if let Some(alias) = &alias {
            if keys.values().any(|(x, _)| x.alias.as_ref() == Some(alias)) {
                return Err(WalletError::DuplicateAlias(alias.clone()));
            }
        }
        let xprv = PrivateKey::new_key();
        let xpub = XPub {
            alias,
            xpub: xprv.public_key(),
        };
        let file = KeyFile {
            alias: xpub.alias.clone(),
            xpub: xpub.xpub.clone(),
            xprv: xprv.to_hex(),
        };
        fs::write(self.key_path(&xpub.xpub), serde_json::to_vec_pretty(&file)?)?;
        keys.insert(xpub.xpub.to_hex(), (xpub.clone(), xprv));
        Ok(xpub)
    }

    pub fn list_keys(&self) -> Vec<XPub> {
        let mut keys: Vec<XPub> = self.keys.read().values().map(|(x, _)| x.clone()).collect();
        keys.sort_by_key(|x| x.xpub.to_hex());
        keys
    }

    pub fn xsign(&self, xpub: &PublicKey, message: &[u8]) -> Result<Signature> {
        let keys = self.keys.read();
        let (_, xprv) = keys
            .get(&xpub.to_hex())
            .ok_or_else(|| WalletError::NotFound(format!("key {}", xpub.to_hex())))?;
        Ok(xprv.sign(message))
    }

    pub fn xdelete(&self, xpub: &PublicKey) -> Result<()> {
        let mut keys = self.keys.write();
        if keys.remove(&xpub.to_hex()).is_none() {
            return Err(WalletError::NotFound(format!("key {}", xpub.to_hex())));
        }
        fs::remove_file(self.key_path(xpub))?;
        Ok(())
    }
}
