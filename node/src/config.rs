//! Node configuration.
//!
//! Loaded once from `<home>/config.toml`, then overridden by a few
//! environment variables and finally by command line flags. The result is
//! shared read-only as `Arc<Config>`.

use crate::error::NodeError;
use chainlib::db::DbBackend;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Root directory that relative paths are resolved against.
    #[serde(skip)]
    pub home: PathBuf,
    #[serde(default)]
    pub base: BaseConfig,
    #[serde(default)]
    pub p2p: P2pConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub process: ProcessConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseConfig {
    pub moniker: String,
    pub db_backend: DbBackend,
    pub db_path: PathBuf,
    pub fast_sync: bool,
    /// Core HTTP server address (dashboard and wallet routes).
    pub api_addr: String,
    /// Diagnostics server; empty disables it.
    pub prof_laddr: String,
    pub keys_path: PathBuf,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            moniker: "anonymous".to_string(),
            db_backend: DbBackend::default(),
            db_path: PathBuf::from("data"),
            fast_sync: true,
            api_addr: "127.0.0.1:1999".to_string(),
            prof_laddr: String::new(),
            keys_path: PathBuf::from("keystore"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    pub laddr: String,
    /// Comma separated `host:port` list.
    pub seeds: String,
    pub pex: bool,
    pub addr_book_file: PathBuf,
    pub addr_book_strict: bool,
    pub skip_upnp: bool,
    pub max_num_peers: usize,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            laddr: "tcp://0.0.0.0:46656".to_string(),
            seeds: String::new(),
            pex: true,
            addr_book_file: PathBuf::from("addrbook.json"),
            addr_book_strict: true,
            skip_upnp: true,
            max_num_peers: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Comma separated; empty disables the RPC listeners.
    pub laddr: String,
    pub grpc_laddr: String,
    /// Adds administrative routes.
    #[serde(rename = "unsafe")]
    pub unsafe_routes: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            laddr: "tcp://0.0.0.0:46657".to_string(),
            grpc_laddr: String::new(),
            unsafe_routes: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub enable: bool,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self { enable: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub root_ca_certs: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub log_level: String,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            root_ca_certs: None,
            log_file: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Defaults rooted at `home`, with every listener on an ephemeral
    /// loopback port. Used by tests and by `init`.
    pub fn test_config(home: &Path) -> Self {
        let mut config = Config {
            home: home.to_path_buf(),
            ..Default::default()
        };
        config.base.db_backend = DbBackend::MemDb;
        config.base.api_addr = "127.0.0.1:0".to_string();
        config.p2p.laddr = "tcp://127.0.0.1:0".to_string();
        config.p2p.addr_book_strict = false;
        config.rpc.laddr = "tcp://127.0.0.1:0".to_string();
        config
    }

    /// Reads `<home>/config.toml` if present, otherwise starts from defaults.
    pub fn load(home: &Path) -> Result<Self, NodeError> {
        let path = home.join(CONFIG_FILE);
        let mut config: Config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| NodeError::Config(format!("read {}: {e}", path.display())))?;
            toml::from_str(&content)
                .map_err(|e| NodeError::Config(format!("parse {}: {e}", path.display())))?
        } else {
            Config::default()
        };
        config.home = home.to_path_buf();
        config.apply_env();
        Ok(config)
    }

    pub fn save(&self) -> Result<(), NodeError> {
        let content = toml::to_string_pretty(self).map_err(|e| NodeError::Config(e.to_string()))?;
        std::fs::create_dir_all(&self.home)
            .and_then(|_| std::fs::write(self.home.join(CONFIG_FILE), content))
            .map_err(|e| NodeError::Config(e.to_string()))
    }

    // LISTEN, ROOT_CA_CERTS and LOGFILE win over the file
    fn apply_env(&mut self) {
        if let Ok(listen) = std::env::var("LISTEN") {
            self.base.api_addr = listen;
        }
        if let Ok(path) = std::env::var("ROOT_CA_CERTS") {
            if !path.is_empty() {
                self.process.root_ca_certs = Some(PathBuf::from(path));
            }
        }
        if let Ok(path) = std::env::var("LOGFILE") {
            if !path.is_empty() {
                self.process.log_file = Some(PathBuf::from(path));
            }
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.home.join(path)
        }
    }

    pub fn db_dir(&self) -> PathBuf {
        self.resolve(&self.base.db_path)
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.resolve(&self.base.keys_path)
    }

    pub fn addr_book_file(&self) -> PathBuf {
        self.resolve(&self.p2p.addr_book_file)
    }

    pub fn seeds(&self) -> Vec<String> {
        split_list(&self.p2p.seeds)
    }

    pub fn rpc_listen_addrs(&self) -> Vec<String> {
        split_list(&self.rpc.laddr)
    }
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
