use crate::error::SwitchError;
use chainlib::crypto::PublicKey;
use serde::{Deserialize, Serialize};

/// What a node tells its peers about itself during the handshake.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NodeInfo {
    pub pub_key: PublicKey,
    pub moniker: String,
    pub network: String,
    pub version: String,
    /// `host:port` peers can dial back; empty until a listener is attached.
    pub listen_addr: String,
    /// `key=value` pairs such as `p2p_version` or `rpc_addr`.
    pub other: Vec<String>,
}

impl NodeInfo {
    pub fn id(&self) -> String {
        self.pub_key.to_hex()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.other.iter().find_map(|entry| {
            let (k, v) = entry.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    pub fn compatible_with(&self, other: &NodeInfo) -> Result<(), SwitchError> {
        if self.network != other.network {
            return Err(SwitchError::Incompatible(format!(
                "network {} != {}",
                other.network, self.network
            )));
        }
        let major = |v: &str| v.split('.').next().map(str::to_string);
        let ours = self.get("p2p_version").map(major);
        let theirs = other.get("p2p_version").map(major);
        if ours != theirs {
            return Err(SwitchError::Incompatible(format!(
                "p2p version {:?} != {:?}",
                other.get("p2p_version"),
                self.get("p2p_version")
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainlib::crypto::PrivateKey;

    fn info(network: &str, p2p: &str) -> NodeInfo {
        NodeInfo {
            pub_key: PrivateKey::new_key().public_key(),
            moniker: "m".into(),
            network: network.into(),
            version: "0.1.0".into(),
            listen_addr: String::new(),
            other: vec![format!("p2p_version={p2p}"), "rpc_addr=:46657".into()],
        }
    }

    #[test]
    fn reads_other_entries() {
        assert_eq!(info("chain0", "0.5.0").get("rpc_addr"), Some(":46657"));
        assert_eq!(info("chain0", "0.5.0").get("missing"), None);
    }

    #[test]
    fn compatibility_checks_network_and_major_version() {
        let ours = info("chain0", "0.5.0");
        assert!(ours.compatible_with(&info("chain0", "0.5.3")).is_ok());
        assert!(ours.compatible_with(&info("chain1", "0.5.0")).is_err());
        assert!(ours.compatible_with(&info("chain0", "1.0.0")).is_err());
    }
}
