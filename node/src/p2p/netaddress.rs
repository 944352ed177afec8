use crate::error::SwitchError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NetAddress {
    pub ip: IpAddr,
    pub port: u16,
}

impl NetAddress {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn valid(&self) -> bool {
        !self.ip.is_unspecified() && self.port != 0
    }

    /// Reachable from the public internet.
    pub fn routable(&self) -> bool {
        if !self.valid() {
            return false;
        }
        match self.ip {
            IpAddr::V4(ip) => {
                !(ip.is_private()
                    || ip.is_loopback()
                    || ip.is_link_local()
                    || ip.is_broadcast()
                    || ip.is_documentation())
            }
            IpAddr::V6(ip) => {
                let unique_local = (ip.segments()[0] & 0xfe00) == 0xfc00;
                !(ip.is_loopback() || unique_local)
            }
        }
    }
}

impl FromStr for NetAddress {
    type Err = SwitchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix("tcp://").unwrap_or(s);
        s.parse::<SocketAddr>()
            .map(NetAddress::new)
            .map_err(|_| SwitchError::InvalidAddress(s.to_string()))
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

impl Serialize for NetAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NetAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_or_without_scheme() {
        let a: NetAddress = "tcp://10.0.0.1:46656".parse().unwrap();
        let b: NetAddress = "10.0.0.1:46656".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "10.0.0.1:46656");
        assert!("not-an-address".parse::<NetAddress>().is_err());
    }

    #[test]
    fn routability() {
        assert!(!"10.0.0.1:1".parse::<NetAddress>().unwrap().routable());
        assert!(!"127.0.0.1:1".parse::<NetAddress>().unwrap().routable());
        assert!(!"8.8.8.8:0".parse::<NetAddress>().unwrap().routable());
        assert!("8.8.8.8:46656".parse::<NetAddress>().unwrap().routable());
    }
}
