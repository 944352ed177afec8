use super::netaddress::NetAddress;
use crate::error::SwitchError;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

/// Accepts inbound peer connections on one TCP address.
pub struct DefaultListener {
    listener: TcpListener,
    internal: NetAddress,
    external: NetAddress,
}

impl DefaultListener {
    pub async fn new(protocol: &str, laddr: &str, skip_upnp: bool) -> Result<Self, SwitchError> {
        if protocol != "tcp" {
            return Err(SwitchError::UnsupportedProtocol(protocol.to_string()));
        }
        let listener = TcpListener::bind(laddr).await?;
        let internal = NetAddress::new(listener.local_addr()?);
        if !skip_upnp {
            warn!("UPnP port mapping is not supported, advertising the local address");
        }
        let external = if internal.ip.is_unspecified() {
            NetAddress {
                ip: local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
                port: internal.port,
            }
        } else {
            internal
        };
        info!(%internal, %external, "p2p listener bound");
        Ok(Self {
            listener,
            internal,
            external,
        })
    }

    pub fn internal_address(&self) -> NetAddress {
        self.internal
    }

    /// The address peers should dial.
    pub fn external_address(&self) -> NetAddress {
        self.external
    }

    pub async fn accept(&self) -> std::io::Result<(TcpStream, NetAddress)> {
        let (stream, addr) = self.listener.accept().await?;
        Ok((stream, NetAddress::new(addr)))
    }
}

// the address of the interface used for outbound traffic; nothing is sent
fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}
