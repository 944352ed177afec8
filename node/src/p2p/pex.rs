//! Peer exchange: gossips addresses into the address book and keeps the
//! switch dialing until it has enough outbound peers.

use super::addrbook::AddrBook;
use super::conn;
use super::netaddress::NetAddress;
use super::peer::Peer;
use super::reactor::{ChannelDescriptor, Reactor};
use super::switch::Switch;
use crate::error::SwitchError;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

pub const PEX_CHANNEL: u8 = 0x00;
const ENSURE_PEERS_PERIOD: Duration = Duration::from_secs(30);
const MIN_OUTBOUND_PEERS: usize = 10;
const MAX_MSG_COUNT_PER_PERIOD: u32 = 1000;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum PexMessage {
    Request,
    Addrs(Vec<NetAddress>),
}

pub struct PexReactor {
    me: Weak<PexReactor>,
    book: Arc<AddrBook>,
    switch: OnceLock<Weak<Switch>>,
    // messages received per peer since the last ensure-peers round
    msg_counts: DashMap<String, u32>,
    quit: watch::Sender<bool>,
    routine: Mutex<Option<JoinHandle<()>>>,
}

impl PexReactor {
    pub fn new(book: Arc<AddrBook>) -> Arc<Self> {
        let (quit, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            book,
            switch: OnceLock::new(),
            msg_counts: DashMap::new(),
            quit,
            routine: Mutex::new(None),
        })
    }

    fn switch(&self) -> Option<Arc<Switch>> {
        self.switch.get().and_then(Weak::upgrade)
    }

    pub async fn request_addrs(&self, peer: &Peer) {
        if let Ok(msg) = conn::encode(&PexMessage::Request) {
            peer.send(PEX_CHANNEL, msg);
        }
    }

    async fn send_addrs(&self, peer: &Peer, addrs: Vec<NetAddress>) {
        if let Ok(msg) = conn::encode(&PexMessage::Addrs(addrs)) {
            peer.send(PEX_CHANNEL, msg);
        }
    }

    async fn on_tick(&self) {
        self.msg_counts.clear();
        self.ensure_peers().await;
    }

    /// Dials random addresses from the book while below the outbound
    /// target, and asks a random peer for more addresses if the book is
    /// thin.
    pub async fn ensure_peers(&self) {
        let Some(sw) = self.switch() else {
            return;
        };
        let (outbound, _, dialing) = sw.num_peers();
        let need = MIN_OUTBOUND_PEERS.saturating_sub(outbound + dialing);
        debug!(outbound, dialing, need, "ensure peers");
        if need > 0 {
            // bias toward untried addresses when we have few peers
            let bias = (100 - outbound.min(10) * 10).max(30) as u32;
            let connected: Vec<NetAddress> = sw.peers().iter().map(|p| p.addr).collect();
            let mut picked = Vec::new();
            for _ in 0..need * 3 {
                if picked.len() >= need {
                    break;
                }
                let Some(addr) = self.book.pick_address(bias) else {
                    break;
                };
                if picked.contains(&addr) || connected.contains(&addr) || sw.is_dialing(&addr) {
                    continue;
                }
                picked.push(addr);
            }
            for addr in picked {
                let sw = sw.clone();
                let book = self.book.clone();
                tokio::spawn(async move {
                    book.mark_attempt(&addr);
                    match sw.dial_peer_with_address(addr).await {
                        Ok(_) => book.mark_good(&addr),
                        Err(err) => {
                            debug!(%addr, %err, "dialing book address failed");
                            book.mark_failed(&addr);
                        }
                    }
                });
            }
        }

        if self.book.need_more_addrs() {
            let peer = sw.peers().choose(&mut rand::thread_rng()).cloned();
            if let Some(peer) = peer {
                self.request_addrs(&peer).await;
            }
        }
    }
}

#[async_trait]
impl Reactor for PexReactor {
    fn channels(&self) -> Vec<ChannelDescriptor> {
        vec![ChannelDescriptor {
            id: PEX_CHANNEL,
            name: "PEX",
            priority: 1,
        }]
    }

    fn set_switch(&self, switch: Weak<Switch>) {
        let _ = self.switch.set(switch);
    }

    async fn on_start(&self) -> Result<(), SwitchError> {
        let Some(reactor) = self.me.upgrade() else {
            return Ok(());
        };
        let mut quit = self.quit.subscribe();
        let handle = tokio::spawn(async move {
            let mut interval = time::interval(ENSURE_PEERS_PERIOD);
            loop {
                tokio::select! {
                    _ = quit.wait_for(|q| *q) => break,
                    _ = interval.tick() => {}
                }
                reactor.on_tick().await;
            }
        });
        *self.routine.lock() = Some(handle);
        Ok(())
    }

    async fn on_stop(&self) {
        self.quit.send_replace(true);
        let routine = self.routine.lock().take();
        if let Some(handle) = routine {
            let _ = handle.await;
        }
    }

    async fn add_peer(&self, peer: Arc<Peer>) {
        if peer.outbound {
            if self.book.need_more_addrs() {
                self.request_addrs(&peer).await;
            }
        } else if let Ok(addr) = peer.node_info.listen_addr.parse::<NetAddress>() {
            // inbound peers tell us where they can be dialed
            self.book.add_address(addr, peer.addr);
        }
    }

    async fn remove_peer(&self, peer: Arc<Peer>, _reason: &str) {
        self.msg_counts.remove(&peer.id());
    }

    async fn receive(&self, _channel: u8, peer: Arc<Peer>, msg: Vec<u8>) {
        let count = {
            let mut entry = self.msg_counts.entry(peer.id()).or_insert(0);
            *entry += 1;
            *entry
        };
        if count > MAX_MSG_COUNT_PER_PERIOD {
            if let Some(sw) = self.switch() {
                sw.stop_peer_for_error(&peer, "too many pex messages").await;
            }
            return;
        }
        match conn::decode::<PexMessage>(&msg) {
            Ok(PexMessage::Request) => {
                let selection = self.book.get_selection();
                self.send_addrs(&peer, selection).await;
            }
            Ok(PexMessage::Addrs(addrs)) => {
                let added = addrs
                    .into_iter()
                    .filter(|addr| self.book.add_address(*addr, peer.addr))
                    .count();
                info!(peer = %peer.id(), added, "received addresses");
            }
            Err(err) => {
                warn!(peer = %peer.id(), %err, "bad pex message");
                if let Some(sw) = self.switch() {
                    sw.stop_peer_for_error(&peer, "bad pex message").await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::node_info::NodeInfo;
    use chainlib::crypto::PrivateKey;

    fn peer(listen_addr: &str) -> (Arc<Peer>, kanal::AsyncReceiver<(u8, Vec<u8>)>) {
        let info = NodeInfo {
            pub_key: PrivateKey::new_key().public_key(),
            moniker: "remote".into(),
            network: "chain0".into(),
            version: "0.1.0".into(),
            listen_addr: listen_addr.into(),
            other: vec![],
        };
        let (peer, queue) = Peer::new(info, "10.0.0.9:5000".parse().unwrap(), false);
        (Arc::new(peer), queue)
    }

    fn book() -> (tempfile::TempDir, Arc<AddrBook>) {
        let dir = tempfile::tempdir().unwrap();
        let book = Arc::new(AddrBook::new(&dir.path().join("book.json"), false));
        (dir, book)
    }

    #[tokio::test]
    async fn answers_requests_with_book_selection() {
        let (_dir, book) = book();
        let known: NetAddress = "10.0.0.1:46656".parse().unwrap();
        book.add_address(known, known);
        let pex = PexReactor::new(book);
        let (peer, queue) = peer("");

        let request = conn::encode(&PexMessage::Request).unwrap();
        pex.receive(PEX_CHANNEL, peer, request).await;
        let (channel, bytes) = queue.recv().await.unwrap();
        assert_eq!(channel, PEX_CHANNEL);
        assert_eq!(
            conn::decode::<PexMessage>(&bytes).unwrap(),
            PexMessage::Addrs(vec![known])
        );
    }

    #[tokio::test]
    async fn learns_addresses_from_gossip_and_inbound_peers() {
        let (_dir, book) = book();
        let pex = PexReactor::new(book.clone());
        let (peer, _queue) = peer("10.0.0.9:46656");

        pex.add_peer(peer.clone()).await;
        assert!(book.has(&"10.0.0.9:46656".parse().unwrap()));

        let gossip = PexMessage::Addrs(vec!["10.0.0.2:46656".parse().unwrap()]);
        pex.receive(PEX_CHANNEL, peer, conn::encode(&gossip).unwrap())
            .await;
        assert!(book.has(&"10.0.0.2:46656".parse().unwrap()));
        assert_eq!(book.size(), 2);
    }
}
