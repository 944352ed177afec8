//! The peer connection pool and reactor registry.

use super::addrbook::AddrBook;
use super::conn::{self, HANDSHAKE_CHANNEL};
use super::listener::DefaultListener;
use super::netaddress::NetAddress;
use super::node_info::NodeInfo;
use super::peer::{Peer, SendStatus};
use super::reactor::Reactor;
use crate::config::P2pConfig;
use crate::error::{ServiceError, SwitchError};
use crate::service::{BaseService, ServiceState};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::ReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{RwLock as AsyncRwLock, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;
use tracing::{debug, error, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);
const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

pub struct Switch {
    service: BaseService,
    config: P2pConfig,
    reactors: RwLock<Vec<(String, Arc<dyn Reactor>)>>,
    channels: RwLock<HashMap<u8, Arc<dyn Reactor>>>,
    listeners: RwLock<Vec<Arc<DefaultListener>>>,
    node_info: RwLock<Option<NodeInfo>>,
    peers: DashMap<String, Arc<Peer>>,
    dialing: DashMap<NetAddress, ()>,
    accepting: AtomicBool,
    quit: watch::Sender<bool>,
    // held shared while a peer is registered, exclusively by stop
    admission: AsyncRwLock<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Switch {
    pub fn new(config: P2pConfig) -> Arc<Self> {
        let (quit, _) = watch::channel(false);
        Arc::new(Self {
            service: BaseService::new("Switch"),
            config,
            reactors: RwLock::new(Vec::new()),
            channels: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            node_info: RwLock::new(None),
            peers: DashMap::new(),
            dialing: DashMap::new(),
            accepting: AtomicBool::new(false),
            quit,
            admission: AsyncRwLock::new(()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Registers a reactor under a unique name. Only allowed before start.
    pub fn add_reactor(
        self: &Arc<Self>,
        name: &str,
        reactor: Arc<dyn Reactor>,
    ) -> Result<Arc<dyn Reactor>, SwitchError> {
        if self.service.state() != ServiceState::Created {
            return Err(SwitchError::ReactorAfterStart);
        }
        let mut reactors = self.reactors.write();
        if reactors.iter().any(|(n, _)| n == name) {
            return Err(SwitchError::DuplicateReactor(name.to_string()));
        }
        let mut channels = self.channels.write();
        let descriptors = reactor.channels();
        for desc in &descriptors {
            if desc.id == HANDSHAKE_CHANNEL || channels.contains_key(&desc.id) {
                return Err(SwitchError::DuplicateChannel(desc.id));
            }
        }
        for desc in descriptors {
            channels.insert(desc.id, reactor.clone());
        }
        reactor.set_switch(Arc::downgrade(self));
        reactors.push((name.to_string(), reactor.clone()));
        debug!(reactor = name, "reactor registered");
        Ok(reactor)
    }

    pub fn reactor(&self, name: &str) -> Option<Arc<dyn Reactor>> {
        self.reactors
            .read()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, r)| r.clone())
    }

    pub fn reactor_names(&self) -> Vec<String> {
        self.reactors.read().iter().map(|(n, _)| n.clone()).collect()
    }

    fn reactor_list(&self) -> Vec<(String, Arc<dyn Reactor>)> {
        self.reactors.read().clone()
    }

    pub fn add_listener(&self, listener: DefaultListener) {
        self.listeners.write().push(Arc::new(listener));
    }

    pub fn listeners(&self) -> Vec<Arc<DefaultListener>> {
        self.listeners.read().clone()
    }

    pub fn is_listening(&self) -> bool {
        !self.listeners.read().is_empty()
    }

    pub fn set_node_info(&self, info: NodeInfo) {
        *self.node_info.write() = Some(info);
    }

    pub fn node_info(&self) -> Option<NodeInfo> {
        self.node_info.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.service.is_running()
    }

    /// True once every reactor has started and the accept loops run.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Starts the reactors one by one in registration order, then begins
    /// accepting peers. A reactor failing to start aborts the whole start
    /// and stops the reactors that already started.
    pub async fn start(self: &Arc<Self>) -> Result<(), SwitchError> {
        self.service.begin_start()?;
        let reactors = self.reactor_list();
        for (i, (name, reactor)) in reactors.iter().enumerate() {
            if let Err(err) = reactor.on_start().await {
                error!(reactor = %name, %err, "reactor failed to start");
                for (_, started) in reactors[..i].iter().rev() {
                    started.on_stop().await;
                }
                self.service.finish_start(false);
                return Err(SwitchError::ReactorStart {
                    name: name.clone(),
                    reason: err.to_string(),
                });
            }
            info!(reactor = %name, "reactor started");
        }

        let mut tasks = self.tasks.lock();
        for listener in self.listeners() {
            let sw = self.clone();
            let quit = self.quit.subscribe();
            tasks.push(tokio::spawn(sw.accept_routine(listener, quit)));
        }
        drop(tasks);
        self.accepting.store(true, Ordering::SeqCst);
        self.service.finish_start(true);
        Ok(())
    }

    /// Stops accepting, disconnects every peer, then stops the reactors.
    /// Registrations already past their handshake finish first; later ones
    /// see the quit signal and drop their connection.
    pub async fn stop(&self) -> Result<(), ServiceError> {
        self.service.begin_stop()?;
        self.accepting.store(false, Ordering::SeqCst);
        self.quit.send_replace(true);
        // waits out registrations in progress; any later one sees quit
        drop(self.admission.write().await);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in tasks {
            let _ = handle.await;
        }
        self.listeners.write().clear();
        let peers = self.peers();
        for peer in &peers {
            self.stop_peer_gracefully(peer).await;
        }
        for peer in &peers {
            peer.join().await;
        }
        for (name, reactor) in self.reactor_list() {
            reactor.on_stop().await;
            debug!(reactor = %name, "reactor stopped");
        }
        self.service.finish_stop();
        Ok(())
    }

    async fn accept_routine(
        self: Arc<Self>,
        listener: Arc<DefaultListener>,
        mut quit: watch::Receiver<bool>,
    ) {
        let mut handshakes = JoinSet::new();
        loop {
            while handshakes.try_join_next().is_some() {}
            let accepted = tokio::select! {
                _ = quit.wait_for(|q| *q) => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, addr) = match accepted {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(%err, "accept failed");
                    continue;
                }
            };
            if self.peers.len() >= self.config.max_num_peers {
                info!(%addr, "ignoring inbound connection: already have enough peers");
                continue;
            }
            let sw = self.clone();
            handshakes.spawn(async move {
                if let Err(err) = sw.add_peer_with_conn(stream, addr, false).await {
                    debug!(%addr, %err, "ignoring inbound connection");
                }
            });
        }
        // stop already waited out registrations, so what is left never got
        // a peer and is dropped with its connection
        handshakes.shutdown().await;
    }

    /// Parses every seed first and fails on the first malformed one. The
    /// valid seeds go into the address book and are dialed in random order
    /// in the background; dial failures are only logged.
    pub fn dial_seeds(
        self: &Arc<Self>,
        book: Option<&Arc<AddrBook>>,
        seeds: &[String],
    ) -> Result<(), SwitchError> {
        let mut addrs = seeds
            .iter()
            .map(|s| s.parse::<NetAddress>())
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(book) = book {
            for addr in &addrs {
                book.add_address(*addr, *addr);
            }
            book.save();
        }
        addrs.shuffle(&mut rand::thread_rng());
        for addr in addrs {
            let sw = self.clone();
            tokio::spawn(async move {
                match sw.dial_peer_with_address(addr).await {
                    Ok(peer) => info!(%addr, peer = %peer.id(), "connected to seed"),
                    Err(err) => error!(%addr, %err, "error dialing seed"),
                }
            });
        }
        Ok(())
    }

    pub fn is_dialing(&self, addr: &NetAddress) -> bool {
        self.dialing.contains_key(addr)
    }

    pub async fn dial_peer_with_address(
        self: &Arc<Self>,
        addr: NetAddress,
    ) -> Result<Arc<Peer>, SwitchError> {
        if self.dialing.insert(addr, ()).is_some() {
            return Err(SwitchError::DuplicatePeer(addr.to_string()));
        }
        let result = self.connect(addr).await;
        self.dialing.remove(&addr);
        result
    }

    async fn connect(self: &Arc<Self>, addr: NetAddress) -> Result<Arc<Peer>, SwitchError> {
        let stream = time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr.socket_addr()))
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
        self.add_peer_with_conn(stream, addr, true).await
    }

    /// Handshakes over `stream` and, if the remote is acceptable, registers
    /// it and tells every reactor.
    pub async fn add_peer_with_conn(
        self: &Arc<Self>,
        mut stream: TcpStream,
        addr: NetAddress,
        outbound: bool,
    ) -> Result<Arc<Peer>, SwitchError> {
        if !self.is_running() {
            return Err(ServiceError::NotRunning("Switch").into());
        }
        let ours = self
            .node_info()
            .ok_or_else(|| SwitchError::Incompatible("local node info not set".into()))?;
        let mut quit = self.quit.subscribe();
        let theirs = tokio::select! {
            _ = quit.wait_for(|q| *q) => return Err(ServiceError::NotRunning("Switch").into()),
            shaken = time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut stream, &ours)) => {
                shaken.map_err(|_| SwitchError::HandshakeTimeout)??
            }
        };
        if theirs.pub_key == ours.pub_key {
            return Err(SwitchError::ConnectToSelf);
        }
        ours.compatible_with(&theirs)?;
        if self.peers.len() >= self.config.max_num_peers {
            return Err(SwitchError::TooManyPeers);
        }

        let _admission = self.admission.read().await;
        if *self.quit.borrow() {
            return Err(ServiceError::NotRunning("Switch").into());
        }
        let (peer, queue) = Peer::new(theirs, addr, outbound);
        let peer = Arc::new(peer);
        match self.peers.entry(peer.id()) {
            Entry::Occupied(_) => return Err(SwitchError::DuplicatePeer(peer.id())),
            Entry::Vacant(slot) => {
                slot.insert(peer.clone());
            }
        }

        let (reader, writer) = tokio::io::split(stream);
        peer.track(tokio::spawn(Peer::write_loop(
            peer.id(),
            writer,
            queue,
            peer.quit_signal(),
        )));
        for (_, reactor) in self.reactor_list() {
            reactor.add_peer(peer.clone()).await;
        }
        peer.track(tokio::spawn(self.clone().recv_routine(peer.clone(), reader)));
        info!(peer = %peer.id(), %addr, outbound, "added peer");
        Ok(peer)
    }

    async fn recv_routine(self: Arc<Self>, peer: Arc<Peer>, mut reader: ReadHalf<TcpStream>) {
        let mut quit = peer.quit_signal();
        let reason = loop {
            let frame = tokio::select! {
                _ = quit.wait_for(|q| *q) => return,
                frame = conn::receive_frame(&mut reader) => frame,
            };
            let (channel, msg) = match frame {
                Ok(frame) => frame,
                Err(err) => break err.to_string(),
            };
            let reactor = self.channels.read().get(&channel).cloned();
            match reactor {
                Some(reactor) => reactor.receive(channel, peer.clone(), msg).await,
                None => break format!("unknown channel {channel:#04x}"),
            }
        };
        self.stop_peer_for_error(&peer, &reason).await;
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|p| p.value().clone()).collect()
    }

    pub fn get_peer(&self, id: &str) -> Option<Arc<Peer>> {
        self.peers.get(id).map(|p| p.value().clone())
    }

    /// (outbound, inbound, dialing)
    pub fn num_peers(&self) -> (usize, usize, usize) {
        let outbound = self.peers.iter().filter(|p| p.outbound).count();
        (outbound, self.peers.len() - outbound, self.dialing.len())
    }

    /// Queues `msg` to every peer without waiting on any of them; returns
    /// how many accepted it. A peer whose queue is full is disconnected.
    pub async fn broadcast(&self, channel: u8, msg: Vec<u8>) -> usize {
        let mut sent = 0;
        let mut lagging = Vec::new();
        for peer in self.peers() {
            match peer.try_send(channel, msg.clone()) {
                SendStatus::Queued => sent += 1,
                SendStatus::Full => lagging.push(peer),
                SendStatus::Closed => {}
            }
        }
        for peer in lagging {
            self.stop_peer_for_error(&peer, "send queue full").await;
        }
        sent
    }

    pub async fn stop_peer_for_error(&self, peer: &Arc<Peer>, reason: &str) {
        warn!(peer = %peer.id(), reason, "stopping peer for error");
        self.remove_peer(peer, reason).await;
    }

    pub async fn stop_peer_gracefully(&self, peer: &Arc<Peer>) {
        info!(peer = %peer.id(), "stopping peer");
        self.remove_peer(peer, "stopped").await;
    }

    async fn remove_peer(&self, peer: &Arc<Peer>, reason: &str) {
        if self
            .peers
            .remove_if(&peer.id(), |_, p| Arc::ptr_eq(p, peer))
            .is_none()
        {
            return;
        }
        peer.stop();
        for (_, reactor) in self.reactor_list() {
            reactor.remove_peer(peer.clone(), reason).await;
        }
    }
}

async fn handshake(stream: &mut TcpStream, ours: &NodeInfo) -> Result<NodeInfo, SwitchError> {
    let payload = conn::encode(ours)?;
    let (mut reader, mut writer) = stream.split();
    let (sent, received) = tokio::join!(
        conn::send_frame(&mut writer, HANDSHAKE_CHANNEL, &payload),
        conn::receive_frame(&mut reader),
    );
    sent?;
    let (channel, bytes) = received?;
    if channel != HANDSHAKE_CHANNEL {
        return Err(SwitchError::Codec(format!(
            "expected handshake, got channel {channel:#04x}"
        )));
    }
    conn::decode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::reactor::ChannelDescriptor;
    use async_trait::async_trait;
    use chainlib::crypto::PrivateKey;
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Recorder {
        name: &'static str,
        channel: u8,
        log: Arc<Mutex<Vec<String>>>,
        accepting_seen: Mutex<Option<bool>>,
        switch: Mutex<Option<std::sync::Weak<Switch>>>,
        inbox: Mutex<Option<mpsc::UnboundedSender<(String, Vec<u8>)>>>,
    }

    #[async_trait]
    impl Reactor for Recorder {
        fn channels(&self) -> Vec<ChannelDescriptor> {
            vec![ChannelDescriptor {
                id: self.channel,
                name: self.name,
                priority: 1,
            }]
        }
        fn set_switch(&self, switch: std::sync::Weak<Switch>) {
            *self.switch.lock() = Some(switch);
        }
        async fn on_start(&self) -> Result<(), SwitchError> {
            self.log.lock().push(format!("{} begin", self.name));
            time::sleep(Duration::from_millis(20)).await;
            let accepting = self
                .switch
                .lock()
                .as_ref()
                .and_then(|w| w.upgrade())
                .map(|sw| sw.is_accepting());
            *self.accepting_seen.lock() = accepting;
            self.log.lock().push(format!("{} end", self.name));
            Ok(())
        }
        async fn add_peer(&self, peer: Arc<Peer>) {
            self.log.lock().push(format!("{} add {}", self.name, peer.outbound));
        }
        async fn remove_peer(&self, _peer: Arc<Peer>, _reason: &str) {}
        async fn receive(&self, _channel: u8, peer: Arc<Peer>, msg: Vec<u8>) {
            let inbox = self.inbox.lock().clone();
            if let Some(tx) = inbox {
                let _ = tx.send((peer.id(), msg));
            }
        }
    }

    fn info(network: &str) -> NodeInfo {
        NodeInfo {
            pub_key: PrivateKey::new_key().public_key(),
            moniker: "test".into(),
            network: network.into(),
            version: "0.1.0".into(),
            listen_addr: String::new(),
            other: vec![format!("p2p_version={}", crate::p2p::VERSION)],
        }
    }

    async fn listening_switch(network: &str) -> (Arc<Switch>, NetAddress) {
        let sw = Switch::new(P2pConfig::default());
        let listener = DefaultListener::new("tcp", "127.0.0.1:0", true).await.unwrap();
        let addr = listener.internal_address();
        sw.add_listener(listener);
        sw.set_node_info(info(network));
        (sw, addr)
    }

    #[tokio::test]
    async fn reactors_start_in_order_before_accepting() {
        let log = Arc::new(Mutex::new(vec![]));
        let a = Arc::new(Recorder {
            name: "A",
            channel: 0x10,
            log: log.clone(),
            ..Default::default()
        });
        let b = Arc::new(Recorder {
            name: "B",
            channel: 0x20,
            log: log.clone(),
            ..Default::default()
        });
        let (sw, _) = listening_switch("chain0").await;
        sw.add_reactor("A", a.clone()).unwrap();
        sw.add_reactor("B", b.clone()).unwrap();
        assert!(!sw.is_accepting());
        sw.start().await.unwrap();

        assert_eq!(*log.lock(), vec!["A begin", "A end", "B begin", "B end"]);
        assert_eq!(*a.accepting_seen.lock(), Some(false));
        assert_eq!(*b.accepting_seen.lock(), Some(false));
        assert!(sw.is_accepting());
        sw.stop().await.unwrap();
    }

    #[tokio::test]
    async fn registry_rules() {
        let sw = Switch::new(P2pConfig::default());
        let first = Arc::new(Recorder {
            name: "A",
            channel: 0x10,
            ..Default::default()
        });
        let same_channel = Arc::new(Recorder {
            name: "B",
            channel: 0x10,
            ..Default::default()
        });
        sw.add_reactor("A", first.clone()).unwrap();
        assert!(matches!(
            sw.add_reactor("A", first.clone()),
            Err(SwitchError::DuplicateReactor(_))
        ));
        assert!(matches!(
            sw.add_reactor("B", same_channel),
            Err(SwitchError::DuplicateChannel(0x10))
        ));
        sw.set_node_info(info("chain0"));
        sw.start().await.unwrap();
        let late = Arc::new(Recorder {
            name: "C",
            channel: 0x30,
            ..Default::default()
        });
        assert!(matches!(
            sw.add_reactor("C", late),
            Err(SwitchError::ReactorAfterStart)
        ));
        assert!(matches!(
            sw.start().await,
            Err(SwitchError::Service(ServiceError::AlreadyStarted(_)))
        ));
        assert_eq!(sw.reactor_names(), vec!["A"]);
    }

    #[tokio::test]
    async fn peers_connect_and_exchange_frames() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server_reactor = Arc::new(Recorder {
            name: "R",
            channel: 0x40,
            ..Default::default()
        });
        *server_reactor.inbox.lock() = Some(tx);
        let (server, server_addr) = listening_switch("chain0").await;
        server.add_reactor("R", server_reactor.clone()).unwrap();
        server.start().await.unwrap();

        let client = Switch::new(P2pConfig::default());
        client
            .add_reactor(
                "R",
                Arc::new(Recorder {
                    name: "R",
                    channel: 0x40,
                    ..Default::default()
                }),
            )
            .unwrap();
        client.set_node_info(info("chain0"));
        client.start().await.unwrap();

        let peer = client.dial_peer_with_address(server_addr).await.unwrap();
        assert!(peer.outbound);
        assert_eq!(client.num_peers(), (1, 0, 0));
        assert_eq!(client.broadcast(0x40, b"hello".to_vec()).await, 1);

        let (from, msg) = rx.recv().await.unwrap();
        assert_eq!(msg, b"hello");
        assert_eq!(Some(from), client.node_info().map(|i| i.id()));
        assert_eq!(server.num_peers(), (0, 1, 0));

        client.stop().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn handshake_finishing_after_stop_is_refused() {
        let log = Arc::new(Mutex::new(vec![]));
        let reactor = Arc::new(Recorder {
            name: "R",
            channel: 0x40,
            log: log.clone(),
            ..Default::default()
        });
        let (server, server_addr) = listening_switch("chain0").await;
        server.add_reactor("R", reactor).unwrap();
        server.start().await.unwrap();
        log.lock().clear();

        let mut stream = TcpStream::connect(server_addr.socket_addr()).await.unwrap();
        // the server speaks first, so its side of the handshake is running
        let (channel, _) = conn::receive_frame(&mut stream).await.unwrap();
        assert_eq!(channel, HANDSHAKE_CHANNEL);

        server.stop().await.unwrap();
        let ours = conn::encode(&info("chain0")).unwrap();
        let _ = conn::send_frame(&mut stream, HANDSHAKE_CHANNEL, &ours).await;

        let mut buf = [0u8; 1];
        let read = time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(server.peers().is_empty());
        assert!(log.lock().iter().all(|entry| !entry.contains("add")));
    }

    #[tokio::test]
    async fn stop_joins_peer_tasks() {
        let (server, server_addr) = listening_switch("chain0").await;
        server.start().await.unwrap();
        let client = Switch::new(P2pConfig::default());
        client.set_node_info(info("chain0"));
        client.start().await.unwrap();

        let peer = client.dial_peer_with_address(server_addr).await.unwrap();
        client.stop().await.unwrap();
        assert!(peer.is_stopped());
        assert!(peer.tasks_finished());
        assert!(client.peers().is_empty());
        assert!(matches!(
            client.add_peer_with_conn(
                TcpStream::connect(server_addr.socket_addr()).await.unwrap(),
                server_addr,
                true,
            )
            .await,
            Err(SwitchError::Service(ServiceError::NotRunning(_)))
        ));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn broadcast_drops_peers_that_fall_behind() {
        let (server, server_addr) = listening_switch("chain0").await;
        server
            .add_reactor(
                "R",
                Arc::new(Recorder {
                    name: "R",
                    channel: 0x40,
                    ..Default::default()
                }),
            )
            .unwrap();
        server.start().await.unwrap();

        // a raw client that handshakes and then never reads
        let mut stream = TcpStream::connect(server_addr.socket_addr()).await.unwrap();
        conn::receive_frame(&mut stream).await.unwrap();
        let theirs = conn::encode(&info("chain0")).unwrap();
        conn::send_frame(&mut stream, HANDSHAKE_CHANNEL, &theirs).await.unwrap();
        time::timeout(Duration::from_secs(5), async {
            while server.peers().is_empty() {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let big = vec![0u8; 64 * 1024];
        let dropped = time::timeout(Duration::from_secs(10), async {
            loop {
                server.broadcast(0x40, big.clone()).await;
                if server.peers().is_empty() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await;
        assert!(dropped.is_ok());
        drop(stream);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn rejects_peers_on_other_networks() {
        let (server, server_addr) = listening_switch("chain0").await;
        server.start().await.unwrap();
        let client = Switch::new(P2pConfig::default());
        client.set_node_info(info("chain1"));
        client.start().await.unwrap();
        assert!(matches!(
            client.dial_peer_with_address(server_addr).await,
            Err(SwitchError::Incompatible(_))
        ));
        assert_eq!(client.num_peers(), (0, 0, 0));
    }

    #[tokio::test]
    async fn malformed_seed_fails_dial_seeds() {
        let sw = Switch::new(P2pConfig::default());
        sw.set_node_info(info("chain0"));
        sw.start().await.unwrap();
        let seeds = vec!["127.0.0.1:1".to_string(), "nonsense".to_string()];
        assert!(matches!(
            sw.dial_seeds(None, &seeds),
            Err(SwitchError::InvalidAddress(_))
        ));
    }
}
