//! The node: wires storage, chain, wallet, p2p and RPC together and owns
//! their start/stop order.

use crate::blockchain::reactor::WalletContext;
use crate::blockchain::BlockchainReactor;
use crate::config::Config;
use crate::error::NodeError;
use crate::events::EventSwitch;
use crate::p2p::{self, AddrBook, DefaultListener, NodeInfo, PexReactor, Switch};
use crate::rpc::{self, DebugVars, HttpServer, RpcEnv, RpcListener, Routes, WaitHandler};
use crate::service::{BaseService, ServiceState};
use chainlib::chain::{Chain, TxPool};
use chainlib::consensus;
use chainlib::crypto::PrivateKey;
use chainlib::db::open_db;
use chainlib::store::Store;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use wallet::account::{self, Manager};
use wallet::asset::Registry;
use wallet::pin::PinStore;
use wallet::pseudohsm::PseudoHsm;

/// Version of the peer message encoding, advertised in `NodeInfo`.
pub const WIRE_VERSION: &str = "0.1.0";

/// Splits `proto://address`; a bare address means tcp.
pub fn protocol_and_address(listen_addr: &str) -> (&str, &str) {
    match listen_addr.split_once("://") {
        Some((protocol, address)) => (protocol, address),
        None => ("tcp", listen_addr),
    }
}

pub struct Node {
    service: BaseService,
    config: Arc<Config>,
    priv_key: PrivateKey,
    evsw: Arc<EventSwitch>,
    switch: Arc<Switch>,
    addr_book: Option<Arc<AddrBook>>,
    chain: Arc<Chain>,
    wallet: Option<WalletContext>,
    bc_reactor: Arc<BlockchainReactor>,
    core_server: HttpServer,
    prof_server: Option<HttpServer>,
    rpc_listeners: Mutex<Vec<RpcListener>>,
    indexers: Mutex<Vec<JoinHandle<()>>>,
    quit: watch::Sender<bool>,
}

// everything built after the core http server is up
struct Subsystems {
    switch: Arc<Switch>,
    addr_book: Option<Arc<AddrBook>>,
    chain: Arc<Chain>,
    wallet: Option<WalletContext>,
    bc_reactor: Arc<BlockchainReactor>,
    prof_server: Option<HttpServer>,
}

impl Node {
    /// Builds every subsystem without making the node reachable by peers.
    /// The core HTTP server is bound early and queues requests until the
    /// blockchain handler is installed. Any failure tears down what was
    /// already started and is returned to the caller.
    pub async fn new(config: Arc<Config>) -> Result<Arc<Node>, NodeError> {
        let evsw = Arc::new(EventSwitch::new());
        evsw.start().map_err(NodeError::EventSwitch)?;

        let gate = WaitHandler::new();
        let core_server = match rpc::rpc_init(gate.clone(), &config.base.api_addr).await {
            Ok(server) => server,
            Err(err) => {
                let _ = evsw.stop();
                return Err(err);
            }
        };

        let (quit, _) = watch::channel(false);
        let mut indexers = Vec::new();
        let parts = match Self::assemble(&config, &evsw, &gate, &quit, &mut indexers).await {
            Ok(parts) => parts,
            Err(err) => {
                error!(%err, "node initialization failed");
                quit.send_replace(true);
                for handle in indexers {
                    let _ = handle.await;
                }
                core_server.shutdown().await;
                let _ = evsw.stop();
                return Err(err);
            }
        };

        Ok(Arc::new(Node {
            service: BaseService::new("Node"),
            config,
            priv_key: PrivateKey::new_key(),
            evsw,
            switch: parts.switch,
            addr_book: parts.addr_book,
            chain: parts.chain,
            wallet: parts.wallet,
            bc_reactor: parts.bc_reactor,
            core_server,
            prof_server: parts.prof_server,
            rpc_listeners: Mutex::new(Vec::new()),
            indexers: Mutex::new(indexers),
            quit,
        }))
    }

    async fn assemble(
        config: &Config,
        evsw: &Arc<EventSwitch>,
        gate: &WaitHandler,
        quit: &watch::Sender<bool>,
        indexers: &mut Vec<JoinHandle<()>>,
    ) -> Result<Subsystems, NodeError> {
        let backend = config.base.db_backend;
        let db_dir = config.db_dir();
        let open = |name: &str| open_db(name, backend, &db_dir).map_err(NodeError::Storage);

        let store = Arc::new(Store::new(open("txdb")?));
        let genesis = consensus::init_block();
        let chain = Arc::new(
            Chain::new(genesis.hash(), store.clone(), Arc::new(TxPool::new()))
                .map_err(NodeError::Genesis)?,
        );
        // one process owns a store directory, so checking the height is enough
        if store.height() < 1 {
            chain.add_block(&genesis).map_err(NodeError::Genesis)?;
            info!(hash = %genesis.hash(), "genesis block added");
        }

        let wallet = if config.wallet.enable {
            let utxo_db = open("accountutxos")?;
            let pins = Arc::new(PinStore::new(utxo_db.clone()));
            pins.load_all().map_err(NodeError::PinStore)?;
            // start one block behind the tip so the tip is indexed again
            let pin_height = store.height().saturating_sub(1);
            for name in [account::PIN_NAME, account::DELETE_SPENTS_PIN_NAME] {
                pins.create_pin(name, pin_height)
                    .map_err(NodeError::PinStore)?;
            }
            let accounts = Arc::new(
                Manager::new(open("account")?, utxo_db, chain.clone(), pins.clone())
                    .map_err(NodeError::Wallet)?,
            );
            indexers.extend(accounts.process_blocks(quit.subscribe()));
            let assets =
                Arc::new(Registry::new(open("asset")?, genesis.hash()).map_err(NodeError::Wallet)?);
            Some(WalletContext {
                accounts,
                assets,
                pins,
            })
        } else {
            None
        };

        let hsm = Arc::new(PseudoHsm::new(&config.keys_dir()).map_err(NodeError::Hsm)?);
        let bc_reactor = BlockchainReactor::new(
            chain.clone(),
            wallet.clone(),
            hsm,
            evsw.clone(),
            config.base.fast_sync,
        );
        let switch = Switch::new(config.p2p.clone());
        switch.add_reactor("BLOCKCHAIN", bc_reactor.clone())?;
        gate.set(bc_reactor.router())?;

        let addr_book = if config.p2p.pex {
            let book = Arc::new(AddrBook::new(
                &config.addr_book_file(),
                config.p2p.addr_book_strict,
            ));
            switch.add_reactor("PEX", PexReactor::new(book.clone()))?;
            Some(book)
        } else {
            None
        };

        let prof_server = if config.base.prof_laddr.is_empty() {
            None
        } else {
            let vars = DebugVars {
                started: Instant::now(),
                chain: chain.clone(),
                switch: switch.clone(),
                pins: wallet.as_ref().map(|w| w.pins.clone()),
            };
            Some(rpc::start_prof_server(&config.base.prof_laddr, vars).await?)
        };

        Ok(Subsystems {
            switch,
            addr_book,
            chain,
            wallet,
            bc_reactor,
            prof_server,
        })
    }

    /// Opens the p2p listener, starts the switch (and with it every
    /// reactor), dials the seeds and starts the RPC listeners. On failure
    /// the node never reaches `Running` and everything is torn down.
    pub async fn start(self: &Arc<Self>) -> Result<(), NodeError> {
        self.service.begin_start()?;
        match self.on_start().await {
            Ok(()) => {
                self.service.finish_start(true);
                info!(node = %self.priv_key.public_key().to_hex(), "node started");
                Ok(())
            }
            Err(err) => {
                error!(%err, "node failed to start");
                self.teardown().await;
                self.service.finish_start(false);
                Err(err)
            }
        }
    }

    async fn on_start(self: &Arc<Self>) -> Result<(), NodeError> {
        let (protocol, address) = protocol_and_address(&self.config.p2p.laddr);
        let listener = DefaultListener::new(protocol, address, self.config.p2p.skip_upnp).await?;
        if let Some(book) = &self.addr_book {
            book.add_our_address(listener.external_address());
        }
        self.add_listener(listener);

        self.switch.set_node_info(self.make_node_info());
        if let Some(book) = &self.addr_book {
            book.start()?;
        }
        self.switch.start().await?;

        let seeds = self.config.seeds();
        if !seeds.is_empty() {
            if let Err(err) = self.dial_seeds(&seeds) {
                error!(%err, "failed to dial seeds");
            }
        }

        if !self.config.rpc_listen_addrs().is_empty() || !self.config.rpc.grpc_laddr.is_empty() {
            let listeners = self.start_rpc().await?;
            *self.rpc_listeners.lock() = listeners;
        }
        Ok(())
    }

    /// Stops the switch, closes the RPC listeners (close errors are only
    /// logged), lets the indexers finish their current block and stops the
    /// remaining services.
    pub async fn stop(&self) -> Result<(), NodeError> {
        self.service.begin_stop()?;
        info!("stopping node");
        self.teardown().await;
        self.service.finish_stop();
        Ok(())
    }

    async fn teardown(&self) {
        if self.switch.is_running() {
            if let Err(err) = self.switch.stop().await {
                warn!(%err, "error stopping switch");
            }
        }

        let listeners: Vec<_> = self.rpc_listeners.lock().drain(..).collect();
        for listener in &listeners {
            info!(addr = %listener.local_addr(), kind = %listener.kind(), "closing rpc listener");
            if let Err(err) = listener.close().await {
                error!(addr = %listener.local_addr(), %err, "error closing listener");
            }
        }

        self.quit.send_replace(true);
        let indexers: Vec<_> = self.indexers.lock().drain(..).collect();
        for handle in indexers {
            if let Err(err) = handle.await {
                warn!(%err, "indexer task failed");
            }
        }

        self.core_server.shutdown().await;
        if let Some(prof) = &self.prof_server {
            prof.shutdown().await;
        }
        if let Some(book) = &self.addr_book {
            // only started books need saving
            let _ = book.stop().await;
        }
        if let Err(err) = self.evsw.stop() {
            warn!(%err, "error stopping event switch");
        }
    }

    /// Waits for SIGINT or SIGTERM, then stops the node.
    pub async fn run_forever(&self) -> Result<(), NodeError> {
        wait_for_signal().await;
        info!("signal received, shutting down");
        self.stop().await
    }

    /// Listeners must be added before start; the first one is advertised.
    pub fn add_listener(&self, listener: DefaultListener) {
        self.switch.add_listener(listener);
    }

    pub fn make_node_info(&self) -> NodeInfo {
        let mut info = NodeInfo {
            pub_key: self.priv_key.public_key(),
            moniker: self.config.base.moniker.clone(),
            network: consensus::NETWORK.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            listen_addr: String::new(),
            other: vec![
                format!("wire_version={WIRE_VERSION}"),
                format!("p2p_version={}", p2p::VERSION),
            ],
        };
        let Some(listener) = self.switch.listeners().first().cloned() else {
            return info;
        };
        // the rpc listener is assumed to share the p2p external address
        info.listen_addr = listener.external_address().to_string();
        info.other.push(format!("rpc_addr={}", self.config.rpc.laddr));
        info
    }

    pub fn node_info(&self) -> Option<NodeInfo> {
        self.switch.node_info()
    }

    pub fn dial_seeds(&self, seeds: &[String]) -> Result<(), NodeError> {
        self.switch.dial_seeds(self.addr_book.as_ref(), seeds)?;
        Ok(())
    }

    pub fn configure_rpc(&self) -> Arc<RpcEnv> {
        Arc::new(RpcEnv {
            evsw: self.evsw.clone(),
            chain: self.chain.clone(),
            switch: self.switch.clone(),
            addr_book: self.addr_book.clone(),
            bc_reactor: self.bc_reactor.clone(),
        })
    }

    /// Binds every configured RPC address; either all of them serve or
    /// none do.
    pub async fn start_rpc(&self) -> Result<Vec<RpcListener>, NodeError> {
        let env = self.configure_rpc();
        let mut routes = Routes::new();
        if self.config.rpc.unsafe_routes {
            routes.add_unsafe_routes();
        }
        let listeners = rpc::start_rpc(
            env,
            Arc::new(routes),
            &self.config.rpc_listen_addrs(),
            &self.config.rpc.grpc_laddr,
        )
        .await?;
        Ok(listeners)
    }

    pub fn state(&self) -> ServiceState {
        self.service.state()
    }

    pub fn is_running(&self) -> bool {
        self.service.is_running()
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn switch(&self) -> &Arc<Switch> {
        &self.switch
    }

    pub fn event_switch(&self) -> &Arc<EventSwitch> {
        &self.evsw
    }

    pub fn addr_book(&self) -> Option<&Arc<AddrBook>> {
        self.addr_book.as_ref()
    }

    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    pub fn store(&self) -> &Arc<Store> {
        self.chain.store()
    }

    pub fn pin_store(&self) -> Option<&Arc<PinStore>> {
        self.wallet.as_ref().map(|w| &w.pins)
    }

    pub fn blockchain_reactor(&self) -> &Arc<BlockchainReactor> {
        &self.bc_reactor
    }

    pub fn core_addr(&self) -> SocketAddr {
        self.core_server.local_addr()
    }

    pub fn rpc_addrs(&self) -> Vec<SocketAddr> {
        self.rpc_listeners
            .lock()
            .iter()
            .map(RpcListener::local_addr)
            .collect()
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!(%err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
