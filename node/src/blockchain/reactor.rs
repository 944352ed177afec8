//! Block and transaction propagation, plus the HTTP handler for chain and
//! wallet requests.

use super::request::{BuildRequest, WalletAliases};
use crate::error::SwitchError;
use crate::events::{Event, EventSwitch};
use crate::p2p::conn;
use crate::p2p::peer::Peer;
use crate::p2p::reactor::{ChannelDescriptor, Reactor};
use crate::p2p::switch::Switch;
use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::{get, post};
use axum::{Json, Router};
use chainlib::chain::Chain;
use chainlib::consensus;
use chainlib::crypto::PublicKey;
use chainlib::error::ChainError;
use chainlib::types::{Block, Transaction};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};
use wallet::account::{self, Manager};
use wallet::asset::Registry;
use wallet::pin::PinStore;
use wallet::pseudohsm::PseudoHsm;

pub const BLOCKCHAIN_CHANNEL: u8 = 0x40;
const SYNC_INTERVAL: Duration = Duration::from_secs(1);
const POOL_CLEAN_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum BlockchainMessage {
    StatusRequest,
    StatusResponse { height: u64 },
    BlockRequest { height: u64 },
    BlockResponse { block: Block },
    NoBlockResponse { height: u64 },
    Transaction { tx: Transaction },
}

/// Wallet subsystems; absent when wallet features are disabled.
#[derive(Clone)]
pub struct WalletContext {
    pub accounts: Arc<Manager>,
    pub assets: Arc<Registry>,
    pub pins: Arc<PinStore>,
}

pub struct BlockchainReactor {
    me: Weak<BlockchainReactor>,
    chain: Arc<Chain>,
    wallet: Option<WalletContext>,
    hsm: Arc<PseudoHsm>,
    evsw: Arc<EventSwitch>,
    fast_sync: bool,
    switch: OnceLock<Weak<Switch>>,
    peer_heights: DashMap<String, u64>,
    quit: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BlockchainReactor {
    pub fn new(
        chain: Arc<Chain>,
        wallet: Option<WalletContext>,
        hsm: Arc<PseudoHsm>,
        evsw: Arc<EventSwitch>,
        fast_sync: bool,
    ) -> Arc<Self> {
        let (quit, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            chain,
            wallet,
            hsm,
            evsw,
            fast_sync,
            switch: OnceLock::new(),
            peer_heights: DashMap::new(),
            quit,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    pub fn wallet(&self) -> Option<&WalletContext> {
        self.wallet.as_ref()
    }

    fn switch(&self) -> Option<Arc<Switch>> {
        self.switch.get().and_then(Weak::upgrade)
    }

    async fn broadcast(&self, msg: &BlockchainMessage) {
        let Some(sw) = self.switch() else {
            return;
        };
        match conn::encode(msg) {
            Ok(bytes) => {
                sw.broadcast(BLOCKCHAIN_CHANNEL, bytes).await;
            }
            Err(err) => warn!(%err, "failed to encode broadcast"),
        }
    }

    async fn send(&self, peer: &Peer, msg: &BlockchainMessage) -> bool {
        match conn::encode(msg) {
            Ok(bytes) => peer.send(BLOCKCHAIN_CHANNEL, bytes),
            Err(err) => {
                warn!(%err, "failed to encode message");
                false
            }
        }
    }

    /// Adds a transaction to the pool and relays it. Returns false if the
    /// pool already had it.
    pub async fn submit_transaction(&self, tx: Transaction) -> bool {
        let id = tx.id();
        if !self.chain.txpool().add(tx.clone()) {
            return false;
        }
        debug!(tx = %id, "transaction added to pool");
        self.evsw.fire_event(Event::Tx { id });
        self.broadcast(&BlockchainMessage::Transaction { tx }).await;
        true
    }

    /// Appends a block received from the network and announces the new
    /// height.
    pub async fn process_block(&self, block: Block) -> Result<(), ChainError> {
        self.chain.add_block(&block)?;
        let height = block.height();
        info!(height, hash = %block.hash(), "block committed");
        self.evsw.fire_event(Event::NewBlock {
            height,
            hash: block.hash(),
        });
        self.broadcast(&BlockchainMessage::StatusResponse { height })
            .await;
        Ok(())
    }

    fn best_peer(&self) -> Option<(String, u64)> {
        self.peer_heights
            .iter()
            .max_by_key(|entry| *entry.value())
            .map(|entry| (entry.key().clone(), *entry.value()))
    }

    async fn request_next_block(&self) {
        let Some((peer_id, height)) = self.best_peer() else {
            return;
        };
        let next = self.chain.height() + 1;
        if height < next {
            return;
        }
        let peer = self.switch().and_then(|sw| sw.get_peer(&peer_id));
        if let Some(peer) = peer {
            debug!(peer = %peer_id, height = next, "requesting block");
            self.send(&peer, &BlockchainMessage::BlockRequest { height: next })
                .await;
        }
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/dashboard/", get(dashboard))
            .route("/info", get(info).post(info))
            .route("/get-block", post(get_block))
            .route("/create-key", post(create_key))
            .route("/list-keys", get(list_keys).post(list_keys))
            .route("/create-account", post(create_account))
            .route("/list-accounts", get(list_accounts).post(list_accounts))
            .route("/create-asset", post(create_asset))
            .route("/list-assets", get(list_assets).post(list_assets))
            .route("/build-transaction", post(build_transaction))
            .route("/list-unspent-outputs", post(list_unspent_outputs))
            .route("/wallet-status", get(wallet_status).post(wallet_status))
            .with_state(self.clone())
    }
}

#[async_trait]
impl Reactor for BlockchainReactor {
    fn channels(&self) -> Vec<ChannelDescriptor> {
        vec![ChannelDescriptor {
            id: BLOCKCHAIN_CHANNEL,
            name: "BLOCKCHAIN",
            priority: 5,
        }]
    }

    fn set_switch(&self, switch: Weak<Switch>) {
        let _ = self.switch.set(switch);
    }

    async fn on_start(&self) -> Result<(), SwitchError> {
        let Some(me) = self.me.upgrade() else {
            return Ok(());
        };
        let mut tasks = Vec::new();

        let pool = self.chain.txpool().clone();
        let mut quit = self.quit.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut interval = time::interval(POOL_CLEAN_INTERVAL);
            loop {
                tokio::select! {
                    _ = quit.wait_for(|q| *q) => break,
                    _ = interval.tick() => {}
                }
                let removed = pool.clean(chainlib::MAX_TXPOOL_TRANSACTION_AGE);
                if removed > 0 {
                    debug!(removed, "cleaned the pool from old transactions");
                }
            }
        }));

        if self.fast_sync {
            let mut quit = self.quit.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut interval = time::interval(SYNC_INTERVAL);
                loop {
                    tokio::select! {
                        _ = quit.wait_for(|q| *q) => break,
                        _ = interval.tick() => {}
                    }
                    me.request_next_block().await;
                }
            }));
        }
        *self.tasks.lock() = tasks;
        Ok(())
    }

    async fn on_stop(&self) {
        self.quit.send_replace(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in tasks {
            let _ = handle.await;
        }
    }

    async fn add_peer(&self, peer: Arc<Peer>) {
        let height = self.chain.height();
        self.send(&peer, &BlockchainMessage::StatusResponse { height })
            .await;
    }

    async fn remove_peer(&self, peer: Arc<Peer>, _reason: &str) {
        self.peer_heights.remove(&peer.id());
    }

    async fn receive(&self, _channel: u8, peer: Arc<Peer>, msg: Vec<u8>) {
        let msg = match conn::decode::<BlockchainMessage>(&msg) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(peer = %peer.id(), %err, "bad blockchain message");
                if let Some(sw) = self.switch() {
                    sw.stop_peer_for_error(&peer, "bad blockchain message").await;
                }
                return;
            }
        };
        match msg {
            BlockchainMessage::StatusRequest => {
                let height = self.chain.height();
                self.send(&peer, &BlockchainMessage::StatusResponse { height })
                    .await;
            }
            BlockchainMessage::StatusResponse { height } => {
                self.peer_heights.insert(peer.id(), height);
            }
            BlockchainMessage::BlockRequest { height } => {
                let reply = match self.chain.get_block(height) {
                    Ok(Some(block)) => BlockchainMessage::BlockResponse { block },
                    _ => BlockchainMessage::NoBlockResponse { height },
                };
                self.send(&peer, &reply).await;
            }
            BlockchainMessage::BlockResponse { block } => {
                let height = block.height();
                match self.process_block(block).await {
                    Ok(()) => {
                        if self.fast_sync {
                            self.request_next_block().await;
                        }
                    }
                    Err(ChainError::InvalidHeight { .. }) => {
                        debug!(peer = %peer.id(), height, "ignoring block at unexpected height");
                    }
                    Err(err) => {
                        warn!(peer = %peer.id(), height, %err, "rejected block");
                        if let Some(sw) = self.switch() {
                            sw.stop_peer_for_error(&peer, "sent an invalid block").await;
                        }
                    }
                }
            }
            BlockchainMessage::NoBlockResponse { height } => {
                debug!(peer = %peer.id(), height, "peer does not have block");
            }
            BlockchainMessage::Transaction { tx } => {
                self.submit_transaction(tx).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

type ReactorState = State<Arc<BlockchainReactor>>;

#[derive(Serialize)]
struct ErrorResponse {
    status: &'static str,
    msg: String,
}

type HandlerResult = Result<Json<Value>, (StatusCode, Json<ErrorResponse>)>;

fn success(data: impl Serialize) -> HandlerResult {
    let data = serde_json::to_value(data).map_err(|e| fail(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(Json(json!({ "status": "success", "data": data })))
}

fn fail(code: StatusCode, err: impl ToString) -> (StatusCode, Json<ErrorResponse>) {
    (
        code,
        Json(ErrorResponse {
            status: "fail",
            msg: err.to_string(),
        }),
    )
}

fn bad_request(err: impl ToString) -> (StatusCode, Json<ErrorResponse>) {
    fail(StatusCode::BAD_REQUEST, err)
}

fn wallet_of(reactor: &BlockchainReactor) -> Result<&WalletContext, (StatusCode, Json<ErrorResponse>)> {
    reactor
        .wallet
        .as_ref()
        .ok_or_else(|| bad_request("wallet features are disabled"))
}

async fn dashboard(State(reactor): ReactorState) -> Html<String> {
    Html(format!(
        "<html><head><title>Dashboard</title></head><body>\
         <h1>{}</h1><p>height: {}</p><p>unconfirmed transactions: {}</p></body></html>",
        consensus::NETWORK,
        reactor.chain.height(),
        reactor.chain.txpool().count(),
    ))
}

async fn info(State(reactor): ReactorState) -> HandlerResult {
    let peers = reactor.switch().map_or(0, |sw| sw.peers().len());
    success(json!({
        "network": consensus::NETWORK,
        "height": reactor.chain.height(),
        "genesis_hash": reactor.chain.genesis_hash(),
        "peers": peers,
        "wallet_enabled": reactor.wallet.is_some(),
    }))
}

#[derive(Deserialize)]
struct HeightRequest {
    height: u64,
}

async fn get_block(State(reactor): ReactorState, Json(req): Json<HeightRequest>) -> HandlerResult {
    match reactor.chain.get_block(req.height) {
        Ok(Some(block)) => success(json!({ "hash": block.hash(), "block": block })),
        Ok(None) => Err(fail(StatusCode::NOT_FOUND, format!("no block at height {}", req.height))),
        Err(err) => Err(fail(StatusCode::INTERNAL_SERVER_ERROR, err)),
    }
}

#[derive(Deserialize)]
struct CreateKeyRequest {
    alias: Option<String>,
}

async fn create_key(State(reactor): ReactorState, Json(req): Json<CreateKeyRequest>) -> HandlerResult {
    let xpub = reactor.hsm.xcreate(req.alias).map_err(bad_request)?;
    success(xpub)
}

async fn list_keys(State(reactor): ReactorState) -> HandlerResult {
    success(reactor.hsm.list_keys())
}

#[derive(Deserialize)]
struct CreateRequest {
    root_xpubs: Vec<PublicKey>,
    quorum: usize,
    alias: Option<String>,
    #[serde(default)]
    definition: Map<String, Value>,
}

async fn create_account(State(reactor): ReactorState, Json(req): Json<CreateRequest>) -> HandlerResult {
    let wallet = wallet_of(&reactor)?;
    let account = wallet
        .accounts
        .create(req.root_xpubs, req.quorum, req.alias)
        .map_err(bad_request)?;
    success(account)
}

async fn list_accounts(State(reactor): ReactorState) -> HandlerResult {
    let wallet = wallet_of(&reactor)?;
    success(wallet.accounts.list().map_err(bad_request)?)
}

async fn create_asset(State(reactor): ReactorState, Json(req): Json<CreateRequest>) -> HandlerResult {
    let wallet = wallet_of(&reactor)?;
    let asset = wallet
        .assets
        .define(req.root_xpubs, req.quorum, req.definition, req.alias)
        .map_err(bad_request)?;
    success(asset)
}

async fn list_assets(State(reactor): ReactorState) -> HandlerResult {
    let wallet = wallet_of(&reactor)?;
    success(wallet.assets.list().map_err(bad_request)?)
}

async fn build_transaction(
    State(reactor): ReactorState,
    Json(req): Json<BuildRequest>,
) -> HandlerResult {
    let wallet = wallet_of(&reactor)?;
    let aliases = WalletAliases {
        accounts: wallet.accounts.clone(),
        assets: wallet.assets.clone(),
    };
    let resolved = req.filter_aliases(&aliases).map_err(bad_request)?;
    success(resolved)
}

#[derive(Deserialize, Default)]
struct UnspentRequest {
    account_id: Option<String>,
}

async fn list_unspent_outputs(
    State(reactor): ReactorState,
    Json(req): Json<UnspentRequest>,
) -> HandlerResult {
    let wallet = wallet_of(&reactor)?;
    let utxos = wallet
        .accounts
        .list_unspent_outputs(req.account_id.as_deref())
        .map_err(bad_request)?;
    success(utxos)
}

async fn wallet_status(State(reactor): ReactorState) -> HandlerResult {
    let wallet = wallet_of(&reactor)?;
    success(json!({
        "best_block_height": reactor.chain.height(),
        "account_pin": wallet.pins.height(account::PIN_NAME),
        "delete_spents_pin": wallet.pins.height(account::DELETE_SPENTS_PIN_NAME),
        "pins": wallet.pins.heights(),
    }))
}
