//! JSON-RPC route table served on every RPC listen address.

use super::websocket;
use crate::blockchain::BlockchainReactor;
use crate::events::EventSwitch;
use crate::p2p::{AddrBook, Switch};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chainlib::chain::Chain;
use chainlib::types::Transaction;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

const MAX_BLOCKCHAIN_RANGE: u64 = 20;

const SAFE_ROUTES: &[&str] = &[
    "status",
    "net_info",
    "genesis",
    "block",
    "blockchain",
    "num_unconfirmed_txs",
    "broadcast_tx",
];
const UNSAFE_ROUTES: &[&str] = &["dial_seeds", "unsafe_flush_mempool"];

/// Handles the RPC methods reach into.
pub struct RpcEnv {
    pub evsw: Arc<EventSwitch>,
    pub chain: Arc<Chain>,
    pub switch: Arc<Switch>,
    pub addr_book: Option<Arc<AddrBook>>,
    pub bc_reactor: Arc<BlockchainReactor>,
}

#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("{message} ({code})")]
pub struct RpcCallError {
    pub code: i32,
    pub message: String,
}

impl RpcCallError {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self {
            code: -32700,
            message: msg.into(),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("method not found: {method}"),
        }
    }

    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            code: -32603,
            message: msg.into(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Serialize, Debug, Clone)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcCallError>,
}

impl RpcResponse {
    pub fn new(id: Value, outcome: Result<Value, RpcCallError>) -> Self {
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(err) => (None, Some(err)),
        };
        Self {
            jsonrpc: "2.0",
            id,
            result,
            error,
        }
    }
}

pub struct Routes {
    unsafe_routes: bool,
}

impl Routes {
    pub fn new() -> Self {
        Self {
            unsafe_routes: false,
        }
    }

    pub fn add_unsafe_routes(&mut self) {
        self.unsafe_routes = true;
    }

    pub fn contains(&self, method: &str) -> bool {
        SAFE_ROUTES.contains(&method) || (self.unsafe_routes && UNSAFE_ROUTES.contains(&method))
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names = SAFE_ROUTES.to_vec();
        if self.unsafe_routes {
            names.extend_from_slice(UNSAFE_ROUTES);
        }
        names
    }

    pub async fn call(&self, env: &RpcEnv, method: &str, params: &Value) -> Result<Value, RpcCallError> {
        if !self.contains(method) {
            return Err(RpcCallError::method_not_found(method));
        }
        debug!(method, "rpc call");
        match method {
            "status" => Ok(status(env)),
            "net_info" => Ok(net_info(env)),
            "genesis" => block_at(env, 1),
            "block" => block_at(env, param_u64(params, "height")?),
            "blockchain" => blockchain(env, params),
            "num_unconfirmed_txs" => Ok(json!({ "n_txs": env.chain.txpool().count() })),
            "broadcast_tx" => broadcast_tx(env, params).await,
            "dial_seeds" => dial_seeds(env, params),
            "unsafe_flush_mempool" => {
                env.chain.txpool().flush();
                Ok(json!({}))
            }
            _ => Err(RpcCallError::method_not_found(method)),
        }
    }
}

impl Default for Routes {
    fn default() -> Self {
        Self::new()
    }
}

// accepts numbers and numeric strings, the latter coming from URI calls
fn param_u64(params: &Value, key: &str) -> Result<u64, RpcCallError> {
    match params.get(key) {
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| RpcCallError::invalid_params(format!("{key} must be unsigned"))),
        Some(Value::String(s)) => s
            .trim_matches('"')
            .parse()
            .map_err(|_| RpcCallError::invalid_params(format!("{key} must be a number"))),
        _ => Err(RpcCallError::invalid_params(format!("missing {key}"))),
    }
}

fn status(env: &RpcEnv) -> Value {
    let height = env.chain.height();
    let latest = env.chain.store().latest_block().ok().flatten();
    json!({
        "node_info": env.switch.node_info(),
        "latest_block_height": height,
        "latest_block_hash": latest.as_ref().map(|b| b.hash()),
        "latest_block_time": latest.as_ref().map(|b| b.header.timestamp),
    })
}

fn net_info(env: &RpcEnv) -> Value {
    let listeners: Vec<String> = env
        .switch
        .listeners()
        .iter()
        .map(|l| l.external_address().to_string())
        .collect();
    let peers: Vec<Value> = env
        .switch
        .peers()
        .iter()
        .map(|p| json!({ "node_info": p.node_info, "is_outbound": p.outbound }))
        .collect();
    json!({
        "listening": env.switch.is_listening(),
        "listeners": listeners,
        "peers": peers,
    })
}

fn block_at(env: &RpcEnv, height: u64) -> Result<Value, RpcCallError> {
    match env.chain.get_block(height) {
        Ok(Some(block)) => Ok(json!({ "block": block })),
        Ok(None) => Err(RpcCallError::invalid_params(format!(
            "height {height} must be less than or equal to the current height {}",
            env.chain.height()
        ))),
        Err(err) => Err(RpcCallError::internal(err.to_string())),
    }
}

fn blockchain(env: &RpcEnv, params: &Value) -> Result<Value, RpcCallError> {
    let tip = env.chain.height();
    let max = match params.get("max_height") {
        Some(_) => param_u64(params, "max_height")?.min(tip),
        None => tip,
    };
    let min = match params.get("min_height") {
        Some(_) => param_u64(params, "min_height")?.max(1),
        None => 1,
    }
    .max(max.saturating_sub(MAX_BLOCKCHAIN_RANGE - 1));
    if min > max && tip > 0 {
        return Err(RpcCallError::invalid_params(format!(
            "min height {min} can't be greater than max height {max}"
        )));
    }
    let mut metas = Vec::new();
    for height in (min..=max).rev() {
        match env.chain.get_block(height) {
            Ok(Some(block)) => metas.push(json!({
                "height": height,
                "hash": block.hash(),
                "header": block.header,
                "num_txs": block.transactions.len(),
            })),
            Ok(None) => break,
            Err(err) => return Err(RpcCallError::internal(err.to_string())),
        }
    }
    Ok(json!({ "last_height": tip, "block_metas": metas }))
}

// `tx` is the CBOR encoding of the transaction, hex encoded
async fn broadcast_tx(env: &RpcEnv, params: &Value) -> Result<Value, RpcCallError> {
    let raw = params
        .get("tx")
        .and_then(Value::as_str)
        .ok_or_else(|| RpcCallError::invalid_params("missing tx"))?;
    let bytes = hex::decode(raw.trim_matches('"'))
        .map_err(|e| RpcCallError::invalid_params(format!("tx is not hex: {e}")))?;
    let tx: Transaction = ciborium::de::from_reader(bytes.as_slice())
        .map_err(|e| RpcCallError::invalid_params(format!("malformed tx: {e}")))?;
    let id = tx.id();
    let accepted = env.bc_reactor.submit_transaction(tx).await;
    Ok(json!({ "tx_id": id, "accepted": accepted }))
}

fn dial_seeds(env: &RpcEnv, params: &Value) -> Result<Value, RpcCallError> {
    let seeds: Vec<String> = match params.get("seeds") {
        Some(Value::Array(list)) => list
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        Some(Value::String(list)) => list
            .trim_matches('"')
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        _ => return Err(RpcCallError::invalid_params("missing seeds")),
    };
    env.switch
        .dial_seeds(env.addr_book.as_ref(), &seeds)
        .map_err(|e| RpcCallError::internal(e.to_string()))?;
    Ok(json!({ "log": "dialing seeds in progress" }))
}

#[derive(Clone)]
pub(crate) struct RpcState {
    pub env: Arc<RpcEnv>,
    pub routes: Arc<Routes>,
}

async fn json_rpc(State(state): State<RpcState>, body: Bytes) -> Json<RpcResponse> {
    let request: RpcRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(err) => {
            return Json(RpcResponse::new(
                Value::Null,
                Err(RpcCallError::parse(err.to_string())),
            ));
        }
    };
    let outcome = state
        .routes
        .call(&state.env, &request.method, &request.params)
        .await;
    Json(RpcResponse::new(request.id, outcome))
}

async fn uri_call(
    State(state): State<RpcState>,
    Path(method): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<RpcResponse> {
    let params = Value::Object(
        query
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect(),
    );
    let outcome = state.routes.call(&state.env, &method, &params).await;
    Json(RpcResponse::new(Value::String(String::new()), outcome))
}

/// JSON-RPC over `POST /`, URI calls over `GET /<method>`, and the
/// websocket endpoint.
pub fn http_router(env: Arc<RpcEnv>, routes: Arc<Routes>) -> Router {
    Router::new()
        .route("/", post(json_rpc))
        .route("/websocket", get(websocket::upgrade))
        .route("/:method", get(uri_call))
        .with_state(RpcState { env, routes })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::blockchain::BlockchainReactor;
    use crate::config::P2pConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chainlib::chain::TxPool;
    use chainlib::consensus;
    use chainlib::db::MemDb;
    use chainlib::store::Store;
    use std::sync::Arc;
    use tower::ServiceExt;
    use wallet::pseudohsm::PseudoHsm;

    pub(crate) fn test_env(dir: &std::path::Path) -> Arc<RpcEnv> {
        let genesis = consensus::init_block();
        let store = Arc::new(Store::new(Arc::new(MemDb::new())));
        let chain =
            Arc::new(Chain::new(genesis.hash(), store, Arc::new(TxPool::new())).unwrap());
        chain.add_block(&genesis).unwrap();
        let evsw = Arc::new(EventSwitch::new());
        evsw.start().unwrap();
        let hsm = Arc::new(PseudoHsm::new(dir).unwrap());
        let bc_reactor = BlockchainReactor::new(chain.clone(), None, hsm, evsw.clone(), false);
        Arc::new(RpcEnv {
            evsw,
            chain,
            switch: Switch::new(P2pConfig::default()),
            addr_book: None,
            bc_reactor,
        })
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn unsafe_routes_only_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let env = test_env(dir.path());
        let routes = Routes::new();
        assert!(!routes.contains("unsafe_flush_mempool"));
        let err = routes
            .call(&env, "unsafe_flush_mempool", &Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code, -32601);

        let mut routes = Routes::new();
        routes.add_unsafe_routes();
        assert!(routes.names().contains(&"dial_seeds"));
        routes
            .call(&env, "unsafe_flush_mempool", &Value::Null)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn genesis_and_block_by_height() {
        let dir = tempfile::tempdir().unwrap();
        let env = test_env(dir.path());
        let routes = Routes::new();
        let genesis = routes.call(&env, "genesis", &Value::Null).await.unwrap();
        assert_eq!(genesis["block"]["header"]["height"], 1);

        let err = routes
            .call(&env, "block", &json!({ "height": 7 }))
            .await
            .unwrap_err();
        assert_eq!(err.code, -32602);
        let err = routes
            .call(&env, "block", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code, -32602);
    }

    #[tokio::test]
    async fn blockchain_range_is_clamped_to_tip() {
        let dir = tempfile::tempdir().unwrap();
        let env = test_env(dir.path());
        let mut prev = env.chain.get_block(1).unwrap().unwrap();
        for _ in 0..30 {
            let next = chainlib::types::Block::next(&prev, vec![], chrono::Utc::now());
            env.chain.add_block(&next).unwrap();
            prev = next;
        }
        let routes = Routes::new();
        let out = routes
            .call(&env, "blockchain", &json!({ "min_height": 1, "max_height": 100 }))
            .await
            .unwrap();
        assert_eq!(out["last_height"], 31);
        let metas = out["block_metas"].as_array().unwrap();
        assert_eq!(metas.len(), MAX_BLOCKCHAIN_RANGE as usize);
        assert_eq!(metas[0]["height"], 31);
    }

    #[tokio::test]
    async fn broadcast_tx_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let env = test_env(dir.path());
        let err = Routes::new()
            .call(&env, "broadcast_tx", &json!({ "tx": "zz" }))
            .await
            .unwrap_err();
        assert_eq!(err.code, -32602);
    }

    #[tokio::test]
    async fn json_rpc_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let router = http_router(test_env(dir.path()), Arc::new(Routes::new()));

        let resp = router
            .clone()
            .oneshot(
                Request::post("/")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"jsonrpc":"2.0","id":"1","method":"num_unconfirmed_txs"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["id"], "1");
        assert_eq!(body["result"]["n_txs"], 0);

        let resp = router
            .clone()
            .oneshot(Request::post("/").body(Body::from("{not json")).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["error"]["code"], -32700);

        let resp = router
            .oneshot(
                Request::get("/block?height=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["result"]["block"]["header"]["height"], 1);
    }
}
