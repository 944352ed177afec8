//! The core HTTP server (dashboard and wallet routes behind the request
//! gate) and the optional diagnostics server.

use super::wait_handler::WaitHandler;
use crate::error::NodeError;
use crate::node::protocol_and_address;
use crate::p2p::Switch;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::{Json, Router};
use chainlib::chain::Chain;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use wallet::pin::PinStore;

const READ_TIMEOUT: Duration = Duration::from_secs(120);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A running axum server with its own shutdown signal.
pub struct HttpServer {
    name: &'static str,
    addr: SocketAddr,
    quit: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HttpServer {
    pub(crate) fn spawn(name: &'static str, listener: TcpListener, router: Router) -> std::io::Result<Self> {
        let addr = listener.local_addr()?;
        let (quit, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let shutdown = async move {
                let _ = rx.wait_for(|q| *q).await;
            };
            if let Err(err) = axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(server = name, %err, "http server failed");
            }
        });
        Ok(Self {
            name,
            addr,
            quit,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops accepting, then gives open connections a short grace period
    /// before aborting them.
    pub async fn shutdown(&self) {
        self.quit.send_replace(true);
        let handle = self.handle.lock().take();
        if let Some(mut handle) = handle {
            if time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                warn!(server = self.name, "connections still open, aborting");
                handle.abort();
            }
        }
        info!(server = self.name, addr = %self.addr, "http server stopped");
    }
}

async fn redirect_to_dashboard() -> impl IntoResponse {
    (StatusCode::FOUND, [(header::LOCATION, "/dashboard/")])
}

/// Root redirect plus the gate, wrapped in request ids, secure headers, a
/// request timeout and tracing.
pub fn core_router(gate: WaitHandler) -> Router {
    Router::new()
        .route("/", any(redirect_to_dashboard))
        .fallback_service(gate)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(SetResponseHeaderLayer::overriding(
                    header::X_CONTENT_TYPE_OPTIONS,
                    HeaderValue::from_static("nosniff"),
                ))
                .layer(SetResponseHeaderLayer::overriding(
                    header::X_FRAME_OPTIONS,
                    HeaderValue::from_static("DENY"),
                ))
                .layer(SetResponseHeaderLayer::overriding(
                    header::X_XSS_PROTECTION,
                    HeaderValue::from_static("1; mode=block"),
                ))
                .layer(TimeoutLayer::new(READ_TIMEOUT)),
        )
}

/// Binds the core HTTP listener and starts serving through `gate`.
/// Requests are accepted right away and wait until the gate is set.
pub async fn rpc_init(gate: WaitHandler, laddr: &str) -> Result<HttpServer, NodeError> {
    let (_, address) = protocol_and_address(laddr);
    let listener = TcpListener::bind(address)
        .await
        .map_err(|source| NodeError::Listen {
            addr: laddr.to_string(),
            source,
        })?;
    let server = HttpServer::spawn("core", listener, core_router(gate)).map_err(|source| {
        NodeError::Listen {
            addr: laddr.to_string(),
            source,
        }
    })?;
    info!(addr = %server.local_addr(), "core http server listening");
    Ok(server)
}

/// Values reported at `/debug/vars`.
#[derive(Clone)]
pub struct DebugVars {
    pub started: Instant,
    pub chain: Arc<Chain>,
    pub switch: Arc<Switch>,
    pub pins: Option<Arc<PinStore>>,
}

async fn debug_vars(State(vars): State<DebugVars>) -> Json<Value> {
    let (outbound, inbound, dialing) = vars.switch.num_peers();
    let pins = vars.pins.as_ref().map(|pins| {
        pins.heights()
            .into_iter()
            .map(|(name, height)| (name, json!(height)))
            .collect::<serde_json::Map<_, _>>()
    });
    let runtime = tokio::runtime::Handle::current().metrics();
    Json(json!({
        "uptime_secs": vars.started.elapsed().as_secs(),
        "runtime_workers": runtime.num_workers(),
        "height": vars.chain.height(),
        "txpool_size": vars.chain.txpool().count(),
        "peers": { "outbound": outbound, "inbound": inbound, "dialing": dialing },
        "pins": pins,
    }))
}

pub async fn start_prof_server(laddr: &str, vars: DebugVars) -> Result<HttpServer, NodeError> {
    let (_, address) = protocol_and_address(laddr);
    let listen_err = |source| NodeError::Listen {
        addr: laddr.to_string(),
        source,
    };
    let listener = TcpListener::bind(address).await.map_err(listen_err)?;
    let router = Router::new()
        .route("/debug/vars", get(debug_vars))
        .with_state(vars);
    let server = HttpServer::spawn("prof", listener, router).map_err(listen_err)?;
    info!(addr = %server.local_addr(), "profiling server listening");
    Ok(server)
}
