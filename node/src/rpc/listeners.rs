//! RPC listener fan-out: one HTTP+websocket server per configured address
//! plus an optional gRPC server.

use super::core::{RpcEnv, Routes, http_router};
use super::grpc::BroadcastService;
use crate::error::RpcError;
use crate::node::protocol_and_address;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_stream::wrappers::TcpListenerStream;
use tracing::{info, warn};

const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Http,
    Grpc,
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerKind::Http => write!(f, "http"),
            ListenerKind::Grpc => write!(f, "grpc"),
        }
    }
}

pub struct RpcListener {
    kind: ListenerKind,
    addr: SocketAddr,
    quit: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<Result<(), String>>>>,
}

impl RpcListener {
    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops the server and reports how it exited.
    pub async fn close(&self) -> Result<(), RpcError> {
        self.quit.send_replace(true);
        let handle = self.handle.lock().take();
        let Some(mut handle) = handle else {
            return Ok(());
        };
        let outcome = match time::timeout(CLOSE_GRACE, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(join.to_string()),
            Err(_) => {
                warn!(kind = %self.kind, addr = %self.addr, "rpc listener slow to close, aborting");
                handle.abort();
                Ok(())
            }
        };
        info!(kind = %self.kind, addr = %self.addr, "rpc listener closed");
        outcome.map_err(|err| RpcError::Serve(format!("{}: {err}", self.addr)))
    }
}

async fn bind(kind: ListenerKind, laddr: &str) -> Result<(ListenerKind, SocketAddr, TcpListener), RpcError> {
    let (_, address) = protocol_and_address(laddr);
    let bind_err = |source| RpcError::Bind {
        addr: laddr.to_string(),
        source,
    };
    let listener = TcpListener::bind(address).await.map_err(bind_err)?;
    let addr = listener.local_addr().map_err(bind_err)?;
    Ok((kind, addr, listener))
}

/// Binds every HTTP address and the gRPC address before serving anything.
/// If any bind fails, the sockets bound so far are dropped and the error is
/// returned, so no subset of listeners is left running.
pub async fn start_rpc(
    env: Arc<RpcEnv>,
    routes: Arc<Routes>,
    laddrs: &[String],
    grpc_laddr: &str,
) -> Result<Vec<RpcListener>, RpcError> {
    let mut bound = Vec::with_capacity(laddrs.len() + 1);
    for laddr in laddrs {
        bound.push(bind(ListenerKind::Http, laddr).await?);
    }
    if !grpc_laddr.is_empty() {
        bound.push(bind(ListenerKind::Grpc, grpc_laddr).await?);
    }

    let listeners = bound
        .into_iter()
        .map(|(kind, addr, listener)| {
            let (quit, mut rx) = watch::channel(false);
            let shutdown = async move {
                let _ = rx.wait_for(|q| *q).await;
            };
            let handle = match kind {
                ListenerKind::Http => {
                    let router = http_router(env.clone(), routes.clone());
                    tokio::spawn(async move {
                        axum::serve(listener, router.into_make_service())
                            .with_graceful_shutdown(shutdown)
                            .await
                            .map_err(|e| e.to_string())
                    })
                }
                ListenerKind::Grpc => {
                    let service = BroadcastService::new(env.bc_reactor.clone()).into_server();
                    tokio::spawn(async move {
                        tonic::transport::Server::builder()
                            .add_service(service)
                            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
                            .await
                            .map_err(|e| e.to_string())
                    })
                }
            };
            info!(%kind, %addr, "rpc listener started");
            RpcListener {
                kind,
                addr,
                quit,
                handle: Mutex::new(Some(handle)),
            }
        })
        .collect();
    Ok(listeners)
}
