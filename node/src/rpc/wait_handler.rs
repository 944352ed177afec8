//! Request gate in front of the core HTTP server.
//!
//! The listener is bound before the handler that answers requests exists.
//! Every request parks on a watch channel until [`WaitHandler::set`]
//! installs the router, which can happen exactly once.

use crate::error::GateError;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::watch;
use tower::{Service, ServiceExt};

#[derive(Clone)]
pub struct WaitHandler {
    handler: Arc<watch::Sender<Option<Router>>>,
}

impl Default for WaitHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitHandler {
    pub fn new() -> Self {
        let (handler, _) = watch::channel(None);
        Self {
            handler: Arc::new(handler),
        }
    }

    /// Installs the handler and releases every parked request.
    pub fn set(&self, router: Router) -> Result<(), GateError> {
        let mut router = Some(router);
        let installed = self.handler.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = router.take();
            true
        });
        if installed {
            Ok(())
        } else {
            Err(GateError::AlreadySet)
        }
    }

    pub fn is_set(&self) -> bool {
        self.handler.borrow().is_some()
    }

    async fn ready(&self) -> Option<Router> {
        let mut rx = self.handler.subscribe();
        rx.wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|slot| slot.clone())
    }
}

impl Service<Request<Body>> for WaitHandler {
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let gate = self.clone();
        Box::pin(async move {
            match gate.ready().await {
                Some(router) => router.oneshot(req).await,
                None => Ok(StatusCode::SERVICE_UNAVAILABLE.into_response()),
            }
        })
    }
}
