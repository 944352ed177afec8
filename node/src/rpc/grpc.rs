//! gRPC broadcast API.

use crate::blockchain::BlockchainReactor;
use chainlib::types::Transaction;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::debug;

pub mod proto {
    tonic::include_proto!("core_grpc");
}

use proto::broadcast_api_server::BroadcastApi;
pub use proto::broadcast_api_server::BroadcastApiServer;
use proto::{RequestBroadcastTx, RequestPing, ResponseBroadcastTx, ResponsePing};

pub struct BroadcastService {
    reactor: Arc<BlockchainReactor>,
}

impl BroadcastService {
    pub fn new(reactor: Arc<BlockchainReactor>) -> Self {
        Self { reactor }
    }

    pub fn into_server(self) -> BroadcastApiServer<Self> {
        BroadcastApiServer::new(self)
    }
}

#[tonic::async_trait]
impl BroadcastApi for BroadcastService {
    async fn ping(&self, _request: Request<RequestPing>) -> Result<Response<ResponsePing>, Status> {
        Ok(Response::new(ResponsePing {}))
    }

    async fn broadcast_tx(
        &self,
        request: Request<RequestBroadcastTx>,
    ) -> Result<Response<ResponseBroadcastTx>, Status> {
        let raw = request.into_inner().tx;
        let tx: Transaction = ciborium::de::from_reader(raw.as_slice())
            .map_err(|e| Status::invalid_argument(format!("malformed tx: {e}")))?;
        let id = tx.id();
        let accepted = self.reactor.submit_transaction(tx).await;
        debug!(tx = %id, accepted, "grpc broadcast");
        let log = if accepted {
            String::new()
        } else {
            "transaction already in pool".to_string()
        };
        Ok(Response::new(ResponseBroadcastTx {
            accepted,
            tx_id: id.to_string(),
            log,
        }))
    }
}
