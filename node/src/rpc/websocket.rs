//! Streaming JSON-RPC over a websocket. Besides the regular routes a client
//! can `subscribe` / `unsubscribe` to event switch events; each event is
//! pushed as a response whose id is `<subscribe id>#event`.

use super::core::{RpcCallError, RpcRequest, RpcResponse, RpcState};
use crate::events::{self, EventSwitch};
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

pub(crate) async fn upgrade(State(state): State<RpcState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve(socket, state))
}

struct Subscriptions {
    listener: String,
    evsw: Arc<EventSwitch>,
    out: mpsc::UnboundedSender<String>,
    forwarders: HashMap<&'static str, JoinHandle<()>>,
}

impl Subscriptions {
    fn event_param(params: &Value) -> Result<&'static str, RpcCallError> {
        let name = params
            .get("event")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcCallError::invalid_params("missing event"))?;
        events::lookup_event(name)
            .ok_or_else(|| RpcCallError::invalid_params(format!("unknown event {name}")))
    }

    fn subscribe(&mut self, id: &Value, params: &Value) -> Result<Value, RpcCallError> {
        let event = Self::event_param(params)?;
        if self.forwarders.contains_key(event) {
            return Err(RpcCallError::invalid_params(format!(
                "already subscribed to {event}"
            )));
        }
        let mut rx = self.evsw.add_listener_for_event(&self.listener, event);
        let out = self.out.clone();
        let event_id = match id {
            Value::String(s) => Value::String(format!("{s}#event")),
            other => Value::String(format!("{other}#event")),
        };
        let forwarder = tokio::spawn(async move {
            while let Some(fired) = rx.recv().await {
                let msg = RpcResponse::new(
                    event_id.clone(),
                    Ok(json!({ "name": event, "data": fired })),
                );
                let Ok(text) = serde_json::to_string(&msg) else {
                    continue;
                };
                if out.send(text).is_err() {
                    break;
                }
            }
        });
        self.forwarders.insert(event, forwarder);
        debug!(listener = %self.listener, event, "subscribed");
        Ok(json!({}))
    }

    fn unsubscribe(&mut self, params: &Value) -> Result<Value, RpcCallError> {
        let event = Self::event_param(params)?;
        self.evsw.remove_listener_for_event(&self.listener, event);
        match self.forwarders.remove(event) {
            Some(forwarder) => {
                forwarder.abort();
                Ok(json!({}))
            }
            None => Err(RpcCallError::invalid_params(format!(
                "not subscribed to {event}"
            ))),
        }
    }

    fn close(self) {
        self.evsw.remove_listener(&self.listener);
        for (_, forwarder) in self.forwarders {
            forwarder.abort();
        }
    }
}

async fn serve(socket: WebSocket, state: RpcState) {
    let (mut sink, mut stream) = socket.split();
    let (out, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut subs = Subscriptions {
        listener: format!("ws-{}", Uuid::new_v4()),
        evsw: state.env.evsw.clone(),
        out: out.clone(),
        forwarders: HashMap::new(),
    };
    debug!(listener = %subs.listener, "websocket connected");

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(listener = %subs.listener, %err, "websocket read failed");
                break;
            }
        };
        let response = match serde_json::from_str::<RpcRequest>(&text) {
            Err(err) => RpcResponse::new(Value::Null, Err(RpcCallError::parse(err.to_string()))),
            Ok(req) => {
                let outcome = match req.method.as_str() {
                    "subscribe" => subs.subscribe(&req.id, &req.params),
                    "unsubscribe" => subs.unsubscribe(&req.params),
                    method => state.routes.call(&state.env, method, &req.params).await,
                };
                RpcResponse::new(req.id, outcome)
            }
        };
        match serde_json::to_string(&response) {
            Ok(text) => {
                if out.send(text).is_err() {
                    break;
                }
            }
            Err(err) => warn!(%err, "failed to encode websocket response"),
        }
    }

    debug!(listener = %subs.listener, "websocket closed");
    subs.close();
    drop(out);
    let _ = writer.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EVENT_NEW_BLOCK, Event};
    use chainlib::sha256::Hash;

    fn subscriptions() -> (Subscriptions, mpsc::UnboundedReceiver<String>) {
        let evsw = Arc::new(EventSwitch::new());
        evsw.start().unwrap();
        let (out, rx) = mpsc::unbounded_channel();
        let subs = Subscriptions {
            listener: "ws-test".to_string(),
            evsw,
            out,
            forwarders: HashMap::new(),
        };
        (subs, rx)
    }

    #[tokio::test]
    async fn subscribed_events_are_pushed() {
        let (mut subs, mut rx) = subscriptions();
        subs.subscribe(&json!("7"), &json!({ "event": "NewBlock" }))
            .unwrap();
        assert_eq!(subs.evsw.num_listeners(EVENT_NEW_BLOCK), 1);

        subs.evsw.fire_event(Event::NewBlock {
            height: 3,
            hash: Hash::zero(),
        });
        let pushed: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(pushed["id"], "7#event");
        assert_eq!(pushed["result"]["name"], "NewBlock");
        assert_eq!(pushed["result"]["data"]["data"]["height"], 3);
    }

    #[tokio::test]
    async fn subscription_rules() {
        let (mut subs, _rx) = subscriptions();
        let err = subs
            .subscribe(&json!(1), &json!({ "event": "Nope" }))
            .unwrap_err();
        assert_eq!(err.code, -32602);

        subs.subscribe(&json!(1), &json!({ "event": "Tx" })).unwrap();
        assert!(subs.subscribe(&json!(2), &json!({ "event": "Tx" })).is_err());
        subs.unsubscribe(&json!({ "event": "Tx" })).unwrap();
        assert!(subs.unsubscribe(&json!({ "event": "Tx" })).is_err());

        subs.subscribe(&json!(3), &json!({ "event": "Tx" })).unwrap();
        let evsw = subs.evsw.clone();
        subs.close();
        assert_eq!(evsw.num_listeners("Tx"), 0);
    }
}
