//! Process-wide publish/subscribe bus.

use crate::error::ServiceError;
use crate::service::BaseService;
use chainlib::sha256::Hash;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

pub const EVENT_NEW_BLOCK: &str = "NewBlock";
pub const EVENT_TX: &str = "Tx";
pub const EVENT_PEER_ADDED: &str = "PeerAdded";
pub const EVENT_PEER_REMOVED: &str = "PeerRemoved";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    NewBlock { height: u64, hash: Hash },
    Tx { id: Hash },
    PeerAdded { id: String, addr: String },
    PeerRemoved { id: String, reason: String },
}

/// Maps a client supplied event name to the registered constant.
pub fn lookup_event(name: &str) -> Option<&'static str> {
    [EVENT_NEW_BLOCK, EVENT_TX, EVENT_PEER_ADDED, EVENT_PEER_REMOVED]
        .into_iter()
        .find(|known| *known == name)
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::NewBlock { .. } => EVENT_NEW_BLOCK,
            Event::Tx { .. } => EVENT_TX,
            Event::PeerAdded { .. } => EVENT_PEER_ADDED,
            Event::PeerRemoved { .. } => EVENT_PEER_REMOVED,
        }
    }
}

struct Subscription {
    listener: String,
    tx: mpsc::UnboundedSender<Event>,
}

/// Typed pub/sub. Subscribers get their own unbounded queue per event name;
/// firing never blocks the publisher. Events fired while the switch is not
/// running are dropped.
pub struct EventSwitch {
    service: BaseService,
    subs: RwLock<HashMap<&'static str, Vec<Subscription>>>,
}

impl Default for EventSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSwitch {
    pub fn new() -> Self {
        Self {
            service: BaseService::new("EventSwitch"),
            subs: RwLock::new(HashMap::new()),
        }
    }

    pub fn start(&self) -> Result<(), ServiceError> {
        self.service.begin_start()?;
        self.service.finish_start(true);
        Ok(())
    }

    pub fn stop(&self) -> Result<(), ServiceError> {
        self.service.begin_stop()?;
        self.subs.write().clear();
        self.service.finish_stop();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.service.is_running()
    }

    pub fn add_listener_for_event(
        &self,
        listener: &str,
        event: &'static str,
    ) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subs.write().entry(event).or_default().push(Subscription {
            listener: listener.to_string(),
            tx,
        });
        rx
    }

    pub fn remove_listener_for_event(&self, listener: &str, event: &str) {
        if let Some(subs) = self.subs.write().get_mut(event) {
            subs.retain(|s| s.listener != listener);
        }
    }

    pub fn remove_listener(&self, listener: &str) {
        for subs in self.subs.write().values_mut() {
            subs.retain(|s| s.listener != listener);
        }
    }

    pub fn fire_event(&self, event: Event) {
        if !self.is_running() {
            debug!(event = event.name(), "event switch not running, dropping event");
            return;
        }
        let mut subs = self.subs.write();
        if let Some(list) = subs.get_mut(event.name()) {
            // closed receivers unsubscribe themselves
            list.retain(|s| s.tx.send(event.clone()).is_ok());
        }
    }

    pub fn num_listeners(&self, event: &str) -> usize {
        self.subs.read().get(event).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_subscribers_of_that_event_only() {
        let evsw = EventSwitch::new();
        evsw.start().unwrap();
        let mut blocks = evsw.add_listener_for_event("ws-1", EVENT_NEW_BLOCK);
        let mut txs = evsw.add_listener_for_event("ws-1", EVENT_TX);

        let event = Event::NewBlock {
            height: 2,
            hash: Hash::zero(),
        };
        evsw.fire_event(event.clone());
        assert_eq!(blocks.recv().await, Some(event));
        assert!(txs.try_recv().is_err());

        evsw.remove_listener("ws-1");
        assert_eq!(evsw.num_listeners(EVENT_NEW_BLOCK), 0);
        assert_eq!(blocks.recv().await, None);
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let evsw = EventSwitch::new();
        evsw.start().unwrap();
        drop(evsw.add_listener_for_event("gone", EVENT_TX));
        evsw.fire_event(Event::Tx { id: Hash::zero() });
        assert_eq!(evsw.num_listeners(EVENT_TX), 0);
    }

    #[test]
    fn cannot_start_twice() {
        let evsw = EventSwitch::new();
        evsw.start().unwrap();
        assert!(matches!(evsw.start(), Err(ServiceError::AlreadyStarted(_))));
    }
}
