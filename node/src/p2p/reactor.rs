use super::peer::Peer;
use super::switch::Switch;
use crate::error::SwitchError;
use async_trait::async_trait;
use std::sync::{Arc, Weak};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub id: u8,
    pub name: &'static str,
    pub priority: u8,
}

/// A protocol handler registered with the [`Switch`]. The switch routes
/// every inbound frame to the reactor owning its channel and tells every
/// reactor about peers coming and going.
#[async_trait]
pub trait Reactor: Send + Sync {
    fn channels(&self) -> Vec<ChannelDescriptor>;

    /// Called once, before `on_start`.
    fn set_switch(&self, _switch: Weak<Switch>) {}

    async fn on_start(&self) -> Result<(), SwitchError> {
        Ok(())
    }

    async fn on_stop(&self) {}

    async fn add_peer(&self, peer: Arc<Peer>);

    async fn remove_peer(&self, peer: Arc<Peer>, reason: &str);

    async fn receive(&self, channel: u8, peer: Arc<Peer>, msg: Vec<u8>);
}
