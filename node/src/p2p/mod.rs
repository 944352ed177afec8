//! Peer connections and the reactors that speak over them.

pub mod addrbook;
pub mod conn;
pub mod listener;
pub mod netaddress;
pub mod node_info;
pub mod peer;
pub mod pex;
pub mod reactor;
pub mod switch;

pub use addrbook::AddrBook;
pub use listener::DefaultListener;
pub use netaddress::NetAddress;
pub use node_info::NodeInfo;
pub use peer::{Peer, SendStatus};
pub use pex::PexReactor;
pub use reactor::{ChannelDescriptor, Reactor};
pub use switch::Switch;

/// Version of the peer protocol; peers must agree on the major number.
pub const VERSION: &str = "0.5.0";
