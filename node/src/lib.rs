//! Node library: the lifecycle core of a peer-to-peer chain node.
//!
//! [`node::Node`] assembles storage, the chain, wallet indexing, the p2p
//! switch with its reactors, and the RPC servers, and starts and stops them
//! in order. The binary in `main.rs` only parses flags, loads the
//! configuration and decides the exit policy.

pub mod blockchain;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod node;
pub mod p2p;
pub mod rpc;
pub mod service;

pub use config::Config;
pub use error::NodeError;
pub use node::Node;

pub use chainlib;
pub use wallet;
