//! RPC surfaces: the gated core HTTP server, the JSON-RPC listeners with
//! their websocket endpoint, and the gRPC broadcast API.

pub mod core;
pub mod grpc;
pub mod listeners;
pub mod server;
pub mod wait_handler;
pub mod websocket;

pub use self::core::{RpcEnv, Routes};
pub use listeners::{ListenerKind, RpcListener, start_rpc};
pub use server::{DebugVars, HttpServer, rpc_init, start_prof_server};
pub use wait_handler::WaitHandler;
