//! Relay server
//!
//! Clients talk to one stable endpoint; every request is forwarded through a
//! `Started` proxy of the pool:
//! - CONNECT tunnels for HTTPS
//! - absolute-form HTTP requests
//! - round-robin selection with retry on another proxy

pub mod handler;
pub mod selector;
pub mod server;
pub mod tunnel;

pub use handler::{RelayHandler, RelayHandlerConfig};
pub use selector::{ConnectionTracker, ProxySelector, RoundRobinSelector};
pub use server::RelayServer;
