//! API server implementation
//!
//! REST endpoints for managing connectors, their proxies and tasks.

pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;

pub use server::{ApiServer, AppState};
