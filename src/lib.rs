//! Relaypool - proxy pool orchestration and traffic relay
//!
//! Clients send HTTP and CONNECT requests to one stable relay endpoint. Each
//! request is forwarded through one proxy of a pool that is created, probed
//! and destroyed on demand across heterogeneous backend providers.
//!
//! ## Layers
//!
//! - `net`: timed connections, socket registry, TLS, CONNECT and SOCKS5 tunnels
//! - `transports`: turn a proxy's config into physical request arguments
//! - `connectors`: provider types and their provisioning task commands
//! - `tasks`: durable step-wise task scheduler with retry and cancellation
//! - `services`: reconciliation, probing, free proxy and metrics refresh loops
//! - `proxy`: the relay server
//! - `api`: REST management API

pub mod api;
pub mod config;
pub mod connectors;
pub mod database;
pub mod error;
pub mod models;
pub mod net;
pub mod proxy;
pub mod repository;
pub mod services;
pub mod tasks;
pub mod transports;

pub use config::Config;
pub use database::Database;
pub use error::{PoolError, Result};
