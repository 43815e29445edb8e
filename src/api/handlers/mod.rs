//! API request handlers

pub mod connectors;
pub mod health;
pub mod metrics;
pub mod projects;
pub mod proxies;
pub mod tasks;
