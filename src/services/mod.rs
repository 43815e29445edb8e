//! Background services

pub mod activity;
pub mod free_proxies;
pub mod metrics;
pub mod prober;
pub mod reconciler;
pub mod refresh;

pub use activity::ProjectActivity;
pub use free_proxies::FreeProxyRefresher;
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use prober::ProxyProber;
pub use reconciler::Reconciler;
pub use refresh::{RefreshHandle, RefreshJob, RefreshLoop};
