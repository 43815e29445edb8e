pub mod connector;
pub mod fingerprint;
pub mod free_proxy;
pub mod project;
pub mod proxy;
pub mod task;

pub use connector::*;
pub use fingerprint::*;
pub use free_proxy::*;
pub use project::*;
pub use proxy::*;
pub use task::*;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
