//! Periodic refresh runner
//!
//! Every background domain (connectors, proxies, free proxies, metrics,
//! tasks) runs as a [`RefreshJob`] driven by the same loop: an interval tick,
//! an optional wake-up hint, and a `watch` shutdown channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, instrument};

use crate::error::Result;

/// One refresh domain.
#[async_trait]
pub trait RefreshJob: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// One round of work. Errors are logged and the loop keeps going.
    async fn refresh(&self) -> Result<()>;

    /// Notified to run a round before the next tick.
    fn wake_hint(&self) -> Option<Arc<Notify>> {
        None
    }
}

/// Drives a job on a fixed interval until shutdown.
pub struct RefreshLoop {
    job: Arc<dyn RefreshJob>,
    period: Duration,
}

impl RefreshLoop {
    pub fn new(job: Arc<dyn RefreshJob>, period: Duration) -> Self {
        Self { job, period }
    }

    /// Run the loop (call in a spawned task)
    #[instrument(skip_all, fields(job = self.job.name()))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting {} refresh every {}ms",
            self.job.name(),
            self.period.as_millis()
        );

        let wake = self.job.wake_hint().unwrap_or_else(|| Arc::new(Notify::new()));
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wake.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("{} refresh shutting down", self.job.name());
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.job.refresh().await {
                error!("{} refresh failed: {}", self.job.name(), e);
            }
        }
    }

    /// Spawn the loop with its own shutdown handle.
    pub fn spawn(self) -> RefreshHandle {
        let (handle, shutdown) = RefreshHandle::new(self.job.name());
        let join = tokio::spawn(async move { self.run(shutdown).await });
        handle.attach(join)
    }
}

/// Handle for stopping a spawned refresh loop
pub struct RefreshHandle {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl RefreshHandle {
    pub fn new(name: &'static str) -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                name,
                shutdown_tx: tx,
                join: None,
            },
            rx,
        )
    }

    fn attach(mut self, join: JoinHandle<()>) -> Self {
        self.join = Some(join);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Signal shutdown and wait for the current round to finish.
    pub async fn stop(mut self) {
        self.shutdown();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!("{} refresh task panicked: {}", self.name, e);
            }
        }
    }
}
