//! Sync scheduling - manual and periodic modes.
//!
//! Explicit requests and periodic ticks share one queue, so cycles started
//! through the scheduler never overlap.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use assetsync_common::{Error, Result};

use crate::report::CycleReport;

/// Sync mode configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Sync only on explicit requests.
    Manual,
    /// Run an incremental cycle at regular intervals, plus explicit requests.
    Periodic { interval: Duration },
}

impl SyncMode {
    fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Manual => None,
            SyncMode::Periodic { interval } => Some(*interval),
        }
    }
}

/// Sync request types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequest {
    /// Scan unconditionally.
    Full,
    /// Scan only if the source revision moved.
    Incremental,
    /// Shutdown the scheduler.
    Shutdown,
}

type Request = (SyncRequest, oneshot::Sender<Result<CycleReport>>);

/// Scheduler for managing sync timing and requests.
pub struct SyncScheduler {
    /// Channel to send sync requests.
    request_tx: mpsc::Sender<Request>,
    /// Shutdown signal.
    shutdown: Arc<RwLock<bool>>,
}

impl SyncScheduler {
    /// Create a new scheduler with the given mode.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let shutdown = Arc::new(RwLock::new(false));

        let scheduler = Self {
            request_tx,
            shutdown: shutdown.clone(),
        };

        let handle = SyncSchedulerHandle {
            interval: mode.interval(),
            request_rx: Some(request_rx),
            shutdown,
        };

        (scheduler, handle)
    }

    /// Request a full cycle and wait for its report.
    pub async fn request_sync(&self) -> Result<CycleReport> {
        self.request(SyncRequest::Full).await
    }

    /// Request an incremental cycle and wait for its report.
    pub async fn request_incremental(&self) -> Result<CycleReport> {
        self.request(SyncRequest::Incremental).await
    }

    async fn request(&self, request: SyncRequest) -> Result<CycleReport> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((request, response_tx))
            .await
            .map_err(|_| Error::InvalidInput("Scheduler not running".to_string()))?;

        // The scheduler dropped the request while shutting down.
        response_rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Shutdown the scheduler.
    pub async fn shutdown(&self) {
        let mut is_shutdown = self.shutdown.write().await;
        *is_shutdown = true;
        drop(is_shutdown);

        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((SyncRequest::Shutdown, response_tx))
            .await;
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    /// Tick period; `None` in manual mode.
    interval: Option<Duration>,
    request_rx: Option<mpsc::Receiver<Request>>,
    shutdown: Arc<RwLock<bool>>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler background task.
    ///
    /// This should be spawned in a tokio task. `sync_fn` is called for each
    /// explicit request and, in periodic mode, with `Incremental` on every
    /// tick. The first tick fires immediately.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn(SyncRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<CycleReport>> + Send,
    {
        let Some(mut request_rx) = self.request_rx.take() else {
            error!("Sync scheduler handle was already run");
            return;
        };
        let mut periodic = self.interval.map(Self::ticker);

        info!("Sync scheduler started");

        loop {
            if *self.shutdown.read().await {
                info!("Sync scheduler shutting down");
                break;
            }

            tokio::select! {
                received = request_rx.recv() => {
                    let Some((request, response_tx)) = received else {
                        info!("All scheduler senders dropped");
                        break;
                    };
                    if request == SyncRequest::Shutdown {
                        info!("Received shutdown request");
                        break;
                    }
                    debug!(?request, "Processing sync request");
                    let result = sync_fn(request).await;
                    let _ = response_tx.send(result);
                }

                _ = Self::wait_for_periodic(&mut periodic) => {
                    debug!("Triggering periodic sync");
                    match sync_fn(SyncRequest::Incremental).await {
                        Ok(report) if report.skipped => {
                            debug!("Periodic sync skipped, source unchanged");
                        }
                        Ok(report) => {
                            info!(
                                "Periodic sync completed: {} created, {} updated, {} deleted, {} invalid",
                                report.created.len(),
                                report.updated.len(),
                                report.deleted.len(),
                                report.invalid_count
                            );
                        }
                        Err(e) => {
                            error!("Periodic sync failed: {}", e);
                        }
                    }
                }
            }
        }
    }

    fn ticker(period: Duration) -> Interval {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    async fn wait_for_periodic(periodic: &mut Option<Interval>) {
        match periodic {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}
