//! Asset Sync Engine
//!
//! This module keeps a key-value cache consistent with a versioned,
//! file-based source of truth:
//! - Revision-token change detection with incremental and full cycles
//! - Atomic per-record cache writes driven by a fingerprint diff
//! - Orphan sweeping after complete scans
//! - Optimistic-concurrency write-back to the source of truth
//! - Manual and periodic scheduling with retry for transient failures

pub mod detector;
pub mod engine;
pub mod orphan;
pub mod reconcile;
pub mod report;
pub mod retry;
pub mod scanner;
pub mod scheduler;
pub mod writeback;

// Re-export main types
pub use detector::{ChangeDetector, Detection};
pub use engine::{ComponentHealth, HealthReport, SyncConfig, SyncEngine, DEFAULT_CYCLE_LEASE};
pub use orphan::{OrphanSweeper, SweepOutcome};
pub use reconcile::{ChangeSet, Reconciler};
pub use report::{CycleMode, CycleReport, InvalidRecord, MAX_REPORTED_ERRORS};
pub use retry::{RetryConfig, RetryExecutor};
pub use scanner::RepositoryScanner;
pub use scheduler::{SyncMode, SyncRequest, SyncScheduler, SyncSchedulerHandle};
pub use writeback::{WriteBackCoordinator, WriteBackOutcome, WriteOptions};

pub use tokio_util::sync::CancellationToken;
