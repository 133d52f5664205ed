//! Concurrency coordination for the scan pipeline
//!
//! This module provides:
//! 1. A pool of file-store handles, one per worker slot, so no handle is ever used by two
//!    units of work at once
//! 2. `submit`, the download+submit unit of work for one file
//! 3. `run`, which either submits everything and reconciles it as one batch (parallelism 1)
//!    or processes each file end to end on a bounded worker pool (parallelism > 1)
//!
//! Failures specific to one file are caught at that file's unit of work. Failures that
//! doom every other file too (rejected credentials on either service, or a detection
//! service that never answered a single submission) trip the run's `AbortSignal` and
//! come back out of `run` as a `FatalError`.

use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::sentinel::detection::DetectionError;
use crate::sentinel::drive::{DriveError, FileStore};
use crate::sentinel::logger::{log_skip, log_submission};
use crate::sentinel::reconcile::{PollPolicy, Reconciler};
use crate::sentinel::{
    DetectionService, FileDescriptor, Quarantine, RunStats, SubmissionOutcome, SubmissionTracker,
    VerdictOutcome,
};

/// A failure that ends the whole run without advancing the watermark
#[derive(Error, Debug)]
pub enum FatalError {
    #[error("Drive refused the credentials mid-run: {0}")]
    Drive(#[source] DriveError),

    #[error("Detection service refused the API key: {0}")]
    Detection(#[source] DetectionError),

    #[error("Detection service unreachable, all {attempts} submission(s) failed: {last}")]
    Unreachable {
        attempts: usize,
        #[source]
        last: DetectionError,
    },
}

/// First fatal failure seen by any worker. Cheap to clone; clones share the slot.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    cause: Arc<Mutex<Option<FatalError>>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `cause` unless an earlier one is already recorded.
    pub fn trip(&self, cause: FatalError) {
        let mut slot = self.cause.lock();
        if slot.is_none() {
            error!("Aborting run: {}", cause);
            *slot = Some(cause);
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.cause.lock().is_some()
    }

    fn take(&self) -> Option<FatalError> {
        self.cause.lock().take()
    }
}

/// Whether the detection service answered at all during this run.
#[derive(Debug, Default)]
struct Reachability {
    answered: usize,
    unavailable: usize,
    last: Option<DetectionError>,
}

/// Fixed set of store handles behind a semaphore with one permit per handle.
pub struct HandlePool<S> {
    handles: Mutex<Vec<S>>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl<S> HandlePool<S> {
    pub fn new(handles: Vec<S>) -> Arc<Self> {
        let capacity = handles.len();
        Arc::new(Self {
            handles: Mutex::new(handles),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait for a free slot. `None` only if the pool has no handles at all.
    pub async fn acquire(self: &Arc<Self>) -> Option<PooledHandle<S>> {
        if self.capacity == 0 {
            return None;
        }
        let permit = self.permits.clone().acquire_owned().await.ok()?;
        let handle = self.handles.lock().pop()?;
        Some(PooledHandle {
            handle: Some(handle),
            pool: self.clone(),
            _permit: permit,
        })
    }
}

/// Exclusive use of one handle; returned to the pool on drop.
pub struct PooledHandle<S> {
    handle: Option<S>,
    pool: Arc<HandlePool<S>>,
    _permit: OwnedSemaphorePermit,
}

impl<S> Deref for PooledHandle<S> {
    type Target = S;

    fn deref(&self) -> &S {
        // Only taken in drop
        self.handle.as_ref().unwrap_or_else(|| unreachable!("pooled handle used after release"))
    }
}

impl<S> Drop for PooledHandle<S> {
    fn drop(&mut self) {
        // The handle goes back before the permit is released
        if let Some(handle) = self.handle.take() {
            self.pool.handles.lock().push(handle);
        }
    }
}

pub struct Coordinator<S, D: ?Sized> {
    pool: Arc<HandlePool<S>>,
    detection: Arc<D>,
    tracker: Arc<SubmissionTracker>,
    reconciler: Arc<Reconciler<D>>,
    abort: AbortSignal,
    reach: Arc<Mutex<Reachability>>,
    size_cap: u64,
}

impl<S, D: ?Sized> Clone for Coordinator<S, D> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            detection: self.detection.clone(),
            tracker: self.tracker.clone(),
            reconciler: self.reconciler.clone(),
            abort: self.abort.clone(),
            reach: self.reach.clone(),
            size_cap: self.size_cap,
        }
    }
}

impl<S, D> Coordinator<S, D>
where
    S: FileStore,
    D: DetectionService + ?Sized,
{
    /// The number of handles is the degree of parallelism.
    pub fn new(
        handles: Vec<S>,
        detection: Arc<D>,
        quarantine: Quarantine,
        policy: PollPolicy,
        size_cap: u64,
    ) -> Self {
        let tracker = Arc::new(SubmissionTracker::new());
        let abort = AbortSignal::new();
        let reconciler = Arc::new(
            Reconciler::new(detection.clone(), tracker.clone(), quarantine, policy)
                .with_abort(abort.clone()),
        );
        Self {
            pool: HandlePool::new(handles),
            detection,
            tracker,
            reconciler,
            abort,
            reach: Arc::new(Mutex::new(Reachability::default())),
            size_cap,
        }
    }

    pub fn parallelism(&self) -> usize {
        self.pool.capacity()
    }

    /// Download and submit one file, registering the report on success.
    ///
    /// Ineligible files are skipped before a worker slot is taken.
    pub async fn submit(&self, file: FileDescriptor) -> SubmissionOutcome {
        if let Err(reason) = file.eligibility(self.size_cap) {
            log_skip(&file, reason);
            return SubmissionOutcome::Skipped(reason);
        }
        match self.pool.acquire().await {
            Some(handle) => self.submit_with(&*handle, &file).await,
            None => SubmissionOutcome::Failed("no file store handle available".to_string()),
        }
    }

    /// Discover-to-verdict for a whole batch of files.
    ///
    /// `Err` means the run must not count as complete, whatever the per-file counters say.
    pub async fn run(&self, files: Vec<FileDescriptor>) -> Result<RunStats, FatalError> {
        let mut stats = RunStats {
            discovered: files.len(),
            ..RunStats::default()
        };

        let mut eligible = Vec::with_capacity(files.len());
        for file in files {
            match file.eligibility(self.size_cap) {
                Ok(_) => eligible.push(file),
                Err(reason) => {
                    log_skip(&file, reason);
                    stats.record_submission(&SubmissionOutcome::Skipped(reason));
                }
            }
        }

        if self.parallelism() <= 1 {
            self.run_sequential(eligible, &mut stats).await;
        } else {
            self.run_pool(eligible, &mut stats).await;
        }

        if let Some(cause) = self.abort.take().or_else(|| self.unreachable()) {
            return Err(cause);
        }
        if !self.tracker.is_empty() {
            // Unreachable unless a report was registered outside this run's bookkeeping
            warn!("{} report(s) left unresolved", self.tracker.len());
        }
        Ok(stats)
    }

    fn unreachable(&self) -> Option<FatalError> {
        let mut reach = self.reach.lock();
        if reach.answered > 0 {
            return None;
        }
        let attempts = reach.unavailable;
        let last = reach.last.take()?;
        error!("Detection service did not answer any of {} submission(s)", attempts);
        Some(FatalError::Unreachable { attempts, last })
    }

    async fn run_sequential(&self, files: Vec<FileDescriptor>, stats: &mut RunStats) {
        info!("Submitting {} file(s) sequentially", files.len());
        for file in files {
            if self.abort.is_tripped() {
                break;
            }
            let span = info_span!("file", file_id = %file.id);
            let outcome = self.submit(file).instrument(span).await;
            stats.record_submission(&outcome);
        }

        let pending = self.tracker.pending_ids();
        if pending.is_empty() || self.abort.is_tripped() {
            return;
        }
        info!("Waiting on {} report(s)", pending.len());
        let Some(handle) = self.pool.acquire().await else {
            error!("No file store handle available for reconciliation");
            return;
        };
        for verdict in self.reconciler.drain(pending, &*handle).await {
            stats.record_verdict(&verdict.outcome);
        }
    }

    async fn run_pool(&self, files: Vec<FileDescriptor>, stats: &mut RunStats) {
        info!(
            "Processing {} file(s) on {} workers",
            files.len(),
            self.parallelism()
        );
        let mut workers = JoinSet::new();
        for file in files {
            let coordinator = self.clone();
            let span = info_span!("file", file_id = %file.id);
            workers.spawn(async move { coordinator.process(file).await }.instrument(span));
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((outcome, verdict)) => {
                    stats.record_submission(&outcome);
                    if let Some(verdict) = verdict {
                        stats.record_verdict(&verdict);
                    }
                }
                Err(e) => {
                    error!("Worker task failed: {}", e);
                    stats.errored += 1;
                }
            }
        }
    }

    /// One worker's unit of work: download, submit, poll and act, holding a slot throughout.
    async fn process(&self, file: FileDescriptor) -> (SubmissionOutcome, Option<VerdictOutcome>) {
        let Some(handle) = self.pool.acquire().await else {
            return (
                SubmissionOutcome::Failed("no file store handle available".to_string()),
                None,
            );
        };
        if self.abort.is_tripped() {
            return (SubmissionOutcome::Failed("run aborted".to_string()), None);
        }

        let outcome = self.submit_with(&*handle, &file).await;
        let verdict = match &outcome {
            SubmissionOutcome::Submitted { report_id } => self
                .reconciler
                .drain(vec![report_id.clone()], &*handle)
                .await
                .into_iter()
                .next()
                .map(|verdict| verdict.outcome),
            _ => None,
        };
        (outcome, verdict)
    }

    async fn submit_with(&self, store: &S, file: &FileDescriptor) -> SubmissionOutcome {
        let content = match store.download(&file.id).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to download {} ({}): {}", file.name, file.id, e);
                let outcome = SubmissionOutcome::Failed(format!("download failed: {}", e));
                if e.is_auth_failure() {
                    self.abort.trip(FatalError::Drive(e));
                }
                return outcome;
            }
        };
        debug!("Downloaded {} ({} bytes)", file.name, content.len());
        let sha256 = hex::encode(Sha256::digest(&content));

        let ack = match self.detection.submit(&file.name, content).await {
            Ok(ack) => {
                self.reach.lock().answered += 1;
                ack
            }
            Err(e) => {
                warn!("Failed to submit {} ({}): {}", file.name, file.id, e);
                let outcome = SubmissionOutcome::Failed(format!("submission failed: {}", e));
                if e.is_auth_failure() {
                    self.abort.trip(FatalError::Detection(e));
                } else if e.is_client() {
                    self.reach.lock().answered += 1;
                } else {
                    let mut reach = self.reach.lock();
                    reach.unavailable += 1;
                    reach.last = Some(e);
                }
                return outcome;
            }
        };

        let report_id = match (ack.status.as_str(), ack.report_id) {
            ("success", Some(report_id)) => report_id,
            (status, _) => {
                warn!("Detection service did not accept {}: status={}", file.name, status);
                return SubmissionOutcome::Failed(format!("submission rejected: {}", status));
            }
        };

        if let Err(e) = self.tracker.register(&report_id, &file.id, &file.name) {
            error!("Cannot track {}: {}", file.name, e);
            return SubmissionOutcome::Failed(e.to_string());
        }
        log_submission(file, &report_id, &sha256);
        SubmissionOutcome::Submitted { report_id }
    }
}
