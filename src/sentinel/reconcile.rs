//! Verdict reconciliation loop
//!
//! Polls the detection service for every pending report until each one is terminal:
//! benign, malicious (quarantined or failed to quarantine), timed out, or dropped
//! after a client error. Each round fetches all pending reports first and only then
//! acts on the finished ones, in discovery order. Between rounds the loop sleeps a
//! fixed interval. A rejected API key or rejected Drive credentials trip the run's
//! `AbortSignal`, after which no further rounds are started.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::sentinel::coordinator::{AbortSignal, FatalError};
use crate::sentinel::drive::FileStore;
use crate::sentinel::logger::{log_quarantine, log_quarantine_failure, log_timeout, log_verdict};
use crate::sentinel::{
    AppConfig, DetectionService, Quarantine, Report, SubmissionRecord, SubmissionTracker,
    VerdictOutcome,
};

/// How long and how often a report is polled before it is given up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Measured from submission. `None` polls until the report finishes.
    pub deadline: Option<Duration>,
    /// Poll rounds per call to `drain`. `None` is unlimited.
    pub max_polls: Option<u32>,
}

impl PollPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            deadline: config.job_deadline(),
            max_polls: config.max_polls(),
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            deadline: Some(Duration::from_secs(1800)),
            max_polls: None,
        }
    }
}

/// A report that reached a terminal state, with the file it belonged to.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub record: SubmissionRecord,
    pub outcome: VerdictOutcome,
}

pub struct Reconciler<D: ?Sized> {
    detection: Arc<D>,
    tracker: Arc<SubmissionTracker>,
    quarantine: Quarantine,
    policy: PollPolicy,
    abort: AbortSignal,
}

impl<D: DetectionService + ?Sized> Reconciler<D> {
    pub fn new(
        detection: Arc<D>,
        tracker: Arc<SubmissionTracker>,
        quarantine: Quarantine,
        policy: PollPolicy,
    ) -> Self {
        Self {
            detection,
            tracker,
            quarantine,
            policy,
            abort: AbortSignal::new(),
        }
    }

    /// Share `abort` with the caller instead of a private signal.
    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    /// Poll `report_ids` until every one is terminal and resolved in the tracker.
    ///
    /// Each id must be registered in the tracker. `store` is used only for quarantine moves.
    pub async fn drain<S: FileStore + ?Sized>(&self, report_ids: Vec<String>, store: &S) -> Vec<Verdict> {
        let mut verdicts = Vec::with_capacity(report_ids.len());
        let mut pending = report_ids;
        let mut polls: u32 = 0;

        while !pending.is_empty() {
            if self.abort.is_tripped() {
                warn!("Run aborted with {} report(s) unresolved", pending.len());
                break;
            }
            polls += 1;
            debug!("Poll round {} for {} report(s)", polls, pending.len());

            let mut finished: Vec<(String, Report)> = Vec::new();
            let mut unfinished = Vec::new();
            for report_id in pending {
                match self.detection.get_report(&report_id).await {
                    Ok(report) if report.is_done() => finished.push((report_id, report)),
                    Ok(_) => unfinished.push(report_id),
                    Err(e) if e.is_auth_failure() => {
                        self.abort.trip(FatalError::Detection(e));
                        unfinished.push(report_id);
                    }
                    Err(e) if e.is_client() => {
                        warn!("Dropping report {}: {}", report_id, e);
                        if let Some(record) = self.take(&report_id) {
                            verdicts.push(Verdict {
                                record,
                                outcome: VerdictOutcome::FetchFailed(e.to_string()),
                            });
                        }
                    }
                    Err(e) => {
                        warn!("Could not fetch report {}, retrying next round: {}", report_id, e);
                        unfinished.push(report_id);
                    }
                }
            }

            for (report_id, report) in finished {
                if let Some(verdict) = self.settle(&report_id, &report, store).await {
                    verdicts.push(verdict);
                }
            }

            pending = Vec::with_capacity(unfinished.len());
            for report_id in unfinished {
                if self.expired(&report_id, polls) {
                    if let Some(record) = self.take(&report_id) {
                        log_timeout(&record.report_id, &record.file_id, &record.file_name, polls);
                        verdicts.push(Verdict {
                            record,
                            outcome: VerdictOutcome::TimedOut,
                        });
                    }
                } else {
                    pending.push(report_id);
                }
            }

            if !pending.is_empty() && !self.abort.is_tripped() {
                sleep(self.policy.interval).await;
            }
        }

        verdicts
    }

    /// Resolve a finished report and apply its verdict.
    async fn settle<S: FileStore + ?Sized>(
        &self,
        report_id: &str,
        report: &Report,
        store: &S,
    ) -> Option<Verdict> {
        let record = self.take(report_id)?;
        log_verdict(report_id, &record.file_id, &record.file_name, report.is_malicious);

        let outcome = if report.is_malicious {
            match self.quarantine.isolate(store, &record.file_id).await {
                Ok(()) => {
                    log_quarantine(&record.file_id, &record.file_name, self.quarantine.folder_id());
                    VerdictOutcome::Quarantined
                }
                Err(e) => {
                    let details = e.to_string();
                    log_quarantine_failure(&record.file_id, &record.file_name, &details);
                    if let Some(source) = e.into_auth_failure() {
                        self.abort.trip(FatalError::Drive(source));
                    }
                    VerdictOutcome::QuarantineFailed(details)
                }
            }
        } else {
            VerdictOutcome::Benign
        };

        Some(Verdict { record, outcome })
    }

    fn take(&self, report_id: &str) -> Option<SubmissionRecord> {
        match self.tracker.resolve(report_id) {
            Ok(record) => Some(record),
            Err(e) => {
                error!("Reconciliation bookkeeping error: {}", e);
                None
            }
        }
    }

    fn expired(&self, report_id: &str, polls: u32) -> bool {
        if self.policy.max_polls.is_some_and(|max| polls >= max) {
            return true;
        }
        match (self.policy.deadline, self.tracker.get(report_id)) {
            (Some(deadline), Some(record)) => record.submitted_at.elapsed() >= deadline,
            _ => false,
        }
    }
}
