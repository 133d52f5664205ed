//! In-memory map from outstanding report ids to the files they were submitted for
//!
//! Lives for exactly one run. Nothing here is persisted: records still pending
//! when the process dies are abandoned.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TrackerError {
    #[error("report id {0} is already tracked")]
    DuplicateReportId(String),

    #[error("report id {0} is not tracked")]
    UnknownReportId(String),
}

pub type TrackerResult<T> = Result<T, TrackerError>;

#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    pub report_id: String,
    pub file_id: String,
    pub file_name: String,
    pub submitted_at: Instant,
    /// Position in discovery order, used to order snapshots.
    pub sequence: u64,
}

#[derive(Debug, Default)]
struct TrackerState {
    records: HashMap<String, SubmissionRecord>,
    next_sequence: u64,
}

/// Shared by every worker; the lock is never held across an await.
#[derive(Debug, Default)]
pub struct SubmissionTracker {
    state: Mutex<TrackerState>,
}

impl SubmissionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        report_id: impl Into<String>,
        file_id: impl Into<String>,
        file_name: impl Into<String>,
    ) -> TrackerResult<()> {
        let report_id = report_id.into();
        let mut state = self.state.lock();
        if state.records.contains_key(&report_id) {
            return Err(TrackerError::DuplicateReportId(report_id));
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.records.insert(
            report_id.clone(),
            SubmissionRecord {
                report_id,
                file_id: file_id.into(),
                file_name: file_name.into(),
                submitted_at: Instant::now(),
                sequence,
            },
        );
        Ok(())
    }

    /// Remove the record for a report that reached a terminal state.
    pub fn resolve(&self, report_id: &str) -> TrackerResult<SubmissionRecord> {
        self.state
            .lock()
            .records
            .remove(report_id)
            .ok_or_else(|| TrackerError::UnknownReportId(report_id.to_string()))
    }

    /// Copy of a record without resolving it.
    pub fn get(&self, report_id: &str) -> Option<SubmissionRecord> {
        self.state.lock().records.get(report_id).cloned()
    }

    /// Point-in-time snapshot of unresolved ids, in registration order.
    pub fn pending_ids(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut pending: Vec<(u64, String)> = state
            .records
            .values()
            .map(|record| (record.sequence, record.report_id.clone()))
            .collect();
        pending.sort_unstable_by_key(|(sequence, _)| *sequence);
        pending.into_iter().map(|(_, id)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
