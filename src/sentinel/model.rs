//! Data types shared by the adapters and the reconciliation engine

use std::fmt;

use serde::{Deserialize, Serialize};

/// A file discovered in the store. Identity is `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub id: String,
    pub name: String,
    /// `None` for files the principal does not own (shared-in items).
    pub size: Option<u64>,
    pub mime_type: String,
}

impl FileDescriptor {
    /// Decide whether the file may be downloaded at all under `size_cap`.
    pub fn eligibility(&self, size_cap: u64) -> Result<u64, SkipReason> {
        match self.size {
            None => Err(SkipReason::NotOwned),
            Some(size) if size > size_cap => Err(SkipReason::TooLarge { size, cap: size_cap }),
            Some(size) => Ok(size),
        }
    }
}

/// Why a discovered file was never submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotOwned,
    TooLarge { size: u64, cap: u64 },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotOwned => write!(f, "no size reported, most likely a shared file"),
            SkipReason::TooLarge { size, cap } => {
                write!(f, "{} bytes exceeds the {} byte scan limit", size, cap)
            }
        }
    }
}

/// Overall state of a detection report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReportStatus {
    Pending,
    Done,
    /// Anything the service reports that we do not model is treated as not finished.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub report_id: String,
    pub overall_status: ReportStatus,
    #[serde(default)]
    pub is_malicious: bool,
    #[serde(default)]
    pub file_name: String,
}

impl Report {
    pub fn is_done(&self) -> bool {
        self.overall_status == ReportStatus::Done
    }
}

/// Acknowledgement returned by the submission endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub status: String,
    #[serde(default)]
    pub report_id: Option<String>,
}

/// Result of the download+submit half of a file's unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Submitted { report_id: String },
    Skipped(SkipReason),
    Failed(String),
}

/// Terminal state of one report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerdictOutcome {
    Benign,
    Quarantined,
    /// Malicious, but the file could not be moved.
    QuarantineFailed(String),
    TimedOut,
    /// The report could not be fetched; dropped without a verdict.
    FetchFailed(String),
}

/// Per-run counters reported when a run completes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub discovered: usize,
    pub submitted: usize,
    pub skipped: usize,
    pub errored: usize,
    pub benign: usize,
    pub quarantined: usize,
    pub quarantine_failed: usize,
    pub timed_out: usize,
}

impl RunStats {
    pub fn record_submission(&mut self, outcome: &SubmissionOutcome) {
        match outcome {
            SubmissionOutcome::Submitted { .. } => self.submitted += 1,
            SubmissionOutcome::Skipped(_) => self.skipped += 1,
            SubmissionOutcome::Failed(_) => self.errored += 1,
        }
    }

    pub fn record_verdict(&mut self, outcome: &VerdictOutcome) {
        match outcome {
            VerdictOutcome::Benign => self.benign += 1,
            VerdictOutcome::Quarantined => self.quarantined += 1,
            VerdictOutcome::QuarantineFailed(_) => self.quarantine_failed += 1,
            VerdictOutcome::TimedOut => self.timed_out += 1,
            VerdictOutcome::FetchFailed(_) => self.errored += 1,
        }
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "discovered={} submitted={} skipped={} quarantined={} errored={} \
             (benign={} quarantine_failed={} timed_out={})",
            self.discovered,
            self.submitted,
            self.skipped,
            self.quarantined,
            self.errored,
            self.benign,
            self.quarantine_failed,
            self.timed_out
        )
    }
}
