//! Drive sentinel
//! Scans newly created Drive files with the detection service and quarantines malicious ones

pub mod config_loader;
pub mod coordinator;
pub mod detection;
pub mod drive;
pub mod logger;
pub mod model;
pub mod pipeline;
pub mod quarantine;
pub mod reconcile;
pub mod run_state;
pub mod tracker;

#[cfg(test)]
pub mod testing;

// Re-export commonly used types for convenience
pub use config_loader::{
    AppConfig, ConfigError, ConfigManager, ConfigResult, MAX_PARALLELISM, init_config,
};

pub use logger::{LogEntryType, Logger, LoggerError, LoggerResult, init_logger};

pub use model::{
    FileDescriptor, Report, ReportStatus, RunStats, SkipReason, SubmissionOutcome,
    SubmitResponse, VerdictOutcome,
};

pub use tracker::{SubmissionRecord, SubmissionTracker, TrackerError, TrackerResult};

pub use drive::{DriveClient, DriveCredentials, DriveError, DriveResult, FileStore};

pub use detection::{DetectionClient, DetectionError, DetectionResult, DetectionService};

pub use quarantine::{Quarantine, QuarantineError, QuarantineResult};

pub use reconcile::{PollPolicy, Reconciler, Verdict};

pub use coordinator::{AbortSignal, Coordinator, FatalError, HandlePool, PooledHandle};

pub use run_state::{RunState, RunStateError, RunStateResult, RunStateStore};

pub use pipeline::{PipelineError, PipelineResult, RunOptions, run_once};
