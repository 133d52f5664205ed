//! One scan run from watermark to watermark
//!
//! Setup, listing and the final watermark write are fatal. So is a run the coordinator
//! aborts: credentials rejected by Drive or the detection service partway through, or a
//! detection service that failed every submission. Everything that goes wrong for a
//! single file is absorbed by the coordinator and shows up in the returned `RunStats`.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

use crate::sentinel::coordinator::{Coordinator, FatalError};
use crate::sentinel::detection::{DetectionError, DetectionService};
use crate::sentinel::drive::{DriveError, FileStore};
use crate::sentinel::logger::{log_discovery, log_summary};
use crate::sentinel::reconcile::PollPolicy;
use crate::sentinel::run_state::{RunStateError, RunStateStore};
use crate::sentinel::{AppConfig, Quarantine, RunStats};

/// Errors that abort a run before the watermark is advanced
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Run state error: {0}")]
    RunState(#[from] RunStateError),

    #[error("Drive error: {0}")]
    Drive(#[from] DriveError),

    #[error("Detection service error: {0}")]
    Detection(#[from] DetectionError),

    #[error("Setup error: {0}")]
    Setup(String),
}

impl From<FatalError> for PipelineError {
    fn from(cause: FatalError) -> Self {
        match cause {
            FatalError::Drive(e) => PipelineError::Drive(e),
            FatalError::Detection(e) | FatalError::Unreachable { last: e, .. } => {
                PipelineError::Detection(e)
            }
        }
    }
}

/// Result type for a run
pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Ignore the stored watermark and consider every file.
    pub full_scan: bool,
}

/// Run one scan with one file-store handle per worker slot.
pub async fn run_once<S, D>(
    config: &AppConfig,
    handles: Vec<S>,
    detection: Arc<D>,
    state_store: &RunStateStore,
    options: RunOptions,
) -> PipelineResult<RunStats>
where
    S: FileStore,
    D: DetectionService + ?Sized,
{
    let run_id = Uuid::new_v4();
    let span = info_span!("run", %run_id);
    async move {
        let result = execute(config, handles, detection, state_store, options).await;
        if let Err(e) = &result {
            match e {
                PipelineError::Drive(drive) if drive.is_auth_failure() => {
                    error!("Drive refused our credentials, aborting run: {}", drive)
                }
                other => error!("Run aborted: {}", other),
            }
        }
        result
    }
    .instrument(span)
    .await
}

async fn execute<S, D>(
    config: &AppConfig,
    handles: Vec<S>,
    detection: Arc<D>,
    state_store: &RunStateStore,
    options: RunOptions,
) -> PipelineResult<RunStats>
where
    S: FileStore,
    D: DetectionService + ?Sized,
{
    if handles.is_empty() {
        return Err(PipelineError::Setup("no file store handles".to_string()));
    }

    let mut state = state_store.load()?;
    let created_after = if options.full_scan {
        info!("Full scan requested, ignoring watermark {:?}", state.watermark());
        None
    } else {
        state.watermark().map(str::to_string)
    };

    // Captured before listing so files created during the run are seen next time
    let started_at = Utc::now();

    let (quarantine_id, files) = {
        let lister = &handles[0];
        let quarantine_id = lister
            .ensure_folder(&config.drive.quarantine_folder_name)
            .await?;
        info!(
            "Quarantine folder {:?} is {}",
            config.drive.quarantine_folder_name, quarantine_id
        );
        let files = lister
            .list_files(created_after.as_deref(), std::slice::from_ref(&quarantine_id))
            .await?;
        (quarantine_id, files)
    };
    log_discovery(files.len(), created_after.as_deref());

    let coordinator = Coordinator::new(
        handles,
        detection,
        Quarantine::new(quarantine_id),
        PollPolicy::from_config(config),
        config.limits.file_size_cap,
    );
    let stats = coordinator.run(files).await?;

    state.advance_to(started_at);
    state_store.save(&state)?;
    log_summary(&stats);
    Ok(stats)
}
