//! Structured logging for the sentinel
//!
//! This module provides functionality for:
//! 1. Initializing the tracing subscriber (terminal and rolling file, JSON or line format)
//! 2. Audit helpers that tag every skip, submission, verdict and quarantine with an entry type

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

use crate::sentinel::{AppConfig, FileDescriptor, RunStats, SkipReason};

const LOG_FILE_NAME: &str = "drive_sentinel.log";

/// Error types for logging
#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type for logging operations
pub type LoggerResult<T> = Result<T, LoggerError>;

/// Log entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEntryType {
    Discovery,
    Skip,
    Submission,
    Verdict,
    Quarantine,
    QuarantineFailure,
    Timeout,
    Summary,
}

impl std::fmt::Display for LogEntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogEntryType::Discovery => write!(f, "discovery"),
            LogEntryType::Skip => write!(f, "skip"),
            LogEntryType::Submission => write!(f, "submission"),
            LogEntryType::Verdict => write!(f, "verdict"),
            LogEntryType::Quarantine => write!(f, "quarantine"),
            LogEntryType::QuarantineFailure => write!(f, "quarantine_failure"),
            LogEntryType::Timeout => write!(f, "timeout"),
            LogEntryType::Summary => write!(f, "summary"),
        }
    }
}

/// Keeps the non-blocking file writer alive for the lifetime of the process.
pub struct Logger {
    _guard: Option<WorkerGuard>,
}

impl Logger {
    /// Install the global subscriber described by the `[logging]` section
    pub fn new(config: &AppConfig) -> LoggerResult<Self> {
        let logging = &config.logging;

        let filter = || {
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&logging.log_level))
                .map_err(|e| LoggerError::Logging(e.to_string()))
        };
        let json = logging.log_format == "json";

        let terminal_layer = if logging.log_to_terminal {
            Some(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(filter()?),
            )
        } else {
            None
        };

        let (file_layer, guard) = if logging.log_to_file {
            let log_dir = PathBuf::from(&config.paths.log_directory);
            if !log_dir.exists() {
                std::fs::create_dir_all(&log_dir)?;
            }
            let (writer, guard) = Self::file_writer(&log_dir);
            let layer = if json {
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_filter(filter()?)
                    .boxed()
            } else {
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_filter(filter()?)
                    .boxed()
            };
            (Some(layer), Some(guard))
        } else {
            (None, None)
        };

        tracing_subscriber::registry()
            .with(terminal_layer)
            .with(file_layer)
            .try_init()
            .map_err(|e| LoggerError::Logging(e.to_string()))?;

        info!(
            log_format = %logging.log_format,
            log_level = %logging.log_level,
            message = "Logger initialized",
        );

        Ok(Self { _guard: guard })
    }

    fn file_writer(log_dir: &Path) -> (tracing_appender::non_blocking::NonBlocking, WorkerGuard) {
        let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_NAME);
        tracing_appender::non_blocking(file_appender)
    }
}

pub fn log_discovery(count: usize, created_after: Option<&str>) {
    info!(
        entry_type = %LogEntryType::Discovery,
        discovered = count,
        created_after = created_after.unwrap_or("<full scan>"),
        "Discovered {} new file(s)",
        count
    );
}

pub fn log_skip(file: &FileDescriptor, reason: SkipReason) {
    info!(
        entry_type = %LogEntryType::Skip,
        file_id = %file.id,
        file_name = %file.name,
        size = file.size,
        reason = %reason,
        "Skipping file {}: {}",
        file.name,
        reason
    );
}

pub fn log_submission(file: &FileDescriptor, report_id: &str, sha256: &str) {
    info!(
        entry_type = %LogEntryType::Submission,
        file_id = %file.id,
        file_name = %file.name,
        report_id = report_id,
        sha256 = sha256,
        "Submitted {} for scanning",
        file.name
    );
}

pub fn log_verdict(report_id: &str, file_id: &str, file_name: &str, is_malicious: bool) {
    info!(
        entry_type = %LogEntryType::Verdict,
        report_id = report_id,
        file_id = file_id,
        file_name = file_name,
        is_malicious = is_malicious,
        "Report {} finished: {}",
        report_id,
        if is_malicious { "malicious" } else { "clean" }
    );
}

pub fn log_quarantine(file_id: &str, file_name: &str, folder_id: &str) {
    warn!(
        entry_type = %LogEntryType::Quarantine,
        file_id = file_id,
        file_name = file_name,
        folder_id = folder_id,
        "{} is malicious, moved to quarantine",
        file_name
    );
}

/// A confirmed-malicious file is still in place. Always logged at error level.
pub fn log_quarantine_failure(file_id: &str, file_name: &str, details: &str) {
    error!(
        entry_type = %LogEntryType::QuarantineFailure,
        file_id = file_id,
        file_name = file_name,
        details = details,
        "MALICIOUS FILE NOT QUARANTINED: {}",
        file_name
    );
}

pub fn log_timeout(report_id: &str, file_id: &str, file_name: &str, polls: u32) {
    warn!(
        entry_type = %LogEntryType::Timeout,
        report_id = report_id,
        file_id = file_id,
        file_name = file_name,
        polls = polls,
        "Gave up waiting for report {} after {} poll(s)",
        report_id,
        polls
    );
}

pub fn log_summary(stats: &RunStats) {
    info!(
        entry_type = %LogEntryType::Summary,
        discovered = stats.discovered,
        submitted = stats.submitted,
        skipped = stats.skipped,
        errored = stats.errored,
        benign = stats.benign,
        quarantined = stats.quarantined,
        quarantine_failed = stats.quarantine_failed,
        timed_out = stats.timed_out,
        "Run complete: {}",
        stats
    );
}

/// Install the subscriber for this process
pub fn init_logger(config: &AppConfig) -> LoggerResult<Logger> {
    Logger::new(config)
}
