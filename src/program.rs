use std::sync::Arc;

use tracing::{error, info, trace};

use crate::sentinel::{
    ConfigManager, DetectionClient, DriveClient, DriveCredentials, DriveResult, PipelineResult,
    RunOptions, RunStateStore, RunStats, run_once,
};

/// The name of the cargo package.
const NAME: &str = env!("CARGO_PKG_NAME");

/// The version of the cargo package.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The authors who created the package.
const AUTHORS: &str = env!("CARGO_PKG_AUTHORS");

/// Wires the real Drive and detection clients into one scan run.
pub(crate) struct Program {
    config: Arc<ConfigManager>,
    options: RunOptions,
}

impl Program {
    pub(crate) fn new(config: Arc<ConfigManager>, options: RunOptions) -> Self {
        Self { config, options }
    }

    /// Runs one scan. Errors returned here are fatal; per-file failures are in the stats.
    pub(crate) async fn run(&self) -> PipelineResult<RunStats> {
        trace!("Starting drive sentinel...");
        trace!("Program Name: {}", NAME);
        trace!("Program Version: {}", VERSION);
        trace!("Program Authors: {}", AUTHORS);
        trace!("Configuration Directory: {:?}", self.config.config_dir());

        let config = self.config.get_app_config();

        let credentials = DriveCredentials::load(&config.drive.token_file).map_err(|e| {
            error!("Unable to load Drive credentials: {}", e);
            e
        })?;
        let credentials = Arc::new(credentials);

        let detection = Arc::new(DetectionClient::new(&config.detection).map_err(|e| {
            error!("Unable to create detection client: {}", e);
            e
        })?);
        trace!("Detection API Key: {}", "*".repeat(config.detection.api_key.len()));

        let parallelism = config.pools.max_parallelism;
        let handles = (0..parallelism)
            .map(|_| DriveClient::new(&config.drive, credentials.clone()))
            .collect::<DriveResult<Vec<_>>>()?;
        info!(
            "Starting run with parallelism {} ({})",
            parallelism,
            if parallelism == 1 { "sequential" } else { "worker pool" }
        );

        let state_store = RunStateStore::new(&config.paths.state_file);
        trace!("Run State File: {:?}", state_store.path());
        run_once(&config, handles, detection, &state_store, self.options).await
    }
}
