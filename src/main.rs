use std::env::consts::{ARCH, FAMILY, OS};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::trace;

use crate::program::Program;
use crate::sentinel::{RunOptions, init_config, init_logger};

mod program;
mod sentinel;

#[derive(Parser, Debug)]
#[command(
    name = "drive_sentinel",
    version,
    about = "Scans new Drive files for malware and quarantines the malicious ones"
)]
struct Cli {
    /// Directory holding config.toml (created with defaults if missing)
    #[arg(long, env = "DRIVE_SENTINEL_CONFIG_DIR", default_value = ".")]
    config_dir: PathBuf,

    /// Override `pools.max_parallelism`; 1 runs sequentially
    #[arg(long)]
    parallelism: Option<usize>,

    /// Ignore the stored watermark and scan every file
    #[arg(long)]
    full_scan: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("drive_sentinel: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = init_config(&cli.config_dir).context("failed to load configuration")?;

    if let Some(parallelism) = cli.parallelism {
        let mut app_config = config.get_app_config();
        app_config.pools.max_parallelism = parallelism;
        config
            .override_app_config(app_config)
            .context("invalid --parallelism")?;
    }

    // Held until the run is over so buffered file output is flushed
    let _logger =
        init_logger(&config.get_app_config()).context("failed to initialize logging")?;
    log_system_information();

    let program = Program::new(
        config,
        RunOptions {
            full_scan: cli.full_scan,
        },
    );
    program.run().await?;
    Ok(())
}

/// Logs important information about the system being used.
fn log_system_information() {
    trace!("Printing system information out into log for debug purposes...");
    trace!("ARCH:           \"{}\"", ARCH);
    trace!("FAMILY:         \"{}\"", FAMILY);
    trace!("OS:             \"{}\"", OS);
}
