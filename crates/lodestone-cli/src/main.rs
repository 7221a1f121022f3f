//! Lodestone command-line interface.
//!
//! Run reconstructions from TOML configuration files:
//! ```sh
//! lodestone simulate demo --patches 4
//! lodestone run demo/job.toml
//! lodestone validate demo/job.toml
//! lodestone info demo/measurement.json
//! ```

mod config;
mod runner;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "lodestone")]
#[command(about = "Lodestone: system-matrix reconstruction for magnetic particle imaging")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a reconstruction from a TOML configuration file.
    Run {
        /// Path to the job configuration file.
        config: PathBuf,
        /// Output directory (overrides config file setting).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate a configuration file and its inputs without solving.
    Validate {
        /// Path to the job configuration file.
        config: PathBuf,
    },
    /// Write a synthetic calibration, measurement and job file.
    Simulate {
        /// Target directory.
        dir: PathBuf,
        /// Number of patches in the measurement.
        #[arg(long, default_value_t = 1)]
        patches: usize,
        /// Number of frames per patch.
        #[arg(long, default_value_t = 4)]
        frames: usize,
    },
    /// Display the metadata of a dataset file.
    Info {
        /// Path to a calibration or measurement file.
        file: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, output } => {
            println!("Lodestone Reconstruction");
            println!("========================");
            let job = config::load_config(&config)?;
            println!("Configuration: {}", config.display());

            let result = runner::run_reconstruction(&job)?;

            let out_dir = output.unwrap_or_else(|| job.output.directory.clone());
            runner::write_output(&result, &out_dir, job.output.composite)?;

            println!("Reconstruction complete.");
            Ok(())
        }
        Commands::Validate { config } => {
            let job = config::load_config(&config)?;
            runner::validate(&job)?;
            println!("Configuration is valid: {}", config.display());
            Ok(())
        }
        Commands::Simulate { dir, patches, frames } => runner::simulate(&dir, patches, frames),
        Commands::Info { file } => {
            println!("{}:", file.display());
            runner::info(&file)
        }
    }
}
