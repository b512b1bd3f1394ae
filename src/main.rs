//! apkforge - manifest-driven Android packaging
//!
//! Command-line entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use apkforge::commands::{BuildCommand, CheckCommand, InspectCommand};
use apkforge_core::{Abi, BuildError};

#[derive(Parser)]
#[command(name = "apkforge")]
#[command(author, version, about = "Build Android packages from an application manifest")]
struct Cli {
    /// Pipeline configuration file
    #[arg(long, global = true, env = "APKFORGE_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an .apk or .aab
    Build {
        /// Application manifest
        manifest: PathBuf,
        /// Target ABI; repeat for several (default: the manifest's list)
        #[arg(long = "abi", value_name = "ABI")]
        abis: Vec<Abi>,
        /// Release variant (default: debug)
        #[arg(long)]
        release: bool,
        /// Fix embedded timestamps for byte-identical output
        #[arg(long)]
        reproducible: bool,
        /// Parallel fetches and ABI builds
        #[arg(short, long)]
        jobs: Option<usize>,
    },
    /// Validate a manifest without building
    Check {
        /// Application manifest
        manifest: PathBuf,
    },
    /// Show what a built artifact contains
    Inspect {
        /// .apk or .aab file
        artifact: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            let code = e
                .downcast_ref::<BuildError>()
                .map(BuildError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Build {
            manifest,
            abis,
            release,
            reproducible,
            jobs,
        } => {
            BuildCommand {
                manifest,
                config: cli.config,
                release,
                abis,
                reproducible,
                jobs,
            }
            .execute()
            .await?;
        }
        Commands::Check { manifest } => {
            CheckCommand {
                manifest,
                config: cli.config,
            }
            .execute()
            .await?;
        }
        Commands::Inspect { artifact } => InspectCommand { artifact }.execute()?,
    }
    Ok(())
}
