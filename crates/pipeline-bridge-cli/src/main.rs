//! Pipeline Bridge CLI - run compiled pipeline modules from the command line
//!
//! Thin front end over `pipeline-bridge-core`: every command builds one
//! request, hands it to the bridge and prints the response envelope as JSON.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use pipeline_bridge_core::{BridgeConfig, Domain};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod commands;

use commands::bindings::BindingsCommand;
use commands::read::ReadCommand;
use commands::run::RunCommand;

#[derive(Parser)]
#[command(
    name = "pipeline-bridge",
    version,
    about = "Run compiled image and mesh pipelines",
    after_help = "EXAMPLES:\n  \
                  # Run a request document (or '-' for stdin)\n  \
                  pipeline-bridge run request.json\n\n  \
                  # Read an image, letting the bridge pick the IO backend\n  \
                  pipeline-bridge read-image scan.nii.gz\n  \
                  pipeline-bridge read-mesh cow.vtk\n\n  \
                  # Show which backend handles which extension\n  \
                  pipeline-bridge bindings image"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// YAML configuration file (PIPELINE_BRIDGE_* variables still apply on top)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Handle a JSON request document
    Run(RunCommand),

    /// Read an image file through the format resolver
    ReadImage(ReadCommand),

    /// Read a mesh file through the format resolver
    ReadMesh(ReadCommand),

    /// List IO backends and their mime type / extension bindings
    Bindings(BindingsCommand),
}

fn load_config(path: Option<&PathBuf>) -> Result<BridgeConfig> {
    match path {
        Some(path) => Ok(BridgeConfig::from_yaml(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?
            .with_env_overrides()),
        None => Ok(BridgeConfig::from_env()),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_level = match &cli.command {
        Commands::Bindings(_) => Level::WARN,
        _ if cli.verbose => Level::DEBUG,
        _ => Level::INFO,
    };

    // Logs go to stderr; stdout carries the response
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(log_level.to_string())),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match cli.command {
        Commands::Run(cmd) => cmd.execute(load_config(cli.config.as_ref())?).await,
        Commands::ReadImage(cmd) => {
            cmd.execute(Domain::Image, load_config(cli.config.as_ref())?)
                .await
        }
        Commands::ReadMesh(cmd) => {
            cmd.execute(Domain::Mesh, load_config(cli.config.as_ref())?)
                .await
        }
        Commands::Bindings(cmd) => cmd.execute().map(|()| ExitCode::SUCCESS),
    }
}
