mod cmd;
mod demo;
mod output;

use clap::{Parser, Subcommand};
use modlink_runtime::StartupError;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "modlink",
    about = "Module-side runtime for host/module IPC: validate manifests, run the demo module",
    version,
    propagate_version = true
)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that a manifest can be driven by this runtime
    Validate {
        /// Path to the manifest (.json, .yaml or .yml)
        manifest: PathBuf,
    },

    /// Run the bundled counter module over stdin/stdout
    Demo {
        /// Manifest describing the module
        #[arg(long, env = "MODULE_MANIFEST")]
        manifest: PathBuf,

        /// Connection id assigned by the host
        #[arg(long, env = "CONNECTION_ID")]
        connection_id: String,

        /// Token the host expects back during registration
        #[arg(long, env = "VERIFICATION_TOKEN", hide_env_values = true)]
        verification_token: String,
    },

    /// Print the protocol version and runtime type this build speaks
    Info,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Demo { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    // stdout carries the ipc channel in demo mode
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .with_env_var("MODLINK_LOG")
                .from_env_lossy(),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Validate { manifest } => cmd::validate::run(&manifest, cli.json),
        Commands::Demo {
            manifest,
            connection_id,
            verification_token,
        } => cmd::demo::run(manifest, connection_id, verification_token),
        Commands::Info => cmd::info::run(cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        let code = e.downcast_ref::<StartupError>().map_or(1, StartupError::exit_code);
        std::process::exit(code);
    }
}
