//! # bmad-dash-cli
//!
//! Binary entry point for the bmad-dash control plane.
//!
//! This crate provides:
//! - CLI argument parsing using `clap`
//! - Project registration and discovery (`register`, `unregister`, `scan`)
//! - Registry inspection via `bmad-dash list`
//! - Startup reconciliation via `bmad-dash reconcile`
//! - Foreground loop execution via `bmad-dash run`

mod run;

use anyhow::{Context, Result};
use bmad_dash_core::{ProjectRegistry, ServerConfig, default_config_dir};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    name = "bmad-dash",
    version,
    about = "Multi-project control plane for bmad-assist loops"
)]
struct Cli {
    /// Config directory (defaults to ~/.config/bmad-dash)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a project directory
    Register {
        /// Path to the project
        path: PathBuf,

        /// Display name (defaults to the directory name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Remove a project from the registry
    Unregister {
        /// Project id
        id: Uuid,
    },

    /// List registered projects
    List {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Discover and register projects under a directory
    Scan {
        /// Directory whose immediate subdirectories are scanned
        dir: PathBuf,
    },

    /// Reconcile registry state against the filesystem
    Reconcile,

    /// Run a project's loop in the foreground
    Run(run::RunArgs),
}

/// Opens the registry rooted at the configured directory.
fn open_registry(config_dir: Option<PathBuf>) -> Result<Arc<ProjectRegistry>> {
    let dir = config_dir.unwrap_or_else(default_config_dir);
    let config = ServerConfig::load(&dir)
        .with_context(|| format!("Failed to load server config from {}", dir.display()))?;
    Ok(Arc::new(ProjectRegistry::new(dir, &config)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let registry = open_registry(cli.config_dir)?;

    match cli.command {
        Commands::Register { path, name } => {
            let id = registry.register(&path, name).await?;
            println!("{id}");
            Ok(())
        }
        Commands::Unregister { id } => {
            registry.unregister(id).await?;
            println!("Unregistered {id}");
            Ok(())
        }
        Commands::List { json } => list_command(&registry, json).await,
        Commands::Scan { dir } => {
            let discovered = registry.scan_directory(&dir).await;
            if discovered.is_empty() {
                println!("No new projects found.");
            } else {
                for id in discovered {
                    println!("{id}");
                }
            }
            Ok(())
        }
        Commands::Reconcile => {
            let broken = registry.reconcile().await;
            if broken.is_empty() {
                println!("Registry is clean.");
            } else {
                for id in broken {
                    println!("broken: {id}");
                }
            }
            Ok(())
        }
        Commands::Run(args) => run::execute(registry, args).await,
    }
}

/// Prints registered projects as a table or JSON.
async fn list_command(registry: &ProjectRegistry, json: bool) -> Result<()> {
    let summaries = registry.list_all().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    if summaries.is_empty() {
        println!("No projects registered.");
        return Ok(());
    }

    println!(
        "{:<36} {:<24} {:<16} {:<8} PATH",
        "ID", "NAME", "STATE", "LAST"
    );
    println!("{}", "-".repeat(100));
    for summary in summaries {
        let state = match (summary.queue_position, &summary.error_message) {
            (Some(pos), _) => format!("{} (#{pos})", summary.state),
            (None, Some(_)) => format!("{} (!)", summary.state),
            (None, None) => summary.state.to_string(),
        };
        println!(
            "{:<36} {:<24} {:<16} {:<8} {}",
            summary.id.to_string(),
            summary.display_name,
            state,
            summary.last_status.to_string(),
            summary.path.display()
        );
    }
    Ok(())
}
