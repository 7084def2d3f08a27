//! Foreground loop execution.
//!
//! `bmad-dash run <path>` registers the project if needed, starts its loop
//! through the controller, streams subprocess output to stdout, and turns
//! Ctrl+C into the graceful stop escalation.

use anyhow::{Result, bail};
use bmad_dash_core::{
    CrashCallback, LastStatus, LoopController, LoopState, OutputCallback, ProcessSupervisor,
    ProjectRegistry, StartOutcome, SupervisorConfig,
};
use clap::Parser;
use futures::future::BoxFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Arguments for the run subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the project to run
    pub path: PathBuf,

    /// Display name used when the project is not yet registered
    #[arg(long)]
    pub name: Option<String>,

    /// Override the supervised executable (default: bmad-assist)
    #[arg(long)]
    pub binary: Option<String>,
}

pub async fn execute(registry: Arc<ProjectRegistry>, args: RunArgs) -> Result<()> {
    // Clear any state a previous control-plane crash left behind
    for id in registry.reconcile().await {
        warn!(%id, "Registered project path is missing");
    }

    let id = registry.register(&args.path, args.name.clone()).await?;

    let mut supervisor_config = SupervisorConfig {
        subprocess_timeout: registry.subprocess_timeout(),
        ..SupervisorConfig::default()
    };
    if let Some(binary) = args.binary {
        supervisor_config.binary = binary;
    }

    let supervisor = Arc::new(ProcessSupervisor::new(supervisor_config));
    let controller = LoopController::new(Arc::clone(&registry), Arc::clone(&supervisor));

    let on_output: OutputCallback = Arc::new(|line: String| -> BoxFuture<'static, ()> {
        Box::pin(async move {
            println!("{line}");
        })
    });
    let on_crash: CrashCallback = Arc::new(|message: String| -> BoxFuture<'static, ()> {
        Box::pin(async move {
            eprintln!("error: {message}");
        })
    });

    match controller.start(id, Some(on_output), Some(on_crash)).await? {
        StartOutcome::Started => {}
        StartOutcome::Queued(position) => {
            // A single foreground run has nothing to wait behind; undo the
            // enqueue and report.
            controller.stop(id).await?;
            bail!("Concurrency cap reached, project was queued at position {position}");
        }
    }

    let record = registry.get(id).await?;
    eprintln!(
        "Loop running for {} (Ctrl+C stops it gracefully)",
        args.path.display()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Stopping loop...");
                controller.stop(id).await?;
                break;
            }
            () = tokio::time::sleep(Duration::from_millis(500)) => {
                if !record.lock().await.is_active() {
                    break;
                }
            }
        }
    }

    supervisor.shutdown().await;

    let (state, status, error) = {
        let rec = record.lock().await;
        (
            rec.state(),
            rec.last_status(),
            rec.error_message().map(str::to_string),
        )
    };
    if state == LoopState::Error {
        bail!(error.unwrap_or_else(|| "loop failed".to_string()));
    }
    if status == LastStatus::Failed {
        bail!("Loop ended with a failure status");
    }
    Ok(())
}
