//! User-intent operations on project loops.
//!
//! The [`LoopController`] composes the registry and the supervisor into the
//! start/pause/resume/stop surface that external callers (CLI, dashboard
//! routes) drive. It owns the admission decision — start immediately when a
//! slot is free, queue otherwise — and keeps the flag-file signaling in step
//! with the state machine.

use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::project::LoopState;
use crate::registry::{ProjectRegistry, RegistryError};
use crate::supervisor::{CrashCallback, OutputCallback, ProcessSupervisor, SupervisorError};

/// Errors from loop control operations.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The loop is already starting, running, pausing, paused, or queued.
    #[error("Loop already {0}")]
    AlreadyActive(LoopState),

    /// The operation does not apply in the record's current state.
    #[error("Cannot {action}: loop is {state}")]
    InvalidState {
        action: &'static str,
        state: LoopState,
    },

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The subprocess was spawned and the loop is running.
    Started,
    /// Capacity was exhausted; the project waits at this 1-based position.
    Queued(usize),
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The project was waiting in the queue and has been removed.
    Cancelled,
    /// The record was in `Error` and has been cleared back to idle.
    Cleared,
    /// Nothing was running.
    NotRunning,
    /// The subprocess was stopped (gracefully or by escalation).
    Stopped,
}

/// Drives a project's loop lifecycle through registry and supervisor.
pub struct LoopController {
    registry: Arc<ProjectRegistry>,
    supervisor: Arc<ProcessSupervisor>,
}

impl LoopController {
    pub fn new(registry: Arc<ProjectRegistry>, supervisor: Arc<ProcessSupervisor>) -> Self {
        Self {
            registry,
            supervisor,
        }
    }

    pub fn registry(&self) -> &Arc<ProjectRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    /// Starts a project's loop, or queues it when the concurrency cap is
    /// reached.
    ///
    /// Fails with [`ControlError::AlreadyActive`] when the loop is already
    /// underway, and propagates a full queue as an error. A spawn failure
    /// leaves the record in `Error`.
    pub async fn start(
        &self,
        id: Uuid,
        on_output: Option<OutputCallback>,
        on_crash: Option<CrashCallback>,
    ) -> Result<StartOutcome, ControlError> {
        let record = self.registry.get(id).await?;

        {
            let rec = record.lock().await;
            if rec.is_active() {
                return Err(ControlError::AlreadyActive(rec.state()));
            }
        }

        if !self.registry.can_start_loop().await {
            let position = self.registry.enqueue(id).await?;
            info!(%id, position, "Concurrency cap reached, queued");
            return Ok(StartOutcome::Queued(position));
        }

        record.lock().await.set_starting();
        match self.supervisor.spawn(&record, on_output, on_crash).await {
            Ok(()) => Ok(StartOutcome::Started),
            Err(e) => {
                record.lock().await.set_error(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Starts the next queued project if a slot is free. Returns the id of
    /// the project that was started, or `None` when the queue is empty or
    /// capacity is still exhausted.
    pub async fn start_next(
        &self,
        on_output: Option<OutputCallback>,
        on_crash: Option<CrashCallback>,
    ) -> Result<Option<Uuid>, ControlError> {
        if !self.registry.can_start_loop().await {
            return Ok(None);
        }
        let Some(id) = self.registry.dequeue().await else {
            return Ok(None);
        };

        let record = self.registry.get(id).await?;
        record.lock().await.set_starting();
        match self.supervisor.spawn(&record, on_output, on_crash).await {
            Ok(()) => Ok(Some(id)),
            Err(e) => {
                record.lock().await.set_error(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Requests a pause. Takes effect once the subprocess acknowledges the
    /// flag; only valid while the loop is running.
    pub async fn pause(&self, id: Uuid) -> Result<(), ControlError> {
        let record = self.registry.get(id).await?;

        {
            let rec = record.lock().await;
            if !matches!(
                rec.state(),
                LoopState::Running | LoopState::PauseRequested
            ) {
                return Err(ControlError::InvalidState {
                    action: "pause",
                    state: rec.state(),
                });
            }
        }

        if self.supervisor.write_pause_flag(&record).await {
            record.lock().await.set_pause_requested();
        }
        Ok(())
    }

    /// Marks a requested pause as acknowledged by the subprocess.
    pub async fn acknowledge_pause(&self, id: Uuid) -> Result<(), ControlError> {
        let record = self.registry.get(id).await?;
        let mut rec = record.lock().await;
        if rec.state() != LoopState::PauseRequested {
            return Err(ControlError::InvalidState {
                action: "acknowledge pause",
                state: rec.state(),
            });
        }
        rec.set_paused();
        Ok(())
    }

    /// Resumes a paused loop by removing the pause flag.
    pub async fn resume(&self, id: Uuid) -> Result<(), ControlError> {
        let record = self.registry.get(id).await?;

        {
            let rec = record.lock().await;
            if !matches!(rec.state(), LoopState::Paused | LoopState::PauseRequested) {
                return Err(ControlError::InvalidState {
                    action: "resume",
                    state: rec.state(),
                });
            }
        }

        if self.supervisor.remove_pause_flag(&record).await {
            record.lock().await.set_resumed();
        }
        Ok(())
    }

    /// Stops a project's loop: cancels a queued project, clears an errored
    /// one, or runs the supervisor's stop escalation against a live
    /// subprocess.
    pub async fn stop(&self, id: Uuid) -> Result<StopOutcome, ControlError> {
        let record = self.registry.get(id).await?;
        let state = record.lock().await.state();

        if state == LoopState::Queued {
            self.registry.cancel_queue(id).await;
            return Ok(StopOutcome::Cancelled);
        }

        if state == LoopState::Error {
            record.lock().await.set_idle(false);
            return Ok(StopOutcome::Cleared);
        }

        if !state.is_active() {
            return Ok(StopOutcome::NotRunning);
        }

        if self.supervisor.stop(&record, false).await {
            Ok(StopOutcome::Stopped)
        } else {
            Ok(StopOutcome::NotRunning)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::project::LastStatus;
    use crate::supervisor::SupervisorConfig;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Fixture {
        _config_dir: TempDir,
        projects: TempDir,
        controller: LoopController,
    }

    fn make_fixture(max_concurrent: usize) -> Fixture {
        let config_dir = TempDir::new().unwrap();
        let config = ServerConfig {
            max_concurrent_loops: max_concurrent,
            ..ServerConfig::default()
        };
        let registry = Arc::new(ProjectRegistry::new(
            config_dir.path().to_path_buf(),
            &config,
        ));
        let supervisor = Arc::new(ProcessSupervisor::new(SupervisorConfig::default()));
        Fixture {
            _config_dir: config_dir,
            projects: TempDir::new().unwrap(),
            controller: LoopController::new(registry, supervisor),
        }
    }

    async fn register_project(fixture: &Fixture, name: &str) -> Uuid {
        let path: PathBuf = fixture.projects.path().join(name);
        std::fs::create_dir_all(&path).unwrap();
        fixture
            .controller
            .registry()
            .register(&path, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_unknown_project() {
        let fixture = make_fixture(2);
        let result = fixture.controller.start(Uuid::new_v4(), None, None).await;
        assert!(matches!(
            result,
            Err(ControlError::Registry(RegistryError::UnknownProject(_)))
        ));
    }

    #[tokio::test]
    async fn test_start_queues_when_capacity_exhausted() {
        let fixture = make_fixture(0);
        let id = register_project(&fixture, "queued").await;

        let outcome = fixture.controller.start(id, None, None).await.unwrap();
        assert_eq!(outcome, StartOutcome::Queued(1));

        let record = fixture.controller.registry().get(id).await.unwrap();
        assert_eq!(record.lock().await.state(), LoopState::Queued);
    }

    #[tokio::test]
    async fn test_start_rejects_active_loop() {
        let fixture = make_fixture(2);
        let id = register_project(&fixture, "active").await;

        let record = fixture.controller.registry().get(id).await.unwrap();
        record.lock().await.set_starting();

        let result = fixture.controller.start(id, None, None).await;
        assert!(matches!(
            result,
            Err(ControlError::AlreadyActive(LoopState::Starting))
        ));
    }

    #[tokio::test]
    async fn test_pause_requires_running_loop() {
        let fixture = make_fixture(2);
        let id = register_project(&fixture, "idle").await;

        let result = fixture.controller.pause(id).await;
        assert!(matches!(
            result,
            Err(ControlError::InvalidState {
                action: "pause",
                state: LoopState::Idle
            })
        ));
    }

    #[tokio::test]
    async fn test_pause_acknowledge_resume_cycle() {
        let fixture = make_fixture(2);
        let id = register_project(&fixture, "pausable").await;

        let record = fixture.controller.registry().get(id).await.unwrap();
        record.lock().await.set_resumed(); // put the record in Running

        fixture.controller.pause(id).await.unwrap();
        assert_eq!(record.lock().await.state(), LoopState::PauseRequested);
        let root = record.lock().await.root_path().to_path_buf();
        assert!(crate::flags::pause_flag(&root).exists());

        fixture.controller.acknowledge_pause(id).await.unwrap();
        assert_eq!(record.lock().await.state(), LoopState::Paused);

        fixture.controller.resume(id).await.unwrap();
        assert_eq!(record.lock().await.state(), LoopState::Running);
        assert!(!crate::flags::pause_flag(&root).exists());
    }

    #[tokio::test]
    async fn test_stop_cancels_queued_project() {
        let fixture = make_fixture(0);
        let id = register_project(&fixture, "queued").await;
        fixture.controller.start(id, None, None).await.unwrap();

        let outcome = fixture.controller.stop(id).await.unwrap();
        assert_eq!(outcome, StopOutcome::Cancelled);

        let record = fixture.controller.registry().get(id).await.unwrap();
        assert_eq!(record.lock().await.state(), LoopState::Idle);
    }

    #[tokio::test]
    async fn test_stop_clears_error_state() {
        let fixture = make_fixture(2);
        let id = register_project(&fixture, "errored").await;

        let record = fixture.controller.registry().get(id).await.unwrap();
        record.lock().await.set_error("Subprocess crashed with exit code 1");

        let outcome = fixture.controller.stop(id).await.unwrap();
        assert_eq!(outcome, StopOutcome::Cleared);

        let rec = record.lock().await;
        assert_eq!(rec.state(), LoopState::Idle);
        assert!(rec.error_message().is_none());
        assert_eq!(rec.last_status(), LastStatus::Failed);
    }

    #[tokio::test]
    async fn test_stop_idle_project_is_noop() {
        let fixture = make_fixture(2);
        let id = register_project(&fixture, "idle").await;

        let outcome = fixture.controller.stop(id).await.unwrap();
        assert_eq!(outcome, StopOutcome::NotRunning);
    }

    #[tokio::test]
    async fn test_start_next_empty_queue() {
        let fixture = make_fixture(2);
        let started = fixture.controller.start_next(None, None).await.unwrap();
        assert!(started.is_none());
    }

    #[tokio::test]
    async fn test_start_next_respects_capacity() {
        let fixture = make_fixture(0);
        let id = register_project(&fixture, "waiting").await;
        fixture.controller.start(id, None, None).await.unwrap();

        // Capacity still exhausted, the queue must not drain
        let started = fixture.controller.start_next(None, None).await.unwrap();
        assert!(started.is_none());
        assert_eq!(
            fixture.controller.registry().queue_position(id).await,
            Some(1)
        );
    }
}
