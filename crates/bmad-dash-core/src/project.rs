//! Per-project lifecycle state.
//!
//! A [`ProjectRecord`] holds everything the control plane knows about one
//! registered project: its identity, the loop state machine, the attached
//! subprocess handle, a bounded ring buffer of recent output lines, and
//! timing/position markers reported by the loop itself.
//!
//! The registry owns the only copy of each record; the supervisor mutates it
//! through these methods while the subprocess runs. Every transition method
//! stamps `last_seen` and maintains the field invariants (`error_message` is
//! set iff the state is `Error`, `queue_position` iff `Queued`).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::process::Child;
use tracing::{error, info};
use uuid::Uuid;

/// State machine for a project's loop lifecycle.
///
/// Valid transitions:
///
/// | From            | To              | Trigger                              |
/// |-----------------|-----------------|--------------------------------------|
/// | Idle            | Starting        | start requested, capacity available  |
/// | Idle            | Queued          | start requested, capacity exhausted  |
/// | Starting        | Running         | subprocess confirmed alive           |
/// | Starting        | Error           | spawn failed                         |
/// | Running         | PauseRequested  | pause requested                      |
/// | Running         | Error           | subprocess crash detected            |
/// | Running         | Idle            | clean exit or stop requested         |
/// | PauseRequested  | Paused          | pause acknowledged                   |
/// | Paused          | Running         | resume requested                     |
/// | Paused          | Idle            | stop requested                       |
/// | Queued          | Starting        | slot freed, dequeued                 |
/// | Queued          | Idle            | cancel requested                     |
/// | Error           | Idle            | stop/clear requested                 |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Starting,
    Running,
    PauseRequested,
    Paused,
    Queued,
    Error,
}

impl LoopState {
    /// True for every state that counts as an active loop: anything that is
    /// starting, running, pausing, paused, or waiting for a slot.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            LoopState::Starting
                | LoopState::Running
                | LoopState::PauseRequested
                | LoopState::Paused
                | LoopState::Queued
        )
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopState::Idle => "idle",
            LoopState::Starting => "starting",
            LoopState::Running => "running",
            LoopState::PauseRequested => "pause_requested",
            LoopState::Paused => "paused",
            LoopState::Queued => "queued",
            LoopState::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Last terminal outcome of a project's loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LastStatus {
    #[default]
    Idle,
    Success,
    Failed,
}

impl fmt::Display for LastStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LastStatus::Idle => "IDLE",
            LastStatus::Success => "SUCCESS",
            LastStatus::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// State for one registered project.
#[derive(Debug)]
pub struct ProjectRecord {
    /// Stable id, generated once at first registration.
    id: Uuid,

    /// Canonical absolute path to the project directory.
    root_path: PathBuf,

    /// User-facing label, defaults to the path's base name.
    display_name: String,

    /// Attached subprocess, present only while one is running.
    process: Option<Child>,

    /// Current loop state.
    state: LoopState,

    /// Ring buffer capacity; oldest lines are evicted beyond this.
    log_capacity: usize,

    /// Recent output lines, insertion-ordered.
    log_buffer: VecDeque<String>,

    /// When the current execution phase began; absent when idle.
    phase_start_time: Option<DateTime<Utc>>,

    /// Last state-affecting activity.
    last_seen: DateTime<Utc>,

    /// Last terminal outcome.
    last_status: LastStatus,

    /// Position markers reported by the subprocess; opaque here.
    current_epic: Option<String>,
    current_story: Option<String>,
    current_phase: Option<String>,

    /// Set only while `state == Error`.
    error_message: Option<String>,

    /// 1-based queue position, set only while `state == Queued`.
    queue_position: Option<usize>,
}

impl ProjectRecord {
    /// Creates a new record with a freshly generated id.
    ///
    /// `root_path` is expected to be canonical; the registry resolves and
    /// validates it before construction. The display name defaults to the
    /// path's final component.
    pub fn new(root_path: PathBuf, display_name: Option<String>, log_capacity: usize) -> Self {
        let display_name = display_name.unwrap_or_else(|| {
            root_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| root_path.to_string_lossy().into_owned())
        });

        Self {
            id: Uuid::new_v4(),
            root_path,
            display_name,
            process: None,
            state: LoopState::Idle,
            log_capacity,
            log_buffer: VecDeque::with_capacity(log_capacity),
            phase_start_time: None,
            last_seen: Utc::now(),
            last_status: LastStatus::Idle,
            current_epic: None,
            current_story: None,
            current_phase: None,
            error_message: None,
            queue_position: None,
        }
    }

    /// Rebuilds a record from persisted state. The loop state always starts
    /// at `Idle`; a restart invalidates any prior running/queued claim.
    pub fn restore(
        id: Uuid,
        root_path: PathBuf,
        display_name: String,
        last_seen: DateTime<Utc>,
        last_status: LastStatus,
        log_capacity: usize,
    ) -> Self {
        Self {
            id,
            root_path,
            display_name,
            process: None,
            state: LoopState::Idle,
            log_capacity,
            log_buffer: VecDeque::with_capacity(log_capacity),
            phase_start_time: None,
            last_seen,
            last_status,
            current_epic: None,
            current_story: None,
            current_phase: None,
            error_message: None,
            queue_position: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    pub fn last_status(&self) -> LastStatus {
        self.last_status
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn queue_position(&self) -> Option<usize> {
        self.queue_position
    }

    pub fn has_process(&self) -> bool {
        self.process.is_some()
    }

    /// Mutable access to the attached subprocess, for liveness polling.
    pub fn process_mut(&mut self) -> Option<&mut Child> {
        self.process.as_mut()
    }

    /// OS pid of the attached subprocess, if it is still attached and
    /// has not been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.id())
    }

    /// Appends a line to the ring buffer, evicting the oldest when full.
    pub fn add_log(&mut self, line: impl Into<String>) {
        if self.log_capacity == 0 {
            return;
        }
        if self.log_buffer.len() == self.log_capacity {
            self.log_buffer.pop_front();
        }
        self.log_buffer.push_back(line.into());
        self.last_seen = Utc::now();
    }

    /// Returns the most recent `count` lines oldest-first, or all lines if
    /// `count` is `None`.
    pub fn logs(&self, count: Option<usize>) -> Vec<String> {
        match count {
            None => self.log_buffer.iter().cloned().collect(),
            Some(n) => {
                let skip = self.log_buffer.len().saturating_sub(n);
                self.log_buffer.iter().skip(skip).cloned().collect()
            }
        }
    }

    /// Clears the log buffer.
    pub fn clear_logs(&mut self) {
        self.log_buffer.clear();
    }

    /// Transition to `Starting` ahead of a spawn attempt.
    ///
    /// Clears any stale error message or queue position so the invariants
    /// hold when starting from `Error` or `Queued`.
    pub fn set_starting(&mut self) {
        self.state = LoopState::Starting;
        self.error_message = None;
        self.queue_position = None;
        self.last_seen = Utc::now();
    }

    /// Transition to `Running` with an attached subprocess.
    pub fn set_running(&mut self, process: Child) {
        self.process = Some(process);
        self.state = LoopState::Running;
        self.phase_start_time = Some(Utc::now());
        self.last_seen = Utc::now();
        self.error_message = None;
        self.queue_position = None;
        info!(project = %self.display_name, "loop running");
    }

    /// Transition to `PauseRequested`; the pause takes effect once the
    /// subprocess acknowledges the flag.
    pub fn set_pause_requested(&mut self) {
        self.state = LoopState::PauseRequested;
        self.last_seen = Utc::now();
    }

    /// Transition to `Paused`. Position markers are left untouched.
    pub fn set_paused(&mut self) {
        self.state = LoopState::Paused;
        self.last_seen = Utc::now();
        info!(project = %self.display_name, "loop paused");
    }

    /// Transition back to `Running` after a resume. The subprocess stays
    /// attached throughout a pause, so no handle changes hands.
    pub fn set_resumed(&mut self) {
        self.state = LoopState::Running;
        self.last_seen = Utc::now();
        info!(project = %self.display_name, "loop resumed");
    }

    /// Transition to `Error`, detaching the subprocess handle.
    pub fn set_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        error!(project = %self.display_name, error = %message, "loop error");
        self.state = LoopState::Error;
        self.error_message = Some(message);
        self.process = None;
        self.last_seen = Utc::now();
        self.last_status = LastStatus::Failed;
    }

    /// Transition to `Idle`, clearing the subprocess handle, phase timing,
    /// position markers, error message, and queue position.
    pub fn set_idle(&mut self, success: bool) {
        self.state = LoopState::Idle;
        self.process = None;
        self.phase_start_time = None;
        self.current_epic = None;
        self.current_story = None;
        self.current_phase = None;
        self.error_message = None;
        self.queue_position = None;
        self.last_seen = Utc::now();
        self.last_status = if success {
            LastStatus::Success
        } else {
            LastStatus::Failed
        };
        info!(project = %self.display_name, status = %self.last_status, "loop idle");
    }

    /// Transition to `Queued` at the given 1-based position.
    pub fn set_queued(&mut self, position: usize) {
        self.state = LoopState::Queued;
        self.queue_position = Some(position);
        self.last_seen = Utc::now();
        info!(project = %self.display_name, position, "loop queued");
    }

    /// Reassigns the 1-based queue position after the queue shifts.
    /// No-op unless the record is currently queued.
    pub fn update_queue_position(&mut self, position: usize) {
        if self.state == LoopState::Queued {
            self.queue_position = Some(position);
        }
    }

    /// Updates the position markers reported by the subprocess. A phase
    /// change restamps `phase_start_time` (phase boundary).
    pub fn update_position(
        &mut self,
        epic: Option<String>,
        story: Option<String>,
        phase: Option<String>,
    ) {
        if let Some(epic) = epic {
            self.current_epic = Some(epic);
        }
        if let Some(story) = story {
            self.current_story = Some(story);
        }
        if let Some(phase) = phase {
            self.current_phase = Some(phase);
            self.phase_start_time = Some(Utc::now());
        }
        self.last_seen = Utc::now();
    }

    /// True iff the record has an active loop (starting, running, pausing,
    /// paused, or queued). Gates unregistration and slot counting.
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Elapsed time in the current phase, or `None` when not in a phase.
    pub fn phase_duration(&self) -> Option<Duration> {
        self.phase_start_time.map(|start| Utc::now() - start)
    }

    /// Read-only summary view for external consumers.
    pub fn summary(&self) -> ProjectSummary {
        ProjectSummary {
            id: self.id,
            path: self.root_path.clone(),
            display_name: self.display_name.clone(),
            state: self.state,
            last_seen: self.last_seen,
            last_status: self.last_status,
            current_epic: self.current_epic.clone(),
            current_story: self.current_story.clone(),
            current_phase: self.current_phase.clone(),
            phase_duration_seconds: self
                .phase_duration()
                .map(|d| d.num_milliseconds() as f64 / 1000.0),
            error_message: self.error_message.clone(),
            queue_position: self.queue_position,
        }
    }
}

/// Read-only projection of a [`ProjectRecord`] for external consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub id: Uuid,
    pub path: PathBuf,
    pub display_name: String,
    pub state: LoopState,
    pub last_seen: DateTime<Utc>,
    pub last_status: LastStatus,
    pub current_epic: Option<String>,
    pub current_story: Option<String>,
    pub current_phase: Option<String>,
    pub phase_duration_seconds: Option<f64>,
    pub error_message: Option<String>,
    pub queue_position: Option<usize>,
}
