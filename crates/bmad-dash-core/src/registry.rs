//! Project registry: ownership, persistence, and admission control.
//!
//! The registry holds the single authoritative map of all registered
//! projects, persists it to `projects.yaml` in the config directory, and
//! arbitrates access to the bounded pool of execution slots through a FIFO
//! admission queue.
//!
//! # Design
//!
//! - **Shared records**: each project lives in an `Arc<Mutex<ProjectRecord>>`
//!   handed to the supervisor's monitoring tasks. Map structure (inserts,
//!   removals, the queue) is guarded by one registry-level lock; record
//!   fields are only ever touched under the record's own lock. Lock order is
//!   always registry, then record.
//! - **YAML persistence**: the full set of records is rewritten on every
//!   mutating call. Persistence failures are logged, never raised; the
//!   in-memory state stays authoritative for the lifetime of the process.
//! - **Reconciliation**: a startup pass resets state that a control-plane
//!   restart has invalidated and removes stray flag files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::flags;
use crate::project::{LastStatus, LoopState, ProjectRecord, ProjectSummary};

/// A project record shared between the registry and the supervisor's
/// monitoring tasks.
pub type SharedRecord = Arc<Mutex<ProjectRecord>>;

/// Name of the persisted registry file inside the config directory.
pub const PROJECTS_FILE: &str = "projects.yaml";

/// Errors that can occur during registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No record with the given id.
    #[error("Project not found: {0}")]
    UnknownProject(Uuid),

    /// The path to register does not exist.
    #[error("Project path does not exist: {0}")]
    PathNotFound(PathBuf),

    /// The record has an active loop and cannot be removed.
    #[error("Cannot unregister {0}: loop is active")]
    LoopActive(String),

    /// The admission queue is at capacity.
    #[error("Queue is full (max {0})")]
    QueueFull(usize),
}

/// On-disk shape of one `projects.yaml` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedProject {
    id: Uuid,
    path: PathBuf,
    display_name: String,
    last_seen: DateTime<Utc>,
    #[serde(default)]
    last_status: LastStatus,
}

/// On-disk shape of `projects.yaml`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    projects: Vec<PersistedProject>,
}

/// Map and queue state guarded by the registry-level lock.
struct RegistryInner {
    records: HashMap<Uuid, SharedRecord>,
    queue: VecDeque<Uuid>,
}

/// Owns the collection of all registered projects.
pub struct ProjectRegistry {
    config_dir: PathBuf,
    max_concurrent_loops: usize,
    queue_max_size: usize,
    subprocess_timeout: Duration,
    log_buffer_size: usize,
    inner: Mutex<RegistryInner>,
}

impl ProjectRegistry {
    /// Creates a registry rooted at `config_dir`, loading any previously
    /// persisted projects. The directory is created if missing.
    pub fn new(config_dir: PathBuf, config: &ServerConfig) -> Self {
        if let Err(e) = fs::create_dir_all(&config_dir) {
            warn!(dir = %config_dir.display(), error = %e, "Failed to create config directory");
        }

        let records = load_projects(&config_dir, config.log_buffer_size);
        info!(count = records.len(), "Loaded projects from registry");

        Self {
            config_dir,
            max_concurrent_loops: config.max_concurrent_loops,
            queue_max_size: config.queue_max_size,
            subprocess_timeout: Duration::from_secs(config.subprocess_timeout_seconds),
            log_buffer_size: config.log_buffer_size,
            inner: Mutex::new(RegistryInner {
                records,
                queue: VecDeque::new(),
            }),
        }
    }

    /// Graceful-stop wait configured for this server.
    pub fn subprocess_timeout(&self) -> Duration {
        self.subprocess_timeout
    }

    /// Per-project log ring buffer capacity.
    pub fn log_buffer_size(&self) -> usize {
        self.log_buffer_size
    }

    /// Maximum simultaneously running loops.
    pub fn max_concurrent_loops(&self) -> usize {
        self.max_concurrent_loops
    }

    /// Registers a project, or returns the existing id when the canonical
    /// path is already registered (dedup by path, not an error).
    pub async fn register(
        &self,
        path: &Path,
        display_name: Option<String>,
    ) -> Result<Uuid, RegistryError> {
        // Canonicalization doubles as the existence check
        let canonical = path
            .canonicalize()
            .map_err(|_| RegistryError::PathNotFound(path.to_path_buf()))?;

        let mut inner = self.inner.lock().await;

        for record in inner.records.values() {
            let record = record.lock().await;
            if record.root_path() == canonical {
                info!(id = %record.id(), "Project already registered");
                return Ok(record.id());
            }
        }

        let record = ProjectRecord::new(canonical.clone(), display_name, self.log_buffer_size);
        let id = record.id();
        info!(
            id = %id,
            project = %record.display_name(),
            path = %canonical.display(),
            "Registered project"
        );

        inner.records.insert(id, Arc::new(Mutex::new(record)));
        self.persist_locked(&inner).await;
        Ok(id)
    }

    /// Removes a project. Fails if unknown or while its loop is active.
    pub async fn unregister(&self, id: Uuid) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().await;

        let record = inner
            .records
            .get(&id)
            .ok_or(RegistryError::UnknownProject(id))?;

        {
            let record = record.lock().await;
            if record.is_active() {
                return Err(RegistryError::LoopActive(record.display_name().to_string()));
            }
        }

        inner.records.remove(&id);
        self.persist_locked(&inner).await;
        info!(%id, "Unregistered project");
        Ok(())
    }

    /// Looks up a record by id, failing loudly on a miss.
    pub async fn get(&self, id: Uuid) -> Result<SharedRecord, RegistryError> {
        let inner = self.inner.lock().await;
        inner
            .records
            .get(&id)
            .cloned()
            .ok_or(RegistryError::UnknownProject(id))
    }

    /// Looks up a record by path. Returns `None` on a miss or when the path
    /// cannot be canonicalized; used for dedup checks.
    pub async fn get_by_path(&self, path: &Path) -> Option<SharedRecord> {
        let canonical = path.canonicalize().ok()?;
        let inner = self.inner.lock().await;
        for record in inner.records.values() {
            if record.lock().await.root_path() == canonical {
                return Some(Arc::clone(record));
            }
        }
        None
    }

    /// Read-only summaries of all registered projects, sorted by display
    /// name for stable output.
    pub async fn list_all(&self) -> Vec<ProjectSummary> {
        let inner = self.inner.lock().await;
        let mut summaries = Vec::with_capacity(inner.records.len());
        for record in inner.records.values() {
            summaries.push(record.lock().await.summary());
        }
        summaries.sort_by(|a, b| a.display_name.cmp(&b.display_name).then(a.id.cmp(&b.id)));
        summaries
    }

    /// Reconciles in-memory state against on-disk reality.
    ///
    /// Run at startup (and optionally periodically):
    /// - records whose root no longer exists go to `Error` and are reported;
    /// - stray `stop.flag`/`pause.flag` left by an ungraceful control-plane
    ///   shutdown are deleted — no supervisor is alive to watch them;
    /// - any state other than `Idle` or `Error` is forced back to `Idle`
    ///   with a failure outcome, since a restart invalidates running/paused/
    ///   queued claims. The admission queue is cleared for the same reason.
    pub async fn reconcile(&self) -> Vec<Uuid> {
        let mut inner = self.inner.lock().await;
        let mut broken = Vec::new();

        for (id, record) in &inner.records {
            let mut record = record.lock().await;

            if !record.root_path().exists() {
                warn!(
                    project = %record.display_name(),
                    path = %record.root_path().display(),
                    "Project path no longer exists"
                );
                record.set_error("Project path does not exist");
                broken.push(*id);
                continue;
            }

            for flag in [
                flags::stop_flag(record.root_path()),
                flags::pause_flag(record.root_path()),
            ] {
                match flags::remove_if_present(&flag) {
                    Ok(true) => {
                        info!(project = %record.display_name(), flag = %flag.display(), "Cleaned up stale flag")
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(flag = %flag.display(), error = %e, "Failed to clean up stale flag")
                    }
                }
            }

            if record.state() != LoopState::Idle && record.state() != LoopState::Error {
                info!(
                    project = %record.display_name(),
                    state = %record.state(),
                    "Resetting state to idle after restart"
                );
                record.set_idle(false);
            }
        }

        inner.queue.clear();
        self.persist_locked(&inner).await;
        broken
    }

    /// True iff a new loop may start immediately (strictly under the
    /// concurrency cap).
    pub async fn can_start_loop(&self) -> bool {
        self.running_count().await < self.max_concurrent_loops
    }

    /// Number of loops in `Starting`, `Running`, or `PauseRequested`.
    pub async fn running_count(&self) -> usize {
        let inner = self.inner.lock().await;
        let mut count = 0;
        for record in inner.records.values() {
            let state = record.lock().await.state();
            if matches!(
                state,
                LoopState::Starting | LoopState::Running | LoopState::PauseRequested
            ) {
                count += 1;
            }
        }
        count
    }

    /// 1-based queue position of a project, or `None` if not queued.
    pub async fn queue_position(&self, id: Uuid) -> Option<usize> {
        let inner = self.inner.lock().await;
        inner.queue.iter().position(|q| *q == id).map(|i| i + 1)
    }

    /// Appends a project to the admission queue.
    ///
    /// Idempotent for an already-queued project (returns its current
    /// position). Fails when the id is unknown or the queue is full; a
    /// failed attempt leaves the record untouched.
    pub async fn enqueue(&self, id: Uuid) -> Result<usize, RegistryError> {
        let mut inner = self.inner.lock().await;

        let record = inner
            .records
            .get(&id)
            .cloned()
            .ok_or(RegistryError::UnknownProject(id))?;

        if let Some(position) = inner.queue.iter().position(|q| *q == id) {
            return Ok(position + 1);
        }

        if inner.queue.len() >= self.queue_max_size {
            return Err(RegistryError::QueueFull(self.queue_max_size));
        }

        inner.queue.push_back(id);
        let position = inner.queue.len();
        record.lock().await.set_queued(position);
        Ok(position)
    }

    /// Pops the next project id from the queue (strict FIFO), renumbering
    /// the positions of everything still waiting. Returns `None` when empty.
    pub async fn dequeue(&self) -> Option<Uuid> {
        let mut inner = self.inner.lock().await;
        let id = inner.queue.pop_front()?;
        renumber_queue(&inner).await;
        debug!(%id, "Dequeued project");
        Some(id)
    }

    /// Removes a project from the queue, setting it back to idle with a
    /// failure outcome. Returns whether anything was removed.
    pub async fn cancel_queue(&self, id: Uuid) -> bool {
        let mut inner = self.inner.lock().await;

        let Some(position) = inner.queue.iter().position(|q| *q == id) else {
            return false;
        };
        inner.queue.remove(position);

        if let Some(record) = inner.records.get(&id) {
            record.lock().await.set_idle(false);
        }
        renumber_queue(&inner).await;
        info!(%id, "Cancelled queued project");
        true
    }

    /// Scans the immediate subdirectories of `dir` for unregistered projects
    /// (directories containing a `.bmad-assist/` marker) and registers them.
    /// Returns the newly created ids; per-candidate failures are logged and
    /// skipped.
    pub async fn scan_directory(&self, dir: &Path) -> Vec<Uuid> {
        let mut discovered = Vec::new();

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Scan directory is not readable");
                return discovered;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() || !flags::control_dir(&path).is_dir() {
                continue;
            }

            if self.get_by_path(&path).await.is_some() {
                debug!(path = %path.display(), "Already registered");
                continue;
            }

            match self.register(&path, None).await {
                Ok(id) => {
                    info!(path = %path.display(), "Discovered project");
                    discovered.push(id);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to register discovered project");
                }
            }
        }

        discovered
    }

    /// Writes the full project set to `projects.yaml`. Failures are logged,
    /// never raised; memory stays authoritative.
    async fn persist_locked(&self, inner: &RegistryInner) {
        let mut projects = Vec::with_capacity(inner.records.len());
        for record in inner.records.values() {
            let record = record.lock().await;
            projects.push(PersistedProject {
                id: record.id(),
                path: record.root_path().to_path_buf(),
                display_name: record.display_name().to_string(),
                last_seen: record.last_seen(),
                last_status: record.last_status(),
            });
        }
        projects.sort_by(|a, b| a.display_name.cmp(&b.display_name));

        let path = self.config_dir.join(PROJECTS_FILE);
        let result = serde_yaml::to_string(&RegistryFile { projects })
            .map_err(|e| e.to_string())
            .and_then(|yaml| fs::write(&path, yaml).map_err(|e| e.to_string()));

        match result {
            Ok(()) => debug!(count = inner.records.len(), "Saved projects to registry"),
            Err(e) => error!(path = %path.display(), error = %e, "Failed to save projects"),
        }
    }
}

/// Reassigns 1-based positions to every record still in the queue.
async fn renumber_queue(inner: &RegistryInner) {
    for (idx, id) in inner.queue.iter().enumerate() {
        if let Some(record) = inner.records.get(id) {
            record.lock().await.update_queue_position(idx + 1);
        }
    }
}

/// Loads persisted projects from `projects.yaml`, tolerating a missing or
/// unreadable file (logged, starts empty).
fn load_projects(config_dir: &Path, log_buffer_size: usize) -> HashMap<Uuid, SharedRecord> {
    let path = config_dir.join(PROJECTS_FILE);
    if !path.exists() {
        return HashMap::new();
    }

    let file: RegistryFile = match fs::read_to_string(&path)
        .map_err(|e| e.to_string())
        .and_then(|s| serde_yaml::from_str(&s).map_err(|e| e.to_string()))
    {
        Ok(file) => file,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to load projects");
            return HashMap::new();
        }
    };

    file.projects
        .into_iter()
        .map(|p| {
            debug!(id = %p.id, project = %p.display_name, "Loaded project");
            let record = ProjectRecord::restore(
                p.id,
                p.path,
                p.display_name,
                p.last_seen,
                p.last_status,
                log_buffer_size,
            );
            (p.id, Arc::new(Mutex::new(record)))
        })
        .collect()
}
