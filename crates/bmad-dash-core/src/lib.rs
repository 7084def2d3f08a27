//! # bmad-dash-core
//!
//! Core functionality for the bmad-dash control plane.
//!
//! This crate provides:
//! - The project registry with YAML persistence and a FIFO admission queue
//! - The per-project loop state machine and log ring buffer
//! - Subprocess supervision: spawn, watchdog, output capture, and the
//!   graceful-then-forceful stop escalation
//! - The flag-file protocol shared with the supervised `bmad-assist` loop
//! - Loop control intents (start/pause/resume/stop) on top of the above

pub mod config;
pub mod control;
pub mod flags;
pub mod project;
pub mod registry;
pub mod supervisor;

pub use config::{ConfigError, ServerConfig, default_config_dir};
pub use control::{ControlError, LoopController, StartOutcome, StopOutcome};
pub use project::{LastStatus, LoopState, ProjectRecord, ProjectSummary};
pub use registry::{ProjectRegistry, RegistryError, SharedRecord};
pub use supervisor::{
    CrashCallback, OutputCallback, ProcessSupervisor, SupervisorConfig, SupervisorError, is_alive,
};
