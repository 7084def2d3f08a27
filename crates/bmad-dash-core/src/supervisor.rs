//! Subprocess supervision for project loops.
//!
//! The supervisor owns the mechanics of starting, monitoring, and tearing
//! down the external `bmad-assist run` process for one project at a time per
//! record (callers serialize per-record spawn/stop). Two tasks run per active
//! record: a watchdog that polls for exit and classifies crash versus clean
//! completion, and an output reader that drains the merged stdout/stderr
//! pipe line by line into the record's ring buffer.
//!
//! Stopping escalates: `stop.flag`, then SIGTERM, then SIGKILL. The final
//! kill is best effort — if the OS does not reap the process within a short
//! window the record still goes idle, and the unconfirmed reap is only
//! logged.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::flags;
use crate::registry::SharedRecord;

/// Default executable for the supervised loop.
pub const DEFAULT_BINARY: &str = "bmad-assist";

/// Default seconds between liveness polls.
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

/// Default wait for a graceful stop before escalating to SIGTERM.
pub const DEFAULT_SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Default wait between SIGTERM and SIGKILL.
pub const DEFAULT_SIGTERM_WAIT: Duration = Duration::from_secs(5);

/// Short window for the OS to reap a SIGKILLed process.
const KILL_REAP_WAIT: Duration = Duration::from_secs(2);

/// Cadence of exit polling during stop escalation.
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Async callback invoked for each subprocess output line.
pub type OutputCallback = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Async callback invoked once when a subprocess crash is detected.
pub type CrashCallback = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Errors spawning or supervising a subprocess.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// OS-level spawn failure (executable not found, permissions).
    #[error("Failed to spawn subprocess: {0}")]
    Spawn(#[source] io::Error),

    /// The subprocess was dead before supervision could begin.
    #[error("Subprocess exited immediately with code {0}")]
    ExitedImmediately(i32),

    /// IO error preparing the spawn (control dir, output pipe).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Timing and command configuration for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Executable spawned for each loop.
    pub binary: String,

    /// Interval between watchdog liveness polls.
    pub watchdog_interval: Duration,

    /// Wait for a graceful (flag-file) stop.
    pub subprocess_timeout: Duration,

    /// Wait between SIGTERM and SIGKILL.
    pub sigterm_wait: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            binary: DEFAULT_BINARY.to_string(),
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            subprocess_timeout: DEFAULT_SUBPROCESS_TIMEOUT,
            sigterm_wait: DEFAULT_SIGTERM_WAIT,
        }
    }
}

/// Monitoring tasks for one active record.
struct Monitor {
    watchdog: JoinHandle<()>,
    reader: JoinHandle<()>,
    /// Set while a stop is in flight so the watchdog leaves the terminal
    /// transition to the stop path.
    stopping: Arc<AtomicBool>,
}

/// Spawns, monitors, and tears down loop subprocesses.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    running: Arc<AtomicBool>,
    monitors: Mutex<HashMap<Uuid, Monitor>>,
}

impl ProcessSupervisor {
    /// Creates a supervisor with the given configuration.
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(true)),
            monitors: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Spawns the loop subprocess for a record and starts its watchdog and
    /// output-reader tasks.
    ///
    /// The command line is fixed: `<binary> run --no-interactive --project
    /// <root>`, with the project root as working directory and stdout/stderr
    /// merged onto a single pipe. The record transitions to `Running` only
    /// after an immediate liveness check; a handle that is already dead is
    /// never installed.
    pub async fn spawn(
        &self,
        record: &SharedRecord,
        on_output: Option<OutputCallback>,
        on_crash: Option<CrashCallback>,
    ) -> Result<(), SupervisorError> {
        let (id, root, display_name) = {
            let rec = record.lock().await;
            (
                rec.id(),
                rec.root_path().to_path_buf(),
                rec.display_name().to_string(),
            )
        };

        flags::ensure_control_dir(&root)?;

        let (pipe, child_stdout, child_stderr) = merged_output_pipe()?;

        info!(project = %display_name, binary = %self.config.binary, "Spawning subprocess");

        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("run")
            .arg("--no-interactive")
            .arg("--project")
            .arg(&root)
            .current_dir(&root)
            .stdin(Stdio::null())
            .stdout(child_stdout)
            .stderr(child_stderr);

        let mut child = cmd.spawn().map_err(SupervisorError::Spawn)?;
        // The command retains the parent's copies of the pipe write end;
        // dropping it lets the reader see EOF once the child exits.
        drop(cmd);

        if let Some(status) = child.try_wait()? {
            return Err(SupervisorError::ExitedImmediately(
                status.code().unwrap_or(-1),
            ));
        }

        record.lock().await.set_running(child);

        let stopping = Arc::new(AtomicBool::new(false));
        let monitor = Monitor {
            watchdog: self.start_watchdog(record, on_crash, Arc::clone(&stopping)),
            reader: start_output_reader(record, pipe, on_output),
            stopping,
        };
        self.monitors.lock().await.insert(id, monitor);

        Ok(())
    }

    /// Watchdog task: polls the subprocess at a fixed interval and applies
    /// the terminal transition when it exits on its own.
    fn start_watchdog(
        &self,
        record: &SharedRecord,
        on_crash: Option<CrashCallback>,
        stopping: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let record = Arc::clone(record);
        let running = Arc::clone(&self.running);
        let interval = self.config.watchdog_interval;

        tokio::spawn(async move {
            loop {
                if !running.load(Ordering::Relaxed) {
                    break;
                }

                let status = {
                    let mut rec = record.lock().await;
                    let Some(child) = rec.process_mut() else {
                        // Detached elsewhere; nothing left to watch
                        break;
                    };
                    match child.try_wait() {
                        Ok(status) => status,
                        Err(e) => {
                            warn!(error = %e, "Failed to poll subprocess");
                            None
                        }
                    }
                };

                if let Some(status) = status {
                    // A stop in flight owns the terminal transition
                    if stopping.load(Ordering::Relaxed) {
                        break;
                    }
                    if status.success() {
                        record.lock().await.set_idle(true);
                    } else {
                        let code = status.code().unwrap_or(-1);
                        let message = format!("Subprocess crashed with exit code {code}");
                        record.lock().await.set_error(message.clone());
                        if let Some(on_crash) = &on_crash {
                            on_crash(message).await;
                        }
                    }
                    break;
                }

                tokio::time::sleep(interval).await;
            }
        })
    }

    /// Stops a record's subprocess, escalating as needed.
    ///
    /// 1. Unless `force`: write `stop.flag` and poll for exit up to the
    ///    configured graceful timeout.
    /// 2. Still running: SIGTERM, poll up to `sigterm_wait`.
    /// 3. Still running: SIGKILL, wait briefly for the reap (best effort).
    /// 4. Always: cancel the record's monitor tasks, delete both flag files,
    ///    and set the record idle (success iff the observed exit code was 0).
    ///
    /// Returns `false` only when no process was attached.
    pub async fn stop(&self, record: &SharedRecord, force: bool) -> bool {
        let (id, root, display_name, pid) = {
            let rec = record.lock().await;
            if !rec.has_process() {
                return false;
            }
            (
                rec.id(),
                rec.root_path().to_path_buf(),
                rec.display_name().to_string(),
                rec.pid(),
            )
        };

        if let Some(monitor) = self.monitors.lock().await.get(&id) {
            monitor.stopping.store(true, Ordering::Relaxed);
        }

        info!(project = %display_name, ?pid, force, "Stopping subprocess");

        let stop_flag = flags::stop_flag(&root);
        let mut exit_status = None;

        if !force {
            if let Err(e) = flags::touch(&stop_flag) {
                warn!(project = %display_name, error = %e, "Failed to create stop.flag");
            }
            exit_status = poll_for_exit(record, self.config.subprocess_timeout).await;
            if exit_status.is_some() {
                info!(project = %display_name, "Subprocess exited gracefully");
            }
        }

        if exit_status.is_none() {
            warn!(project = %display_name, ?pid, "Sending SIGTERM");
            if let Some(pid) = pid {
                send_signal(pid, StopSignal::Term);
            }
            exit_status = poll_for_exit(record, self.config.sigterm_wait).await;
            if exit_status.is_some() {
                info!(project = %display_name, "Subprocess terminated via SIGTERM");
            }
        }

        if exit_status.is_none() {
            warn!(project = %display_name, ?pid, "Sending SIGKILL");
            if let Some(pid) = pid {
                send_signal(pid, StopSignal::Kill);
            }
            exit_status = poll_for_exit(record, KILL_REAP_WAIT).await;
            if exit_status.is_none() {
                warn!(project = %display_name, "Kill not confirmed within reap window");
            }
        }

        self.cleanup_stop(record, id, &root, exit_status).await;
        true
    }

    /// Cancels monitor tasks, removes flag files, and settles the record.
    async fn cleanup_stop(
        &self,
        record: &SharedRecord,
        id: Uuid,
        root: &Path,
        exit_status: Option<ExitStatus>,
    ) {
        if let Some(monitor) = self.monitors.lock().await.remove(&id) {
            monitor.watchdog.abort();
            monitor.reader.abort();
        }

        for flag in [flags::stop_flag(root), flags::pause_flag(root)] {
            if let Err(e) = flags::remove_if_present(&flag) {
                warn!(flag = %flag.display(), error = %e, "Failed to remove flag");
            }
        }

        let success = exit_status.is_some_and(|s| s.success());
        record.lock().await.set_idle(success);
    }

    /// Writes `pause.flag` for a record. Pause signaling is advisory, so
    /// failures are logged and reported, never raised.
    pub async fn write_pause_flag(&self, record: &SharedRecord) -> bool {
        let (root, display_name) = {
            let rec = record.lock().await;
            (
                rec.root_path().to_path_buf(),
                rec.display_name().to_string(),
            )
        };

        match flags::touch(&flags::pause_flag(&root)) {
            Ok(()) => {
                info!(project = %display_name, "Created pause.flag");
                true
            }
            Err(e) => {
                warn!(project = %display_name, error = %e, "Failed to create pause.flag");
                false
            }
        }
    }

    /// Removes `pause.flag` for a record. Returns true when the flag is
    /// gone afterwards (removed or never present).
    pub async fn remove_pause_flag(&self, record: &SharedRecord) -> bool {
        let (root, display_name) = {
            let rec = record.lock().await;
            (
                rec.root_path().to_path_buf(),
                rec.display_name().to_string(),
            )
        };

        match flags::remove_if_present(&flags::pause_flag(&root)) {
            Ok(_) => {
                info!(project = %display_name, "Removed pause.flag");
                true
            }
            Err(e) => {
                warn!(project = %display_name, error = %e, "Failed to remove pause.flag");
                false
            }
        }
    }

    /// Global teardown: stops accepting new monitors, cancels every
    /// in-flight watchdog and reader, and waits for the cancellations to be
    /// observed.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);

        let monitors: Vec<Monitor> = {
            let mut map = self.monitors.lock().await;
            map.drain().map(|(_, m)| m).collect()
        };

        for monitor in &monitors {
            monitor.watchdog.abort();
            monitor.reader.abort();
        }
        for monitor in monitors {
            let _ = monitor.watchdog.await;
            let _ = monitor.reader.await;
        }

        info!("Process supervisor shutdown complete");
    }
}

/// Checks whether a pid is still running via the zero-effect signal probe.
///
/// "No such process" maps to false; any other error (e.g. EPERM) means the
/// process exists and is treated conservatively as alive.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    true
}

/// Signals sent during stop escalation.
#[derive(Debug, Clone, Copy)]
enum StopSignal {
    Term,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: StopSignal) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let sig = match signal {
        StopSignal::Term => Signal::SIGTERM,
        StopSignal::Kill => Signal::SIGKILL,
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), sig) {
        warn!(pid, error = %e, "Failed to send signal (process may have exited)");
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: StopSignal) {}

/// Creates the pipe that merges the child's stdout and stderr: both child
/// descriptors point at the same write end, the parent reads the other.
fn merged_output_pipe() -> io::Result<(io::PipeReader, Stdio, Stdio)> {
    let (reader, writer) = io::pipe()?;
    let writer_clone = writer.try_clone()?;
    Ok((reader, Stdio::from(writer), Stdio::from(writer_clone)))
}

/// Output-reader task: drains the merged pipe line by line into the record's
/// ring buffer, then the output callback. Exactly one reader owns a record's
/// stream, so per-record ordering is preserved.
fn start_output_reader(
    record: &SharedRecord,
    pipe: io::PipeReader,
    on_output: Option<OutputCallback>,
) -> JoinHandle<()> {
    let record = Arc::clone(record);

    tokio::spawn(async move {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

        // Blocking line reads stay off the async scheduler. The thread ends
        // at pipe EOF, or on the first send after the receiver is gone.
        tokio::task::spawn_blocking(move || {
            use std::io::BufRead;

            let mut reader = std::io::BufReader::new(pipe);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.send(decode_line(&buf)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "Output pipe read failed");
                        break;
                    }
                }
            }
        });

        while let Some(line) = rx.recv().await {
            record.lock().await.add_log(line.clone());
            if let Some(on_output) = &on_output {
                on_output(line).await;
            }
        }
    })
}

/// Decodes one raw output line: lossy UTF-8, trailing newline trimmed.
fn decode_line(buf: &[u8]) -> String {
    let mut line = String::from_utf8_lossy(buf).into_owned();
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    line
}

/// Polls a record's subprocess for exit once per second up to `timeout`.
/// Returns the exit status, or `None` on timeout or a detached handle.
async fn poll_for_exit(record: &SharedRecord, timeout: Duration) -> Option<ExitStatus> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        {
            let mut rec = record.lock().await;
            let child = rec.process_mut()?;
            match child.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Failed to poll subprocess"),
            }
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            return None;
        }
        tokio::time::sleep(STOP_POLL_INTERVAL.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SupervisorConfig::default();
        assert_eq!(config.binary, "bmad-assist");
        assert_eq!(config.watchdog_interval, Duration::from_secs(5));
        assert_eq!(config.subprocess_timeout, Duration::from_secs(30));
        assert_eq!(config.sigterm_wait, Duration::from_secs(5));
    }

    #[test]
    fn test_decode_line_trims_newlines() {
        assert_eq!(decode_line(b"hello\n"), "hello");
        assert_eq!(decode_line(b"hello\r\n"), "hello");
        assert_eq!(decode_line(b"no newline"), "no newline");
        assert_eq!(decode_line(b""), "");
    }

    #[test]
    fn test_decode_line_replaces_invalid_utf8() {
        let decoded = decode_line(b"bad \xff byte\n");
        assert!(decoded.starts_with("bad "));
        assert!(decoded.contains('\u{fffd}'));
    }

    #[cfg(unix)]
    #[test]
    fn test_is_alive_current_process() {
        assert!(is_alive(std::process::id()));
    }
}
