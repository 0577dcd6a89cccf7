//! One interpreter process, from spawn to kill.
//!
//! Lifecycle:
//!
//! ```text
//!  start ──▶ wait for first marker ──▶ [load extra file, wait for ready marker]
//!    │                                              │
//!    ▼ (timeout / early exit: kill, error)          ▼
//!                                  ready (live_until = now + lifetime)
//!                                               │ deactivate (gate paused, idle)
//!                                               ▼
//!                              activate (live_until += execution timeout)
//!                                               │
//!                                               ▼
//!                        execute: write command + sentinel + quit, close input
//!                                               │
//!                      sentinel seen / exited and drained / deadline passed
//!                                               │
//!                                               ▼
//!                                             kill
//! ```
//!
//! A process is used for exactly one command. Its output drain, pause gate
//! and OS handle are shared with any [`ProcessHandle`] so the coordinator can
//! reap it while a caller still owns the process.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use warmpool_core::{ExecutionStatus, PoolError, PoolResult, ProcessConfiguration};

use crate::drain::{OutputDrain, WaitOutcome};
use crate::gate::ActivityGate;
use crate::spawn::{InputStream, ProcessSpawner, SpawnSpec, WorkerControl};

/// Subdirectory of the scratch directory collected after a command.
pub const OUTPUT_DIR: &str = "output";
/// Subdirectory of the scratch directory for the interpreter's own use.
pub const WORK_DIR: &str = "work";

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const QUIT_WRITE_LIMIT: Duration = Duration::from_millis(100);

struct ProcessShared {
    config: Arc<ProcessConfiguration>,
    gate: ActivityGate,
    drain: OutputDrain,
    control: Mutex<Box<dyn WorkerControl>>,
    live_until: Mutex<Instant>,
    killed: AtomicBool,
    pid: Option<u32>,
}

impl ProcessShared {
    fn live_until(&self) -> Instant {
        *self.live_until.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_live_until(&self, deadline: Instant) {
        *self.live_until.lock().unwrap_or_else(|e| e.into_inner()) = deadline;
    }

    fn has_exited(&self) -> bool {
        self.control
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .has_exited()
    }

    fn terminate(&self) {
        let mut control = self.control.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = control.terminate() {
            warn!(pid = ?self.pid, error = %e, "failed to terminate worker");
        }
    }

    fn mark_killed(&self) {
        if !self.killed.swap(true, Ordering::AcqRel) {
            debug!(pid = ?self.pid, "killing worker");
        }
    }

    async fn await_marker(&self, marker: &str, deadline: Instant) -> PoolResult<()> {
        match self.drain.wait_for_text(marker, deadline).await {
            WaitOutcome::Found => Ok(()),
            WaitOutcome::Ended => Err(PoolError::ExitedDuringStartup {
                marker: marker.to_string(),
            }),
            WaitOutcome::DeadlinePassed => Err(PoolError::ReadinessTimeout {
                marker: marker.to_string(),
                timeout_ms: self.config.startup_timeout_ms,
            }),
        }
    }

    /// Synchronous kill: no quit command, straight to termination.
    fn close(&self) {
        self.gate.resume();
        self.drain.close();
        if !self.has_exited() {
            self.mark_killed();
            self.terminate();
        }
    }
}

/// A cloneable view of a process used to watch and reap it from elsewhere.
#[derive(Clone)]
pub struct ProcessHandle {
    shared: Arc<ProcessShared>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.shared.pid
    }

    pub fn live_until(&self) -> Instant {
        self.shared.live_until()
    }

    pub fn is_overdue(&self, now: Instant) -> bool {
        now > self.shared.live_until()
    }

    pub fn has_exited(&self) -> bool {
        self.shared.has_exited()
    }

    /// Terminate the process if it is still running.
    pub fn close(&self) {
        self.shared.close();
    }

    /// True when both handles refer to the same process.
    pub fn same_process(&self, other: &ProcessHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.shared.pid)
            .finish()
    }
}

struct Scratch {
    dir: TempDir,
    output: PathBuf,
}

/// Files a command wrote into its output directory.
///
/// Owns the scratch directory: dropping this value deletes the files.
#[derive(Default)]
pub struct GeneratedFiles {
    scratch: Option<TempDir>,
    output_dir: Option<PathBuf>,
    files: Vec<PathBuf>,
}

impl GeneratedFiles {
    /// Absolute paths, sorted.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    /// Path of `file` relative to the output directory.
    pub fn relative_name(&self, file: &Path) -> Option<String> {
        relative_output_name(self.output_dir.as_deref()?, file)
    }

    /// `(relative name, absolute path)` for every file.
    pub fn entries(&self) -> Vec<(String, PathBuf)> {
        self.files
            .iter()
            .filter_map(|f| Some((self.relative_name(f)?, f.clone())))
            .collect()
    }

    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch.as_ref().map(TempDir::path)
    }
}

impl std::fmt::Debug for GeneratedFiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedFiles")
            .field("output_dir", &self.output_dir)
            .field("files", &self.files)
            .finish()
    }
}

/// A running interpreter process.
pub struct ManagedProcess {
    shared: Arc<ProcessShared>,
    input: Option<InputStream>,
    scratch: Option<Scratch>,
}

impl ManagedProcess {
    /// Spawn a worker and wait until it is ready for a command.
    ///
    /// On any failure the worker is killed before the error is returned.
    pub async fn start(
        config: Arc<ProcessConfiguration>,
        spawner: &dyn ProcessSpawner,
    ) -> PoolResult<Self> {
        let started = Instant::now();
        let deadline = started + config.startup_timeout();

        let worker = spawner
            .spawn(&SpawnSpec::from_configuration(&config))
            .map_err(PoolError::StartupFailure)?;

        let gate = ActivityGate::new();
        let drain = OutputDrain::start(worker.outputs, gate.clone());
        let pid = worker.control.id();

        let mut process = Self {
            shared: Arc::new(ProcessShared {
                config,
                gate,
                drain,
                control: Mutex::new(worker.control),
                live_until: Mutex::new(deadline),
                killed: AtomicBool::new(false),
                pid,
            }),
            input: Some(worker.input),
            scratch: None,
        };

        if let Err(e) = process.await_readiness(deadline).await {
            warn!(pid = ?pid, error = %e, "worker failed to start");
            process.kill().await;
            return Err(e);
        }

        let lifetime = process.shared.config.maximum_lifetime();
        process.shared.set_live_until(Instant::now() + lifetime);
        info!(
            pid = ?pid,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "worker ready"
        );
        Ok(process)
    }

    async fn await_readiness(&mut self, deadline: Instant) -> PoolResult<()> {
        let shared = self.shared.clone();
        let config = shared.config.clone();
        shared.await_marker(config.first_marker(), deadline).await?;

        if let Some(extra) = &config.extra_file_to_load {
            let path = resolve_path(&config.working_directory, extra);
            let command = format!("load(\"{}\");\n", escape_backslashes(&path.display().to_string()));
            self.write_input(&command).await?;
            shared
                .await_marker(&config.process_is_ready_output, deadline)
                .await?;
        }
        Ok(())
    }

    async fn write_input(&mut self, text: &str) -> io::Result<()> {
        let input = self
            .input
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "input already closed"))?;
        input.write_all(text.as_bytes()).await?;
        input.flush().await
    }

    async fn close_input(&mut self) {
        if let Some(mut input) = self.input.take() {
            let _ = input.shutdown().await;
        }
    }

    /// Park the process in an idle queue: stop reading its output.
    pub fn deactivate(&self) {
        self.shared.gate.pause();
    }

    /// Take the process out of an idle queue.
    pub fn activate(&self) {
        let extended = self.shared.live_until() + self.shared.config.execution_timeout();
        self.shared.set_live_until(extended);
        self.shared.gate.resume();
    }

    /// Run one command and wait for it to finish.
    ///
    /// The process is dead when this returns [`ExecutionStatus::TimedOut`],
    /// and on its way out otherwise; it must not be reused.
    pub async fn execute(
        &mut self,
        command: &str,
        timeout: Duration,
        plot_url_base: &str,
    ) -> ExecutionStatus {
        let config = self.shared.config.clone();

        if config.file_handling {
            if let Err(e) = self.setup_files(plot_url_base).await {
                warn!(pid = ?self.shared.pid, error = %e, "file handling setup failed");
            }
        }

        let script = format!(
            "{command}{}quit();\n",
            sentinel_expression(&config.kill_string)
        );
        if let Err(e) = self.write_input(&script).await {
            debug!(pid = ?self.shared.pid, error = %e, "could not send command");
        }
        self.close_input().await;

        let deadline = Instant::now() + timeout;
        self.shared.set_live_until(deadline);

        let drain = self.shared.drain.clone();
        let mut changes = drain.subscribe();
        loop {
            if drain.contains(&config.kill_string) {
                self.kill().await;
                return ExecutionStatus::Completed;
            }
            // Checked before exit: a reaper may already have killed us.
            if Instant::now() > deadline {
                warn!(
                    pid = ?self.shared.pid,
                    timeout_ms = timeout.as_millis() as u64,
                    "command timed out"
                );
                self.kill().await;
                return ExecutionStatus::TimedOut;
            }
            if self.has_exited() && drain.at_end() {
                drain.close();
                return ExecutionStatus::Completed;
            }

            // Exit is not signalled through the drain, so poll it as well.
            tokio::select! {
                _ = changes.changed() => {}
                _ = tokio::time::sleep_until(deadline.into()) => {}
                _ = tokio::time::sleep(EXIT_POLL_INTERVAL) => {}
            }
        }
    }

    async fn setup_files(&mut self, plot_url_base: &str) -> io::Result<()> {
        let dir = tempfile::Builder::new().prefix("mp-").tempdir()?;
        let output = dir.path().join(OUTPUT_DIR);
        let work = dir.path().join(WORK_DIR);
        std::fs::create_dir(&output)?;
        std::fs::create_dir(&work)?;
        let output = output.canonicalize().unwrap_or(output);
        let work = work.canonicalize().unwrap_or(work);

        let command = render_path_command(
            &self.shared.config.path_command_template,
            &output,
            &work,
            plot_url_base,
        );
        self.scratch = Some(Scratch { dir, output });
        self.write_input(&format!("{command}\n")).await
    }

    /// Everything the command printed before the sentinel.
    pub fn output(&self) -> String {
        strip_sentinel(&self.shared.drain.contents(), &self.shared.config.kill_string).to_string()
    }

    /// Raw captured output, sentinel included.
    pub fn raw_output(&self) -> String {
        self.shared.drain.contents()
    }

    /// Files under the output directory, recursively, as absolute paths.
    pub fn generated_files(&self) -> Vec<PathBuf> {
        match &self.scratch {
            Some(scratch) => list_files(&scratch.output),
            None => Vec::new(),
        }
    }

    /// Path of `file` relative to the output directory.
    pub fn relative_output_name(&self, file: &Path) -> Option<String> {
        relative_output_name(&self.scratch.as_ref()?.output, file)
    }

    /// Move the scratch directory and its file list out of the process.
    pub fn take_generated_files(&mut self) -> GeneratedFiles {
        match self.scratch.take() {
            Some(scratch) => GeneratedFiles {
                files: list_files(&scratch.output),
                output_dir: Some(scratch.output),
                scratch: Some(scratch.dir),
            },
            None => GeneratedFiles::default(),
        }
    }

    /// Stop the process. Safe to call any number of times.
    pub async fn kill(&mut self) {
        self.shared.gate.resume();
        self.shared.drain.close();
        if self.shared.has_exited() {
            self.input = None;
            return;
        }
        self.shared.mark_killed();

        if let Some(mut input) = self.input.take() {
            let quit = async {
                input.write_all(b"quit();\n\n").await?;
                input.shutdown().await
            };
            let _ = tokio::time::timeout(QUIT_WRITE_LIMIT, quit).await;
        }

        if !self.shared.has_exited() {
            self.shared.terminate();
        }
    }

    /// True once `kill` (or a handle's `close`) has acted on a live process.
    pub fn was_killed(&self) -> bool {
        self.shared.killed.load(Ordering::Acquire)
    }

    pub fn has_exited(&self) -> bool {
        self.shared.has_exited()
    }

    pub fn is_overdue(&self, now: Instant) -> bool {
        now > self.shared.live_until()
    }

    pub fn live_until(&self) -> Instant {
        self.shared.live_until()
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.pid
    }

    pub fn configuration(&self) -> &Arc<ProcessConfiguration> {
        &self.shared.config
    }

    pub fn handle(&self) -> ProcessHandle {
        ProcessHandle {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("pid", &self.shared.pid)
            .field("killed", &self.was_killed())
            .finish()
    }
}

/// `concat("<first half>","<second half>");` so the sentinel itself never
/// appears in echoed input.
pub fn sentinel_expression(sentinel: &str) -> String {
    let mid = sentinel
        .char_indices()
        .nth(sentinel.chars().count() / 2)
        .map_or(sentinel.len(), |(i, _)| i);
    let (first, second) = sentinel.split_at(mid);
    format!("concat(\"{first}\",\"{second}\");")
}

/// Text before the sentinel, whether it is printed bare or as a quoted string.
pub fn strip_sentinel<'a>(raw: &'a str, sentinel: &str) -> &'a str {
    let quoted = format!("\"{sentinel}");
    if let Some(i) = raw.find(&quoted) {
        &raw[..i]
    } else if let Some(i) = raw.find(sentinel) {
        &raw[..i]
    } else {
        raw
    }
}

/// Fill in the directory placeholders of a path command template.
///
/// The `-NE` forms are replaced first so they are not caught by the shorter
/// escaped forms.
pub fn render_path_command(
    template: &str,
    output: &Path,
    work: &Path,
    plot_url_base: &str,
) -> String {
    let output = output.display().to_string();
    let work = work.display().to_string();
    template
        .replace("%OUTPUT-DIR-NE%", &output)
        .replace("%WORK-DIR-NE%", &work)
        .replace("%OUTPUT-DIR%", &escape_backslashes(&output))
        .replace("%WORK-DIR%", &escape_backslashes(&work))
        .replace("%PLOT-URL-BASE%", plot_url_base)
}

fn escape_backslashes(path: &str) -> String {
    path.replace('\\', "\\\\")
}

fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_relative() {
        base.join(path)
    } else {
        path.to_path_buf()
    };
    joined.canonicalize().unwrap_or(joined)
}

fn list_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

fn relative_output_name(output: &Path, file: &Path) -> Option<String> {
    file.strip_prefix(output)
        .ok()
        .map(|rel| rel.to_string_lossy().into_owned())
}
