//! Process spawning seam.
//!
//! [`ManagedProcess`](crate::ManagedProcess) never touches the OS directly;
//! it asks a [`ProcessSpawner`] for a worker's pipes and a
//! [`WorkerControl`] to check on it and kill it. [`OsSpawner`] is the real
//! implementation on top of `tokio::process`.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::AsyncWrite;
use tokio::process::{Child, Command};
use tracing::debug;
use warmpool_core::ProcessConfiguration;

use crate::drain::OutputStream;

/// A writable input stream of a worker.
pub type InputStream = Box<dyn AsyncWrite + Send + Unpin>;

/// What to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub command_line: Vec<String>,
    pub working_directory: PathBuf,
    pub environment: BTreeMap<String, String>,
    /// Read standard error into the same buffer as standard output.
    pub merge_stderr: bool,
}

impl SpawnSpec {
    pub fn from_configuration(config: &ProcessConfiguration) -> Self {
        Self {
            command_line: config.command_line.clone(),
            working_directory: config.working_directory.clone(),
            environment: config.environment.clone(),
            merge_stderr: true,
        }
    }
}

/// Liveness checks and termination for a spawned worker.
pub trait WorkerControl: Send {
    fn id(&self) -> Option<u32>;

    /// Non-blocking check whether the worker has exited.
    fn has_exited(&mut self) -> bool;

    /// Forcibly stop the worker. Calling this on an exited worker is not an
    /// error.
    fn terminate(&mut self) -> io::Result<()>;
}

/// A freshly spawned worker: its input, its output streams, and a control.
pub struct SpawnedWorker {
    pub input: InputStream,
    pub outputs: Vec<OutputStream>,
    pub control: Box<dyn WorkerControl>,
}

/// Creates workers.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, spec: &SpawnSpec) -> io::Result<SpawnedWorker>;
}

impl<F> ProcessSpawner for F
where
    F: Fn(&SpawnSpec) -> io::Result<SpawnedWorker> + Send + Sync,
{
    fn spawn(&self, spec: &SpawnSpec) -> io::Result<SpawnedWorker> {
        self(spec)
    }
}

/// Spawns real OS processes through `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSpawner;

impl ProcessSpawner for OsSpawner {
    fn spawn(&self, spec: &SpawnSpec) -> io::Result<SpawnedWorker> {
        let (program, args) = spec
            .command_line
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&spec.working_directory)
            .envs(&spec.environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if spec.merge_stderr {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let pipe_missing = || io::Error::new(io::ErrorKind::BrokenPipe, "child pipe missing");

        let input = child.stdin.take().ok_or_else(pipe_missing)?;
        let mut outputs: Vec<OutputStream> =
            vec![Box::new(child.stdout.take().ok_or_else(pipe_missing)?)];
        if let Some(stderr) = child.stderr.take() {
            outputs.push(Box::new(stderr));
        }

        debug!(program = %program, pid = ?child.id(), "spawned worker");
        Ok(SpawnedWorker {
            input: Box::new(input),
            outputs,
            control: Box::new(ChildControl { child }),
        })
    }
}

struct ChildControl {
    child: Child,
}

impl WorkerControl for ChildControl {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        // An unqueryable child is treated as gone.
        !matches!(self.child.try_wait(), Ok(None))
    }

    fn terminate(&mut self) -> io::Result<()> {
        match self.child.start_kill() {
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }
}
