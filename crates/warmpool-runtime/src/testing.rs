//! In-memory stand-in for an interpreter, for tests.
//!
//! [`FakeSpawner`] answers like a tiny Maxima over `tokio::io::duplex`
//! pipes, so process and pool behaviour can be tested without launching
//! anything. Enabled for this crate's tests and, for downstream crates,
//! through the `test-util` feature.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

use crate::spawn::{ProcessSpawner, SpawnSpec, SpawnedWorker, WorkerControl};

const PIPE_CAPACITY: usize = 64 * 1024;

/// How the fake interpreter behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeBehaviour {
    /// Prints a banner and `(%i1)`, evaluates `1+1;`, `concat(..)`, `load(..)`
    /// and `OUTDIR <dir>` lines, and exits on `quit();`.
    Interpreter,
    /// Prints `(%i1)` and then ignores all input.
    Hangs,
    /// Prints nothing and never exits.
    Silent,
    /// Exits immediately without printing.
    ExitsImmediately,
}

/// Spawns fake interpreters and counts how many were started.
#[derive(Debug, Clone)]
pub struct FakeSpawner {
    behaviour: FakeBehaviour,
    spawned: Arc<AtomicUsize>,
}

impl FakeSpawner {
    pub fn new(behaviour: FakeBehaviour) -> Self {
        Self {
            behaviour,
            spawned: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(&self, _spec: &SpawnSpec) -> io::Result<SpawnedWorker> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let (input, fake_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (fake_stdout, output) = tokio::io::duplex(PIPE_CAPACITY);
        let task = tokio::spawn(run_fake(self.behaviour, fake_stdin, fake_stdout));
        Ok(SpawnedWorker {
            input: Box::new(input),
            outputs: vec![Box::new(output)],
            control: Box::new(FakeControl { task }),
        })
    }
}

/// A spawner that always fails.
pub fn failing_spawner() -> impl ProcessSpawner {
    |_: &SpawnSpec| -> io::Result<SpawnedWorker> {
        Err(io::Error::new(io::ErrorKind::NotFound, "no such interpreter"))
    }
}

struct FakeControl {
    task: JoinHandle<()>,
}

impl WorkerControl for FakeControl {
    fn id(&self) -> Option<u32> {
        None
    }

    fn has_exited(&mut self) -> bool {
        self.task.is_finished()
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.task.abort();
        Ok(())
    }
}

async fn run_fake(behaviour: FakeBehaviour, stdin: DuplexStream, mut stdout: DuplexStream) {
    match behaviour {
        FakeBehaviour::ExitsImmediately => {}
        FakeBehaviour::Silent => {
            std::future::pending::<()>().await;
        }
        FakeBehaviour::Hangs => {
            let _ = stdout.write_all(b"(%i1) ").await;
            let mut lines = BufReader::new(stdin).lines();
            while let Ok(Some(_)) = lines.next_line().await {}
            std::future::pending::<()>().await;
        }
        FakeBehaviour::Interpreter => {
            if stdout.write_all(b"Maxima 5.47.0\n(%i1) ").await.is_err() {
                return;
            }
            let mut lines = BufReader::new(stdin).lines();
            let mut prompt = 1;
            while let Ok(Some(line)) = lines.next_line().await {
                let mut reply = String::new();
                if let Some(dir) = line.strip_prefix("OUTDIR ") {
                    let _ = std::fs::write(std::path::Path::new(dir.trim()).join("plot.svg"), "<svg/>");
                    continue;
                }
                if line.contains("load(") {
                    prompt += 1;
                    reply.push_str(&format!("(%i{prompt}) "));
                }
                if line.contains("1+1;") {
                    reply.push_str(&format!("(%o{prompt}) 2\n"));
                    prompt += 1;
                }
                if let Some(value) = eval_concat(&line) {
                    reply.push_str(&format!("(%o{prompt}) \"{value}\"\n"));
                }
                if stdout.write_all(reply.as_bytes()).await.is_err() {
                    return;
                }
                if line.contains("quit();") {
                    return;
                }
            }
        }
    }
}

fn eval_concat(line: &str) -> Option<String> {
    let start = line.find("concat(")? + "concat(".len();
    let rest = &line[start..];
    let end = rest.find(')')?;
    Some(
        rest[..end]
            .split(',')
            .map(|part| part.trim().trim_matches('"'))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concat_joins_quoted_parts() {
        assert_eq!(
            eval_concat(r#"x;concat("--COMP","LETED--");quit();"#).as_deref(),
            Some("--COMPLETED--")
        );
        assert_eq!(eval_concat("1+1;"), None);
    }
}
