//! Output accumulation for a worker process, read in the background.
//!
//! One task per source stream reads whatever is available, decodes it as
//! UTF-8 and appends it to a shared buffer. Every append bumps a change
//! counter so waiters can sleep until new output arrives instead of polling.
//! Reading only happens while the [`ActivityGate`] is open.
//!
//! End of stream is terminal: once every source has hit EOF (or the drain is
//! closed) the readers are dropped and [`OutputDrain::at_end`] stays true.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tracing::trace;

use crate::gate::ActivityGate;

const READ_CHUNK: usize = 4096;

/// A readable output stream of a worker.
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Result of waiting for text to appear in the drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Found,
    /// All sources ended without the text appearing.
    Ended,
    DeadlinePassed,
}

struct DrainShared {
    buffer: Mutex<String>,
    open_sources: AtomicUsize,
    reached_end: AtomicBool,
    closed: watch::Sender<bool>,
    changes: watch::Sender<u64>,
}

impl DrainShared {
    fn buffer(&self) -> MutexGuard<'_, String> {
        // A poisoned buffer still holds valid text.
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn append(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.buffer().push_str(text);
        self.bump();
    }

    fn bump(&self) {
        self.changes.send_modify(|n| *n = n.wrapping_add(1));
    }

    fn source_finished(&self) {
        if self.open_sources.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.reached_end.store(true, Ordering::Release);
            self.bump();
        }
    }
}

/// Handle to a running drain. Clones share the same buffer.
#[derive(Clone)]
pub struct OutputDrain {
    shared: Arc<DrainShared>,
}

impl OutputDrain {
    /// Start draining `sources` into one buffer, gated by `gate`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(sources: Vec<OutputStream>, gate: ActivityGate) -> Self {
        let shared = Arc::new(DrainShared {
            buffer: Mutex::new(String::new()),
            open_sources: AtomicUsize::new(sources.len()),
            reached_end: AtomicBool::new(sources.is_empty()),
            closed: watch::Sender::new(false),
            changes: watch::Sender::new(0),
        });

        for source in sources {
            tokio::spawn(drain_source(shared.clone(), source, gate.clone()));
        }

        Self { shared }
    }

    /// Everything read so far.
    pub fn contents(&self) -> String {
        self.shared.buffer().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.shared.buffer().contains(needle)
    }

    /// True once every source hit EOF or the drain was closed.
    pub fn at_end(&self) -> bool {
        self.shared.reached_end.load(Ordering::Acquire) || *self.shared.closed.borrow()
    }

    /// Stop reading. Already captured output stays available.
    pub fn close(&self) {
        if !self.shared.closed.send_replace(true) {
            self.shared.bump();
        }
    }

    /// A receiver that changes whenever output is appended or the drain ends.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.changes.subscribe()
    }

    /// Wait until `needle` appears, the drain ends, or `deadline` passes.
    pub async fn wait_for_text(&self, needle: &str, deadline: Instant) -> WaitOutcome {
        let mut changes = self.subscribe();
        loop {
            if self.contains(needle) {
                return WaitOutcome::Found;
            }
            if self.at_end() {
                return WaitOutcome::Ended;
            }
            if Instant::now() > deadline {
                return WaitOutcome::DeadlinePassed;
            }
            tokio::select! {
                _ = changes.changed() => {}
                _ = tokio::time::sleep_until(deadline.into()) => {}
            }
        }
    }
}

async fn drain_source(shared: Arc<DrainShared>, mut source: OutputStream, gate: ActivityGate) {
    let mut closed = shared.closed.subscribe();
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut pending = Vec::new();

    loop {
        tokio::select! {
            _ = gate.opened() => {}
            _ = closed.wait_for(|c| *c) => break,
        }

        // A read in flight is abandoned when the gate closes; nothing is lost
        // because `read` only consumes bytes it returns.
        let read = tokio::select! {
            read = source.read(&mut chunk) => read,
            _ = gate.paused() => continue,
            _ = closed.wait_for(|c| *c) => break,
        };

        match read {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                pending.extend_from_slice(&chunk[..n]);
                shared.append(&decode_available(&mut pending));
            }
        }
    }

    if !pending.is_empty() {
        shared.append(&String::from_utf8_lossy(&pending));
    }
    trace!("output source finished");
    shared.source_finished();
}

/// Decode the complete UTF-8 prefix of `pending`, leaving a split trailing
/// character in place for the next read.
fn decode_available(pending: &mut Vec<u8>) -> String {
    let valid = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => pending.len(),
    };
    let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
    pending.drain(..valid);
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn deadline(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn decode_keeps_split_character() {
        let euro = "€".as_bytes();
        let mut pending = vec![b'a', euro[0], euro[1]];
        assert_eq!(decode_available(&mut pending), "a");
        assert_eq!(pending.len(), 2);
        pending.push(euro[2]);
        assert_eq!(decode_available(&mut pending), "€");
        assert!(pending.is_empty());
    }

    #[test]
    fn decode_replaces_invalid_bytes() {
        let mut pending = vec![b'x', 0xff, b'y'];
        assert_eq!(decode_available(&mut pending), "x\u{fffd}y");
    }

    #[tokio::test]
    async fn accumulates_until_eof() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let drain = OutputDrain::start(vec![Box::new(reader)], ActivityGate::new());

        writer.write_all(b"(%i1) ").await.unwrap();
        assert_eq!(
            drain.wait_for_text("(%i1)", deadline(1000)).await,
            WaitOutcome::Found
        );

        writer.write_all(b"more").await.unwrap();
        drop(writer);
        assert_eq!(
            drain.wait_for_text("never", deadline(1000)).await,
            WaitOutcome::Ended
        );
        assert_eq!(drain.contents(), "(%i1) more");
        assert!(drain.at_end());
    }

    #[tokio::test]
    async fn merges_multiple_sources() {
        let (mut out, out_reader) = tokio::io::duplex(64);
        let (mut err, err_reader) = tokio::io::duplex(64);
        let drain = OutputDrain::start(
            vec![Box::new(out_reader), Box::new(err_reader)],
            ActivityGate::new(),
        );

        out.write_all(b"stdout ").await.unwrap();
        drop(out);
        assert_eq!(
            drain.wait_for_text("stdout", deadline(1000)).await,
            WaitOutcome::Found
        );
        assert!(!drain.at_end());

        err.write_all(b"stderr").await.unwrap();
        drop(err);
        assert_eq!(
            drain.wait_for_text("missing", deadline(1000)).await,
            WaitOutcome::Ended
        );
        assert!(drain.contains("stderr"));
    }

    #[tokio::test]
    async fn paused_gate_holds_output_without_losing_it() {
        let gate = ActivityGate::new();
        let (mut writer, reader) = tokio::io::duplex(64);
        let drain = OutputDrain::start(vec![Box::new(reader)], gate.clone());

        gate.pause();
        tokio::task::yield_now().await;
        writer.write_all(b"held").await.unwrap();
        assert_eq!(
            drain.wait_for_text("held", deadline(50)).await,
            WaitOutcome::DeadlinePassed
        );

        gate.resume();
        assert_eq!(
            drain.wait_for_text("held", deadline(1000)).await,
            WaitOutcome::Found
        );
    }

    #[tokio::test]
    async fn close_ends_the_drain() {
        let (_writer, reader) = tokio::io::duplex(64);
        let drain = OutputDrain::start(vec![Box::new(reader)], ActivityGate::new());
        assert!(!drain.at_end());
        drain.close();
        drain.close();
        assert!(drain.at_end());
        assert_eq!(
            drain.wait_for_text("x", deadline(1000)).await,
            WaitOutcome::Ended
        );
    }
}
