//! Pause/resume switch for an output drain.
//!
//! The gate is binary: pausing twice is the same as pausing once, and
//! resuming an open gate does nothing. It controls scheduling only; it is not
//! a lock around any data.

use std::sync::Arc;

use tokio::sync::watch;

/// A shared open/closed switch that tasks can wait on.
#[derive(Debug, Clone)]
pub struct ActivityGate {
    state: Arc<watch::Sender<bool>>,
}

impl ActivityGate {
    /// Create an open gate.
    pub fn new() -> Self {
        Self {
            state: Arc::new(watch::Sender::new(true)),
        }
    }

    /// Close the gate. Readers finish their current wait and then hold.
    pub fn pause(&self) {
        self.state.send_replace(false);
    }

    /// Open the gate.
    pub fn resume(&self) {
        self.state.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolve once the gate is open.
    pub async fn opened(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so this cannot fail.
        let _ = rx.wait_for(|open| *open).await;
    }

    /// Resolve once the gate is closed.
    pub async fn paused(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|open| !*open).await;
    }
}

impl Default for ActivityGate {
    fn default() -> Self {
        Self::new()
    }
}
