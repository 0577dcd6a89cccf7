//! warmpool-runtime — warm interpreter processes and their pools.
//!
//! Starting an interpreter (Maxima, in the original deployment) takes seconds;
//! running one command in an already started one takes milliseconds. This
//! crate keeps started interpreters parked until a command arrives:
//!
//! - **ActivityGate**: binary pause switch for a process's output reader
//! - **OutputDrain**: background readers that accumulate output and signal
//!   every append
//! - **ProcessSpawner**: the OS boundary (`tokio::process` in production)
//! - **ManagedProcess**: spawn, readiness, one command, kill
//! - **ProcessPool**: idle queue plus demand statistics per configuration
//!
//! # Architecture
//!
//! ```text
//! ProcessPool (one per configuration)
//!   ├── DemandTracker (startup times, request times)
//!   └── VecDeque<ManagedProcess> (idle, gate paused)
//!         ├── ActivityGate
//!         ├── OutputDrain ── one task per stdout/stderr
//!         └── WorkerControl (exit check, terminate)
//! ```

pub mod drain;
pub mod gate;
pub mod pool;
pub mod process;
pub mod spawn;
pub mod stats;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use drain::{OutputDrain, OutputStream, WaitOutcome};
pub use gate::ActivityGate;
pub use pool::{PoolStatus, ProcessPool};
pub use process::{GeneratedFiles, ManagedProcess, ProcessHandle};
pub use spawn::{InputStream, OsSpawner, ProcessSpawner, SpawnSpec, SpawnedWorker, WorkerControl};
pub use stats::DemandTracker;
