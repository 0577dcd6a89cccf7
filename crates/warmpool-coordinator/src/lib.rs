//! warmpool-coordinator — pools per configuration behind one facade.
//!
//! The coordinator maps configuration names to [`ProcessPool`]s (from
//! `warmpool-runtime`) and:
//!
//! - Starts and stops pools on request, one per configuration name
//! - Routes each checkout to the closest running configuration
//! - Caps concurrent process startups with a shared semaphore
//! - Records checked-out processes and kills those that overrun
//! - Runs a periodic maintenance cycle that reaps and refills the pools
//!
//! # Architecture
//!
//! ```text
//! PoolCoordinator
//!   ├── available configurations (name → ProcessConfiguration)
//!   ├── running pools (name → ProcessPool)
//!   ├── startup throttle (Semaphore, startup_limit permits)
//!   ├── in-use registry (checkout order)
//!   └── MaintenanceLoop (weak reference back to the coordinator)
//!         reap overdue ─▶ update estimates ─▶ refill below target
//! ```
//!
//! [`ProcessPool`]: warmpool_runtime::ProcessPool

pub mod coordinator;
pub mod maintenance;
pub mod routing;
pub mod status;

pub use coordinator::PoolCoordinator;
pub use maintenance::{Maintainable, MaintenanceLoop};
pub use routing::best_match;
pub use status::{CommandResponse, CoordinatorStatus};
