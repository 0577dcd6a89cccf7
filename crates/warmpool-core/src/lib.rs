//! warmpool-core — configuration and shared types for the warm process pool.
//!
//! Everything in this crate is plain data: the pool and process
//! configurations consumed by the runtime, the error taxonomy shared by every
//! layer, and the request/result types of the command-execution boundary.

pub mod config;
pub mod error;
pub mod types;

pub use config::{PoolConfiguration, ProcessConfiguration, WarmpoolConfig};
pub use error::{ConfigError, ConfigResult, PoolError, PoolResult};
pub use types::*;
