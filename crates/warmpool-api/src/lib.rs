//! warmpool-api — REST API for the warm process pool.
//!
//! A thin JSON adapter over [`PoolCoordinator`]: one route runs commands,
//! the rest report status and administer configurations. There is no
//! authentication; put the daemon behind something that provides it.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/execute` | Run one command on a pooled process |
//! | GET | `/api/v1/status` | Coordinator and per-pool status |
//! | GET | `/api/v1/configurations` | Available configurations and whether they run |
//! | POST | `/api/v1/configurations/rescan` | Re-read the configurations directory |
//! | POST | `/api/v1/configurations/{name}/start` | Start a pool |
//! | POST | `/api/v1/configurations/{name}/stop` | Stop a pool |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use warmpool_coordinator::PoolCoordinator;
use warmpool_core::WarmpoolConfig;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub coordinator: Arc<PoolCoordinator>,
    /// Where rescans read configurations from. `None` disables rescanning.
    pub config_source: Option<Arc<WarmpoolConfig>>,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/execute", post(handlers::execute))
        .route("/status", get(handlers::status))
        .route("/configurations", get(handlers::list_configurations))
        .route("/configurations/rescan", post(handlers::rescan_configurations))
        .route("/configurations/{name}/start", post(handlers::start_configuration))
        .route("/configurations/{name}/stop", post(handlers::stop_configuration))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
