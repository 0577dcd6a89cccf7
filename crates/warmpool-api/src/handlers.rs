//! REST API handlers.
//!
//! Each handler calls into the [`PoolCoordinator`](warmpool_coordinator::PoolCoordinator)
//! held in [`ApiState`] and returns JSON responses.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;
use tracing::{info, warn};
use warmpool_core::{CommandRequest, ExecutionStatus, PoolError};
use warmpool_coordinator::CoordinatorStatus;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    fn failed(data: T, msg: &str) -> Json<Self> {
        Json(Self {
            success: false,
            data: Some(data),
            error: Some(msg.to_string()),
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn pool_error_status(err: &PoolError) -> StatusCode {
    match err {
        PoolError::NoRunningConfigurations
        | PoolError::CheckoutTimeout(_)
        | PoolError::PoolStopped(_)
        | PoolError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
        PoolError::UnknownConfiguration(_) | PoolError::NotRunning(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn pool_error_response(err: &PoolError) -> axum::response::Response {
    error_response(&err.to_string(), pool_error_status(err)).into_response()
}

// ── Execution ──────────────────────────────────────────────────

/// Outcome of one command, as returned to API callers.
///
/// Generated files are not part of it: their scratch directory is removed
/// when the handler returns, so only library callers holding a
/// `CommandResponse` can read them.
#[derive(Debug, Serialize)]
pub struct ExecuteResult {
    pub configuration: String,
    pub status: ExecutionStatus,
    pub output: String,
}

/// POST /api/v1/execute
pub async fn execute(
    State(state): State<ApiState>,
    Json(request): Json<CommandRequest>,
) -> impl IntoResponse {
    let response = match state.coordinator.execute(&request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "command not executed");
            return pool_error_response(&e);
        }
    };

    let result = ExecuteResult {
        configuration: response.configuration,
        status: response.status,
        output: response.output,
    };
    match result.status {
        ExecutionStatus::Completed => ApiResponse::ok(result).into_response(),
        ExecutionStatus::TimedOut => {
            info!(
                configuration = %result.configuration,
                timeout_ms = request.timeout_ms(),
                "command timed out"
            );
            let msg = format!("command timed out after {} ms", request.timeout_ms());
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiResponse::failed(result, &msg),
            )
                .into_response()
        }
    }
}

// ── Status ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct Setting {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub settings: Vec<Setting>,
    #[serde(flatten)]
    pub coordinator: CoordinatorStatus,
}

/// GET /api/v1/status
pub async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    let settings = state
        .coordinator
        .describe_configuration()
        .into_iter()
        .map(|(name, value)| Setting { name, value })
        .collect();
    ApiResponse::ok(StatusReport {
        settings,
        coordinator: state.coordinator.status().await,
    })
}

// ── Configurations ─────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ConfigurationSummary {
    pub name: String,
    pub running: bool,
    /// For running pools, whether the pool still matches the configuration
    /// on disk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<bool>,
    pub auto_start: bool,
    pub command_line: Vec<String>,
}

/// GET /api/v1/configurations
pub async fn list_configurations(State(state): State<ApiState>) -> impl IntoResponse {
    let running = state.coordinator.running_configurations().await;
    let mut summaries = Vec::new();
    for (name, config) in state.coordinator.available_configurations().await {
        let is_running = running.contains(&name);
        let current = if is_running {
            state.coordinator.is_configuration_current(&name).await.ok()
        } else {
            None
        };
        summaries.push(ConfigurationSummary {
            running: is_running,
            current,
            auto_start: config.auto_start,
            command_line: config.command_line.clone(),
            name,
        });
    }
    ApiResponse::ok(summaries)
}

/// POST /api/v1/configurations/rescan
pub async fn rescan_configurations(State(state): State<ApiState>) -> impl IntoResponse {
    let Some(source) = state.config_source.as_ref() else {
        return error_response("no configuration source to rescan", StatusCode::BAD_REQUEST)
            .into_response();
    };
    match source.rescan() {
        Ok(configurations) => {
            let names: Vec<String> = configurations.keys().cloned().collect();
            state
                .coordinator
                .set_available_configurations(configurations)
                .await;
            ApiResponse::ok(names).into_response()
        }
        Err(e) => {
            warn!(error = %e, "rescan failed");
            error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
        }
    }
}

/// POST /api/v1/configurations/{name}/start
pub async fn start_configuration(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.coordinator.start_configuration(&name).await {
        Ok(()) => ApiResponse::ok(serde_json::json!({ "configuration": name })).into_response(),
        Err(e) => pool_error_response(&e),
    }
}

/// POST /api/v1/configurations/{name}/stop
pub async fn stop_configuration(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    if state.coordinator.stop_configuration(&name).await {
        ApiResponse::ok(serde_json::json!({ "configuration": name })).into_response()
    } else {
        error_response("configuration not running", StatusCode::NOT_FOUND).into_response()
    }
}
