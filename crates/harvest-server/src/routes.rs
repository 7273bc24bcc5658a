use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use harvest_core::{CollectorState, TriggerOutcome};

use crate::auth::require_admin_token;
use crate::dto::{
    BreakerListResponse, BreakerResponse, ErrorResponse, HealthResponse, SchedulerStatusResponse,
    TriggerResponse,
};
use crate::error::ApiError;
use crate::openapi::ApiDoc;
use crate::state::AppState;

/// Build the full router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let control = Router::new()
        .route("/v1/scheduler/trigger", post(trigger_collection))
        .route("/v1/scheduler/reset", post(reset_scheduler))
        .route("/v1/breakers", get(list_breakers))
        .route("/v1/breakers/{endpoint}/reset", post(reset_breaker))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_token,
        ));

    let public = Router::new()
        .route("/health", get(health))
        .route("/v1/scheduler", get(get_scheduler))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    public.merge(control).with_state(state)
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/scheduler",
    responses(
        (status = 200, description = "Current scheduler status", body = SchedulerStatusResponse),
    ),
    tag = "scheduler"
)]
pub async fn get_scheduler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(SchedulerStatusResponse::from(state.scheduler.status()))
}

#[utoipa::path(
    post,
    path = "/v1/scheduler/trigger",
    responses(
        (status = 200, description = "Collection completed", body = TriggerResponse),
        (status = 409, description = "Trigger rejected (ERROR state or budget)", body = TriggerResponse),
        (status = 502, description = "Collection failed", body = TriggerResponse),
        (status = 503, description = "Scheduler not running", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Control endpoints disabled"),
    ),
    security(("bearer" = [])),
    tag = "scheduler"
)]
pub async fn trigger_collection(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.scheduler.trigger().await?;

    let status = match &outcome {
        TriggerOutcome::Completed(_) => StatusCode::OK,
        TriggerOutcome::Failed { .. } => StatusCode::BAD_GATEWAY,
        TriggerOutcome::Rejected { .. } => StatusCode::CONFLICT,
    };
    let response = TriggerResponse::from_outcome(outcome, &state.scheduler.status());

    Ok((status, axum::Json(response)))
}

#[utoipa::path(
    post,
    path = "/v1/scheduler/reset",
    responses(
        (status = 200, description = "Scheduler reset to IDLE", body = SchedulerStatusResponse),
        (status = 503, description = "Scheduler not running", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Control endpoints disabled"),
    ),
    security(("bearer" = [])),
    tag = "scheduler"
)]
pub async fn reset_scheduler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.scheduler.reset().await?;
    tracing::info!(state = %status.current_state, "Scheduler reset via API");

    Ok(axum::Json(SchedulerStatusResponse::from(status)))
}

// ---------------------------------------------------------------------------
// Circuit breakers
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/breakers",
    responses(
        (status = 200, description = "Per-endpoint circuit state", body = BreakerListResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Control endpoints disabled"),
    ),
    security(("bearer" = [])),
    tag = "breakers"
)]
pub async fn list_breakers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let breakers: Vec<BreakerResponse> = state
        .scheduler
        .breakers()
        .into_iter()
        .map(BreakerResponse::from)
        .collect();
    let total = breakers.len();

    axum::Json(BreakerListResponse { breakers, total })
}

#[utoipa::path(
    post,
    path = "/v1/breakers/{endpoint}/reset",
    params(
        ("endpoint" = String, Path, description = "Logical upstream endpoint name")
    ),
    responses(
        (status = 200, description = "Circuit closed", body = BreakerResponse),
        (status = 404, description = "Unknown endpoint", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Control endpoints disabled"),
    ),
    security(("bearer" = [])),
    tag = "breakers"
)]
pub async fn reset_breaker(
    State(state): State<Arc<AppState>>,
    Path(endpoint): Path<String>,
) -> impl IntoResponse {
    if !state.scheduler.reset_breaker(&endpoint) {
        let body = ErrorResponse {
            error: "not_found".to_string(),
            message: format!("No circuit recorded for endpoint: {endpoint}"),
        };
        return (StatusCode::NOT_FOUND, axum::Json(body)).into_response();
    }

    tracing::info!(endpoint = %endpoint, "Circuit breaker reset via API");
    match state.scheduler.breaker(&endpoint) {
        Some(stats) => axum::Json(BreakerResponse::from(stats)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Scheduler halted or database unreachable", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let db_status = match &state.db {
        Some(db) => match db.health_check().await {
            Ok(()) => "ok",
            Err(_) => "error",
        },
        None => "disabled",
    };
    let scheduler = state.scheduler.status();

    let healthy = db_status != "error" && scheduler.current_state != CollectorState::Error;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" },
        database: db_status,
        scheduler: scheduler.current_state.to_string(),
        api_calls_this_hour: scheduler.api_calls_this_hour,
        api_calls_today: scheduler.api_calls_today,
        consecutive_failures: scheduler.consecutive_failures,
    };

    (status, axum::Json(response))
}
