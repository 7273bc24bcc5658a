use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use harvest_core::testutil::{ManualClock, MockFetcher, network_error};
use harvest_core::{Clock, CollectorState, SchedulerState};

use crate::integration::common::{
    TEST_ADMIN_TOKEN, quiet_state, setup_test_app, setup_test_app_no_auth, setup_test_app_with,
    setup_test_app_with_db,
};

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

fn admin_post(uri: &str) -> Request<Body> {
    Request::post(uri)
        .header("authorization", format!("Bearer {TEST_ADMIN_TOKEN}"))
        .body(Body::empty())
        .unwrap()
}

fn admin_get(uri: &str) -> Request<Body> {
    Request::get(uri)
        .header("authorization", format!("Bearer {TEST_ADMIN_TOKEN}"))
        .body(Body::empty())
        .unwrap()
}

// ---------------------------------------------------------------------------
// Health and status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_200_without_database() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["database"], "disabled");
}

#[tokio::test]
async fn health_returns_503_when_scheduler_halted() {
    let clock = ManualClock::default();
    let state = SchedulerState {
        current_state: CollectorState::Error,
        consecutive_failures: 5,
        ..quiet_state(&clock)
    };
    let app = setup_test_app_with(MockFetcher::ok(), clock, state, Some(TEST_ADMIN_TOKEN)).await;

    let response = app
        .router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let json = json_body(response).await;
    assert_eq!(json["status"], "unhealthy");
    assert_eq!(json["scheduler"], "ERROR");
    assert_eq!(json["consecutive_failures"], 5);
}

#[tokio::test]
async fn scheduler_status_is_public() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(Request::get("/v1/scheduler").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["current_state"], "IDLE");
    assert_eq!(json["hourly_budget"], 100);
    assert_eq!(json["daily_budget"], 1000);
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unauthenticated_request_returns_401() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(
            Request::post("/v1/scheduler/trigger")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(app.fetcher.call_count(), 0);
}

#[tokio::test]
async fn wrong_admin_token_returns_401() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(
            Request::get("/v1/breakers")
                .header("authorization", "Bearer wrong-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn no_admin_token_returns_403() {
    let app = setup_test_app_no_auth().await;

    let response = app
        .router
        .oneshot(
            Request::post("/v1/scheduler/reset")
                .header("authorization", "Bearer any-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let json = json_body(response).await;
    assert_eq!(json["error"], "forbidden");
}

// ---------------------------------------------------------------------------
// Scheduler commands
// ---------------------------------------------------------------------------

#[tokio::test]
async fn trigger_collects_immediately() {
    let app = setup_test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(admin_post("/v1/scheduler/trigger"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["outcome"], "completed");
    assert_eq!(json["state"], "IDLE");
    assert_eq!(json["report"]["tickers_ok"], 1);
    assert_eq!(json["report"]["api_calls"], 1);
    assert_eq!(app.fetcher.call_count(), 1);

    let status = app.handle.status();
    assert_eq!(status.api_calls_this_hour, 1);
    assert_eq!(status.last_collection_ts, Some(app.clock.now()));
}

#[tokio::test]
async fn trigger_rejected_when_budget_exhausted() {
    let clock = ManualClock::default();
    let state = SchedulerState {
        api_calls_this_hour: 100,
        api_calls_today: 100,
        ..quiet_state(&clock)
    };
    let fetcher = MockFetcher::ok();
    let app = setup_test_app_with(fetcher.clone(), clock, state, Some(TEST_ADMIN_TOKEN)).await;

    let response = app
        .router
        .oneshot(admin_post("/v1/scheduler/trigger"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);

    let json = json_body(response).await;
    assert_eq!(json["outcome"], "rejected");
    assert_eq!(json["state"], "WAITING");
    assert_eq!(fetcher.call_count(), 0);
}

#[tokio::test]
async fn trigger_failure_returns_502_and_backs_off() {
    let clock = ManualClock::default();
    let state = quiet_state(&clock);
    let app = setup_test_app_with(
        MockFetcher::failing(network_error),
        clock,
        state,
        Some(TEST_ADMIN_TOKEN),
    )
    .await;

    let response = app
        .router
        .oneshot(admin_post("/v1/scheduler/trigger"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let json = json_body(response).await;
    assert_eq!(json["outcome"], "failed");
    assert_eq!(json["state"], "WAITING");

    let status = app.handle.status();
    assert_eq!(status.consecutive_failures, 1);
    assert!(status.backoff_until.is_some());
}

#[tokio::test]
async fn reset_clears_error_state() {
    let clock = ManualClock::default();
    let state = SchedulerState {
        current_state: CollectorState::Error,
        consecutive_failures: 5,
        ..quiet_state(&clock)
    };
    let app = setup_test_app_with(MockFetcher::ok(), clock, state, Some(TEST_ADMIN_TOKEN)).await;

    let response = app
        .router
        .clone()
        .oneshot(admin_post("/v1/scheduler/reset"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["current_state"], "IDLE");
    assert_eq!(json["consecutive_failures"], 0);
    assert!(json["backoff_until"].is_null());

    let response = app
        .router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn commands_return_503_after_scheduler_stops() {
    let mut app = setup_test_app().await;
    app.stop_scheduler().await;

    let response = app
        .router
        .oneshot(admin_post("/v1/scheduler/trigger"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let json = json_body(response).await;
    assert_eq!(json["error"], "scheduler_unavailable");
}

// ---------------------------------------------------------------------------
// Circuit breakers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn breakers_list_failures_and_reset() {
    let clock = ManualClock::default();
    let state = quiet_state(&clock);
    let app = setup_test_app_with(
        MockFetcher::failing(network_error),
        clock,
        state,
        Some(TEST_ADMIN_TOKEN),
    )
    .await;

    let response = app
        .router
        .clone()
        .oneshot(admin_post("/v1/scheduler/trigger"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let response = app
        .router
        .clone()
        .oneshot(admin_get("/v1/breakers"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["total"], 1);
    assert_eq!(json["breakers"][0]["endpoint"], "market-data");
    assert_eq!(json["breakers"][0]["state"], "closed");
    assert_eq!(json["breakers"][0]["consecutive_failures"], 1);

    let response = app
        .router
        .oneshot(admin_post("/v1/breakers/market-data/reset"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["state"], "closed");
    assert_eq!(json["consecutive_failures"], 0);
}

#[tokio::test]
async fn reset_unknown_breaker_returns_404() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(admin_post("/v1/breakers/nowhere/reset"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let json = json_body(response).await;
    assert_eq!(json["error"], "not_found");
}

// ---------------------------------------------------------------------------
// Database-backed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_and_trigger_with_database() {
    let (router, db, _container) = setup_test_app_with_db().await;

    let response = router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["database"], "ok");

    let response = router
        .oneshot(admin_post("/v1/scheduler/trigger"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let records = db.record_repo().latest_records("quotes").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].ticker, "SPY");

    let scans = db.record_repo().recent_scans(10).await.unwrap();
    assert!(!scans.is_empty());
}
