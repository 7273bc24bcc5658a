use chrono::{TimeDelta, TimeZone, Utc};
use harvest_core::models::{CollectorState, SchedulerState};
use harvest_db::PgStateStore;

use crate::integration::common::setup_test_db;

fn sample_state() -> SchedulerState {
    let t = Utc.with_ymd_and_hms(2026, 4, 2, 14, 0, 0).unwrap();
    SchedulerState {
        current_state: CollectorState::Waiting,
        last_collection_ts: Some(t - TimeDelta::minutes(5)),
        next_collection_ts: Some(t + TimeDelta::minutes(5)),
        api_calls_today: 42,
        api_calls_this_hour: 7,
        hour_window_start: Some(t - TimeDelta::minutes(20)),
        consecutive_failures: 2,
        backoff_until: Some(t + TimeDelta::seconds(60)),
        updated_at: Some(t),
    }
}

#[tokio::test]
async fn read_without_row_returns_default() {
    let (pool, _container) = setup_test_db().await;
    let store = PgStateStore::new(pool);

    let state = store.read().await.unwrap();

    assert_eq!(state, SchedulerState::default());
}

#[tokio::test]
async fn write_then_read_roundtrips_every_field() {
    let (pool, _container) = setup_test_db().await;
    let store = PgStateStore::new(pool);
    let state = sample_state();

    store.write(&state).await.unwrap();

    assert_eq!(store.read().await.unwrap(), state);
}

#[tokio::test]
async fn write_upserts_single_row() {
    let (pool, _container) = setup_test_db().await;
    let store = PgStateStore::new(pool.clone());

    let mut state = sample_state();
    store.write(&state).await.unwrap();
    state.current_state = CollectorState::Idle;
    state.consecutive_failures = 0;
    store.write(&state).await.unwrap();

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM scheduler_state")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(
        store.read().await.unwrap().current_state,
        CollectorState::Idle
    );
}

#[tokio::test]
async fn corrupt_state_recovers_to_default() {
    let (pool, _container) = setup_test_db().await;
    let store = PgStateStore::new(pool.clone());
    store.write(&sample_state()).await.unwrap();

    sqlx::query("UPDATE scheduler_state SET current_state = 'EXPLODED' WHERE id = 1")
        .execute(&pool)
        .await
        .unwrap();

    assert_eq!(store.read().await.unwrap(), SchedulerState::default());
}

#[tokio::test]
async fn negative_counters_recover_to_default() {
    let (pool, _container) = setup_test_db().await;
    let store = PgStateStore::new(pool.clone());
    store.write(&sample_state()).await.unwrap();

    sqlx::query("UPDATE scheduler_state SET api_calls_today = -1 WHERE id = 1")
        .execute(&pool)
        .await
        .unwrap();

    assert_eq!(store.read().await.unwrap(), SchedulerState::default());
}
