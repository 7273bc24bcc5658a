use chrono::{TimeDelta, Utc};
use harvest_core::models::{DerivedRecord, NewScan, ScanOutcome};
use harvest_db::{Database, RecordRepository};

use crate::integration::common::setup_test_db;

fn record(ticker: &str, last: f64, computed_at: chrono::DateTime<Utc>) -> DerivedRecord {
    DerivedRecord {
        dataset: "quotes".into(),
        ticker: ticker.into(),
        payload: serde_json::json!({"last": last}),
        computed_at,
    }
}

#[tokio::test]
async fn save_records_and_read_latest_per_ticker() {
    let (pool, _container) = setup_test_db().await;
    let repo = RecordRepository::new(pool);
    let now = Utc::now();

    let written = repo
        .save_records(&[
            record("SPY", 510.0, now - TimeDelta::minutes(5)),
            record("SPY", 512.5, now),
            record("QQQ", 440.1, now),
        ])
        .await
        .unwrap();
    assert_eq!(written, 3);

    let latest = repo.latest_records("quotes").await.unwrap();
    assert_eq!(latest.len(), 2);
    let spy = latest.iter().find(|r| r.ticker == "SPY").unwrap();
    assert_eq!(spy.payload["last"], 512.5);
    assert!(repo.latest_records("chains").await.unwrap().is_empty());
}

#[tokio::test]
async fn scan_history_newest_first() {
    let (pool, _container) = setup_test_db().await;
    let repo = RecordRepository::new(pool);
    let now = Utc::now();

    for (i, outcome) in [ScanOutcome::Completed, ScanOutcome::Failed, ScanOutcome::Abandoned]
        .into_iter()
        .enumerate()
    {
        let started_at = now + TimeDelta::minutes(i as i64);
        repo.record_scan(&NewScan {
            started_at,
            finished_at: started_at + TimeDelta::seconds(3),
            outcome,
            tickers_ok: 2,
            tickers_failed: i as u32,
            api_calls: 2,
            error: (outcome != ScanOutcome::Completed).then(|| "upstream down".to_string()),
        })
        .await
        .unwrap();
    }

    let scans = repo.recent_scans(2).await.unwrap();
    assert_eq!(scans.len(), 2);
    assert_eq!(scans[0].outcome, ScanOutcome::Abandoned);
    assert_eq!(scans[1].outcome, ScanOutcome::Failed);
    assert_eq!(scans[1].tickers_failed, 1);
    assert_eq!(scans[1].error.as_deref(), Some("upstream down"));
}

#[tokio::test]
async fn database_facade_health_check() {
    let (pool, _container) = setup_test_db().await;
    let db = Database::from_pool(pool);

    db.health_check().await.unwrap();
    assert!(db.record_repo().recent_scans(10).await.unwrap().is_empty());
}
