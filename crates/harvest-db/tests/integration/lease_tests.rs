use std::time::Duration;

use harvest_core::error::AppError;
use harvest_db::Database;

use crate::integration::common::setup_test_db;

#[tokio::test]
async fn second_writer_is_refused_until_release() {
    let (pool, _container) = setup_test_db().await;
    let db = Database::from_pool(pool);

    let lease = db.try_writer_lease().await.unwrap();

    let second = db.try_writer_lease().await;
    assert!(matches!(second, Err(AppError::InvalidState(_))));

    lease.release().await.unwrap();

    let again = db.try_writer_lease().await.unwrap();
    again.release().await.unwrap();
}

#[tokio::test]
async fn dropped_lease_frees_the_lock() {
    let (pool, _container) = setup_test_db().await;
    let db = Database::from_pool(pool);

    let lease = db.try_writer_lease().await.unwrap();
    drop(lease);

    // The server ends the session once it sees the closed socket.
    let mut reacquired = None;
    for _ in 0..50 {
        if let Ok(lease) = db.try_writer_lease().await {
            reacquired = Some(lease);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(reacquired.is_some(), "lock still held after the lease was dropped");
}

#[tokio::test]
async fn lease_does_not_block_state_reads() {
    let (pool, _container) = setup_test_db().await;
    let db = Database::from_pool(pool);

    let lease = db.try_writer_lease().await.unwrap();

    // Read-only consumers keep working while a writer holds the lease.
    db.state_store().read().await.unwrap();
    db.health_check().await.unwrap();

    lease.release().await.unwrap();
}
