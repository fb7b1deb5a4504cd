//! Integration tests for the Postgres-backed broker: leases, ack/nack,
//! redelivery limits, and dead-letter routing.

use std::time::Duration;

use serde_json::json;

use conductor_core::broker::{Broker, NackOutcome, PgBroker, task_queue};
use conductor_db::queries::queue as queue_db;
use conductor_test_utils::TestDb;

#[tokio::test]
async fn publish_claim_ack_roundtrip() {
    let db = TestDb::provision().await;
    let pool = db.pool.clone();
    let broker = PgBroker::new(pool.clone(), Duration::from_secs(60), 3);

    let body = json!({"task_id": "00000000-0000-0000-0000-000000000001", "attempt": 0});
    broker.publish("tasks.scraper", &body).await.expect("publish");

    let delivery = broker
        .claim("tasks.scraper")
        .await
        .expect("claim")
        .expect("message available");
    assert_eq!(delivery.body, body);
    assert_eq!(delivery.delivery_count, 1);

    // The lease hides the message from concurrent consumers.
    assert!(broker.claim("tasks.scraper").await.expect("claim").is_none());

    broker.ack(delivery.message_id).await.expect("ack");
    assert_eq!(
        queue_db::queue_depth(&pool, "tasks.scraper").await.expect("depth"),
        0
    );

    db.teardown().await;
}

#[tokio::test]
async fn queues_are_isolated_by_name() {
    let db = TestDb::provision().await;
    let pool = db.pool.clone();
    let broker = PgBroker::new(pool.clone(), Duration::from_secs(60), 3);

    broker
        .publish(&task_queue("scraper"), &json!({"n": 1}))
        .await
        .expect("publish");

    assert!(broker.claim(&task_queue("summarizer")).await.expect("claim").is_none());
    assert!(broker.claim(&task_queue("scraper")).await.expect("claim").is_some());

    db.teardown().await;
}

#[tokio::test]
async fn delayed_publish_is_invisible_until_available() {
    let db = TestDb::provision().await;
    let pool = db.pool.clone();
    let broker = PgBroker::new(pool.clone(), Duration::from_secs(60), 3);

    broker
        .publish_delayed("tasks.scraper", &json!({"n": 1}), Duration::from_secs(3600))
        .await
        .expect("publish delayed");

    assert!(
        broker.claim("tasks.scraper").await.expect("claim").is_none(),
        "delayed message must not deliver before its available_at"
    );
    assert_eq!(
        queue_db::queue_depth(&pool, "tasks.scraper").await.expect("depth"),
        1,
        "the message is durable while waiting"
    );

    db.teardown().await;
}

#[tokio::test]
async fn nack_requeues_until_redelivery_limit_then_dead_letters() {
    let db = TestDb::provision().await;
    let pool = db.pool.clone();
    let broker = PgBroker::new(pool.clone(), Duration::from_secs(60), 2);

    let task_id = uuid::Uuid::new_v4();
    let body = json!({"task_id": task_id.to_string(), "attempt": 0});
    broker.publish("tasks.scraper", &body).await.expect("publish");

    // First delivery fails; delivery_count (1) < limit (2), so requeue.
    let delivery = broker.claim("tasks.scraper").await.expect("claim").expect("first");
    let outcome = broker
        .nack(delivery.message_id, "worker rejected")
        .await
        .expect("nack");
    assert_eq!(outcome, NackOutcome::Requeued);

    // The redelivery backoff is ~1s; make the message claimable now.
    sqlx::query("UPDATE broker_messages SET available_at = now()")
        .execute(&pool)
        .await
        .expect("fast-forward");

    // Second delivery exhausts the limit.
    let delivery = broker.claim("tasks.scraper").await.expect("claim").expect("second");
    assert_eq!(delivery.delivery_count, 2);
    let outcome = broker
        .nack(delivery.message_id, "worker rejected again")
        .await
        .expect("nack");
    let NackOutcome::DeadLettered { dead_letter_id } = outcome else {
        panic!("expected dead-letter outcome, got {outcome:?}");
    };

    let dead = broker.dead_letters(10).await.expect("list");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, dead_letter_id);
    assert_eq!(dead[0].task_id, Some(task_id));
    assert_eq!(dead[0].reason, "worker rejected again");
    assert_eq!(
        queue_db::queue_depth(&pool, "tasks.scraper").await.expect("depth"),
        0,
        "dead-lettered message left the queue"
    );

    db.teardown().await;
}

#[tokio::test]
async fn dead_letter_replay_restores_the_message() {
    let db = TestDb::provision().await;
    let pool = db.pool.clone();
    let broker = PgBroker::new(pool.clone(), Duration::from_secs(60), 1);

    let body = json!({"task_id": uuid::Uuid::new_v4().to_string(), "attempt": 0});
    broker.publish("tasks.scraper", &body).await.expect("publish");
    let delivery = broker.claim("tasks.scraper").await.expect("claim").expect("delivery");
    let NackOutcome::DeadLettered { dead_letter_id } = broker
        .nack(delivery.message_id, "poisoned")
        .await
        .expect("nack")
    else {
        panic!("limit of 1 should dead-letter on first nack");
    };

    broker.replay_dead_letter(dead_letter_id).await.expect("replay");

    assert!(broker.dead_letters(10).await.expect("list").is_empty());
    let redelivered = broker
        .claim("tasks.scraper")
        .await
        .expect("claim")
        .expect("replayed message is claimable");
    assert_eq!(redelivered.body, body);

    db.teardown().await;
}

#[tokio::test]
async fn expired_lease_makes_message_claimable_again() {
    let db = TestDb::provision().await;
    let pool = db.pool.clone();
    // Zero-length lease: the claim expires immediately.
    let broker = PgBroker::new(pool.clone(), Duration::from_secs(0), 3);

    broker.publish("tasks.scraper", &json!({"n": 1})).await.expect("publish");

    let first = broker.claim("tasks.scraper").await.expect("claim").expect("first");
    let second = broker
        .claim("tasks.scraper")
        .await
        .expect("claim")
        .expect("expired lease redelivers");
    assert_eq!(first.message_id, second.message_id);
    assert_eq!(second.delivery_count, 2, "redelivery increments the count");

    db.teardown().await;
}
