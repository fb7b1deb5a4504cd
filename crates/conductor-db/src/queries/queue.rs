//! Database query functions for the `broker_messages` and
//! `broker_dead_letters` tables.
//!
//! Delivery uses `FOR UPDATE SKIP LOCKED` plus a lease column so several
//! consumers can drain one queue without double-delivering inside a lease
//! window. A message whose lease expires becomes consumable again, which
//! is where at-least-once semantics come from.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::models::{BrokerMessage, DeadLetter};

/// Publish a durable message onto a named queue.
pub async fn publish(pool: &PgPool, queue: &str, body: &serde_json::Value) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO broker_messages (queue, body) VALUES ($1, $2) RETURNING id",
    )
    .bind(queue)
    .bind(body)
    .fetch_one(pool)
    .await
    .context("failed to publish broker message")?;

    Ok(id)
}

/// Claim the next available message on a queue, if any.
///
/// Skips rows locked by concurrent consumers and rows with an unexpired
/// lease, increments `delivery_count`, and stamps a new lease. The claim
/// and the lease write happen in the caller's transaction.
pub async fn claim_next(
    conn: &mut PgConnection,
    queue: &str,
    lease_until: DateTime<Utc>,
) -> Result<Option<BrokerMessage>> {
    let message = sqlx::query_as::<_, BrokerMessage>(
        "UPDATE broker_messages \
         SET locked_until = $1, delivery_count = delivery_count + 1 \
         WHERE id = ( \
             SELECT id FROM broker_messages \
             WHERE queue = $2 \
               AND available_at <= now() \
               AND (locked_until IS NULL OR locked_until < now()) \
             ORDER BY id ASC \
             FOR UPDATE SKIP LOCKED \
             LIMIT 1 \
         ) \
         RETURNING *",
    )
    .bind(lease_until)
    .bind(queue)
    .fetch_optional(&mut *conn)
    .await
    .context("failed to claim broker message")?;

    Ok(message)
}

/// Acknowledge a delivery: the message is removed for good.
pub async fn delete_message(conn: &mut PgConnection, id: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM broker_messages WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await
        .context("failed to delete broker message")?;

    Ok(result.rows_affected())
}

/// Lock a single message row by id.
pub async fn get_message_locked(
    conn: &mut PgConnection,
    id: i64,
) -> Result<Option<BrokerMessage>> {
    let message =
        sqlx::query_as::<_, BrokerMessage>("SELECT * FROM broker_messages WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .context("failed to lock broker message")?;

    Ok(message)
}

/// Return a message to its queue: clear the lease and set when it becomes
/// available again (redelivery backoff).
pub async fn release_message(
    conn: &mut PgConnection,
    id: i64,
    available_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE broker_messages SET locked_until = NULL, available_at = $1 WHERE id = $2",
    )
    .bind(available_at)
    .bind(id)
    .execute(&mut *conn)
    .await
    .context("failed to release broker message")?;

    Ok(())
}

/// Route a message to the dead-letter table.
pub async fn insert_dead_letter(
    conn: &mut PgConnection,
    queue: &str,
    body: &serde_json::Value,
    task_id: Option<Uuid>,
    reason: &str,
    delivery_count: i32,
) -> Result<DeadLetter> {
    let dead = sqlx::query_as::<_, DeadLetter>(
        "INSERT INTO broker_dead_letters (queue, body, task_id, reason, delivery_count) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(queue)
    .bind(body)
    .bind(task_id)
    .bind(reason)
    .bind(delivery_count)
    .fetch_one(&mut *conn)
    .await
    .context("failed to insert dead letter")?;

    Ok(dead)
}

/// Fetch a dead letter by id.
pub async fn get_dead_letter(pool: &PgPool, id: i64) -> Result<Option<DeadLetter>> {
    let dead = sqlx::query_as::<_, DeadLetter>("SELECT * FROM broker_dead_letters WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch dead letter")?;

    Ok(dead)
}

/// List dead letters, newest first.
pub async fn list_dead_letters(pool: &PgPool, limit: i64) -> Result<Vec<DeadLetter>> {
    let dead = sqlx::query_as::<_, DeadLetter>(
        "SELECT * FROM broker_dead_letters ORDER BY id DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list dead letters")?;

    Ok(dead)
}

/// Remove a dead letter (after a successful replay).
pub async fn delete_dead_letter(conn: &mut PgConnection, id: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM broker_dead_letters WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await
        .context("failed to delete dead letter")?;

    Ok(result.rows_affected())
}

/// Count deliverable messages currently sitting on a queue.
pub async fn queue_depth(pool: &PgPool, queue: &str) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM broker_messages WHERE queue = $1")
            .bind(queue)
            .fetch_one(pool)
            .await
            .context("failed to count queue depth")?;

    Ok(count)
}
