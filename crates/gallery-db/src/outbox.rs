//! Durable rows behind the notification relay.
//!
//! A row moves `pending → claimed` when a consumer takes it and leaves the
//! table when acknowledged. A nack puts it back to `pending` with a bumped
//! attempt; a rejection or exhausted retries mark it `dead`. Rows still
//! `claimed` when the process stops are released by
//! [`Database::recover_claimed_outbox`] on the next start.

use std::fmt;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::Serialize;
use sqlx::{sqlite::SqliteRow, Row};
use tracing::debug;
use uuid::Uuid;

use crate::{format_datetime, parse_datetime, Database};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxState {
    Pending,
    Claimed,
    Dead,
}

impl OutboxState {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxState::Pending => "pending",
            OutboxState::Claimed => "claimed",
            OutboxState::Dead => "dead",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(OutboxState::Pending),
            "claimed" => Ok(OutboxState::Claimed),
            "dead" => Ok(OutboxState::Dead),
            other => Err(anyhow!("unknown outbox state '{other}'")),
        }
    }
}

impl fmt::Display for OutboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboxRecord {
    pub seq: i64,
    pub message_id: Uuid,
    pub body: String,
    pub attempt: u32,
    pub state: OutboxState,
    pub reason: Option<String>,
    pub published_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Database {
    /// Appends a pending row and returns it with its assigned `seq`.
    pub async fn enqueue_outbox(
        &self,
        message_id: Uuid,
        body: &str,
        attempt: u32,
        published_at: DateTime<Utc>,
    ) -> Result<OutboxRecord> {
        let now = format_datetime(Utc::now());
        let row = sqlx::query(
            r#"
            INSERT INTO relay_messages
                (message_id, body, attempt, state, published_at, available_at, updated_at)
            VALUES (?, ?, ?, 'pending', ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(message_id.to_string())
        .bind(body)
        .bind(i64::from(attempt))
        .bind(format_datetime(published_at))
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        map_outbox(row)
    }

    /// Atomically claims the oldest available pending row.
    pub async fn claim_outbox(&self) -> Result<Option<OutboxRecord>> {
        let row = sqlx::query(
            r#"
            UPDATE relay_messages
            SET state = 'claimed', updated_at = ?
            WHERE seq = (
                SELECT seq FROM relay_messages
                WHERE state = 'pending'
                ORDER BY available_at ASC, seq ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(format_datetime(Utc::now()))
        .fetch_optional(&self.pool)
        .await?;

        row.map(map_outbox).transpose()
    }

    pub async fn delete_outbox(&self, seq: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM relay_messages WHERE seq = ?")
            .bind(seq)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Moves a claimed row to `state` with a new attempt count and reason.
    /// `Pending` rows go to the back of the queue.
    pub async fn settle_outbox(
        &self,
        seq: i64,
        state: OutboxState,
        attempt: u32,
        reason: &str,
    ) -> Result<bool> {
        let now = format_datetime(Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE relay_messages
            SET state = ?, attempt = ?, reason = ?, updated_at = ?,
                available_at = CASE WHEN ? = 'pending' THEN ? ELSE available_at END
            WHERE seq = ?
            "#,
        )
        .bind(state.as_str())
        .bind(i64::from(attempt))
        .bind(reason)
        .bind(&now)
        .bind(state.as_str())
        .bind(&now)
        .bind(seq)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Releases every `claimed` row back to `pending`. Only valid while no
    /// consumer is running against this database.
    pub async fn recover_claimed_outbox(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE relay_messages SET state = 'pending', updated_at = ? WHERE state = 'claimed'",
        )
        .bind(format_datetime(Utc::now()))
        .execute(&self.pool)
        .await?;
        let released = result.rows_affected();
        if released > 0 {
            debug!(released, "claimed relay rows released");
        }
        Ok(released)
    }

    pub async fn count_outbox(&self, state: OutboxState) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM relay_messages WHERE state = ?")
            .bind(state.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Dead rows, oldest parked first.
    pub async fn list_dead_outbox(&self) -> Result<Vec<OutboxRecord>> {
        let mut rows = sqlx::query(
            "SELECT * FROM relay_messages WHERE state = 'dead' ORDER BY updated_at ASC, seq ASC",
        )
        .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_outbox(row)?);
        }
        Ok(out)
    }

    /// Deletes dead rows parked before `before`.
    pub async fn purge_dead_outbox(&self, before: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM relay_messages WHERE state = 'dead' AND updated_at < ?")
                .bind(format_datetime(before))
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

fn map_outbox(row: SqliteRow) -> Result<OutboxRecord> {
    let message_id: String = row.try_get("message_id")?;
    let attempt: i64 = row.try_get("attempt")?;
    let state: String = row.try_get("state")?;

    Ok(OutboxRecord {
        seq: row.try_get("seq")?,
        message_id: Uuid::parse_str(&message_id)?,
        body: row.try_get("body")?,
        attempt: u32::try_from(attempt)?,
        state: OutboxState::parse(&state)?,
        reason: row.try_get("reason")?,
        published_at: parse_datetime(row.try_get("published_at")?)?,
        updated_at: parse_datetime(row.try_get("updated_at")?)?,
    })
}
