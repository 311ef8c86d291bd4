//! Gallery persistence layer: group/image/connection metadata and object storage.
//!
//! This crate offers an async API around SQLite (sqlx) for the metadata tables
//! the ingestion pipeline relies on, plus the [`storage`] module that holds
//! original and derived image bytes. Image records are written once and never
//! updated; connection rows follow overwrite semantics keyed by the transport
//! identifier.

pub mod outbox;
pub mod storage;

use std::{path::Path, str::FromStr, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::TryStreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

pub use outbox::{OutboxRecord, OutboxState};
pub use storage::{LocalObjectStore, MemoryObjectStore, ObjectStorage, SharedObjectStorage, StorageError};

/// Default SQLite busy timeout in milliseconds when the DB is under load.
const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Primary entry point to the metadata store.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes (or creates) a connection pool to the SQLite database located at
    /// the given URL (e.g. `sqlite:///var/lib/gallery/gallery.db`).
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS));

        // An in-memory database lives and dies with a single connection.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Connects to a file path via `sqlite://` scheme.
    pub async fn connect_file(path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}", path.display());
        Self::connect(&url).await
    }

    /// Inserts or replaces a group. Group lifecycle is owned elsewhere; this is
    /// the seeding hook used by operators and tests.
    pub async fn put_group(&self, group: NewGroup<'_>) -> Result<GroupRecord> {
        let now = format_datetime(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO groups (id, name, description, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description
            "#,
        )
        .bind(group.id)
        .bind(group.name)
        .bind(group.description)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.fetch_group(group.id)
            .await?
            .ok_or_else(|| anyhow!("group '{}' upserted but missing when reloaded", group.id))
    }

    /// Point lookup used for the best-effort existence check at ingestion.
    pub async fn fetch_group(&self, id: &str) -> Result<Option<GroupRecord>> {
        let row = sqlx::query("SELECT * FROM groups WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(map_group).transpose()
    }

    pub async fn group_exists(&self, id: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM groups WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Lists all groups, newest first.
    pub async fn list_groups(&self) -> Result<Vec<GroupRecord>> {
        let mut rows = sqlx::query("SELECT * FROM groups ORDER BY created_at DESC, id ASC")
            .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_group(row)?);
        }
        Ok(out)
    }

    /// Persists a new image with a single insert and returns the stored row.
    ///
    /// There is no existence check on `image_id`; a collision surfaces as
    /// [`RecordError::DuplicateImage`].
    pub async fn create_image(&self, image: NewImage) -> Result<ImageRecord> {
        let attributes =
            serde_json::to_string(&image.attributes).context("serializing image attributes")?;

        sqlx::query(
            r#"
            INSERT INTO images (image_id, group_id, created_at, image_url, attributes)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(image.image_id.to_string())
        .bind(&image.group_id)
        .bind(format_datetime(image.timestamp))
        .bind(&image.image_url)
        .bind(attributes)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                anyhow::Error::new(RecordError::DuplicateImage(image.image_id))
            } else {
                err.into()
            }
        })?;

        debug!(image_id = %image.image_id, group_id = %image.group_id, "image row inserted");

        self.fetch_image(image.image_id).await?.ok_or_else(|| {
            anyhow!(
                "image inserted but missing when reloaded (image_id={}, group_id={})",
                image.image_id,
                image.group_id
            )
        })
    }

    /// Secondary lookup through `images_image_id_idx`.
    pub async fn fetch_image(&self, image_id: Uuid) -> Result<Option<ImageRecord>> {
        let row = sqlx::query("SELECT * FROM images INDEXED BY images_image_id_idx WHERE image_id = ?")
            .bind(image_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(map_image).transpose()
    }

    /// Lists the images of a group ordered by creation time descending.
    pub async fn list_images(&self, group_id: &str) -> Result<Vec<ImageRecord>> {
        let mut rows = sqlx::query(
            "SELECT * FROM images WHERE group_id = ? ORDER BY created_at DESC, rowid DESC",
        )
        .bind(group_id)
        .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_image(row)?);
        }
        Ok(out)
    }

    pub async fn count_images(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM images")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Upserts a connection row. Reconnecting under the same id overwrites the
    /// timestamp.
    pub async fn put_connection(
        &self,
        id: &str,
        connected_at: DateTime<Utc>,
    ) -> Result<ConnectionRecord> {
        let stamp = format_datetime(connected_at);
        sqlx::query(
            r#"
            INSERT INTO connections (id, connected_at) VALUES (?, ?)
            ON CONFLICT(id) DO UPDATE SET connected_at = excluded.connected_at
            "#,
        )
        .bind(id)
        .bind(&stamp)
        .execute(&self.pool)
        .await?;

        Ok(ConnectionRecord {
            id: id.to_owned(),
            timestamp: parse_datetime(stamp)?,
        })
    }

    /// Deletes a connection row. Returns whether a row existed; a missing id is
    /// not an error.
    pub async fn delete_connection(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM connections WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drops every connection row. The daemon owns every transport, so rows
    /// left by a previous process are stale by the time it starts.
    pub async fn clear_connections(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM connections")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn fetch_connection(&self, id: &str) -> Result<Option<ConnectionRecord>> {
        let row = sqlx::query("SELECT * FROM connections WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(map_connection).transpose()
    }

    pub async fn list_connections(&self) -> Result<Vec<ConnectionRecord>> {
        let mut rows = sqlx::query("SELECT * FROM connections ORDER BY connected_at DESC, id ASC")
            .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_connection(row)?);
        }
        Ok(out)
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE"))
}

/// Fixed-width RFC 3339 so that text ordering in SQLite matches time ordering.
pub fn format_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid RFC3339 timestamp '{}': {}", value, err))
}

fn map_group(row: SqliteRow) -> Result<GroupRecord> {
    Ok(GroupRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        timestamp: parse_datetime(row.try_get("created_at")?)?,
    })
}

fn map_image(row: SqliteRow) -> Result<ImageRecord> {
    let image_id: String = row.try_get("image_id")?;
    let attributes_json: String = row.try_get("attributes")?;

    Ok(ImageRecord {
        group_id: row.try_get("group_id")?,
        image_id: Uuid::parse_str(&image_id)?,
        timestamp: parse_datetime(row.try_get("created_at")?)?,
        image_url: row.try_get("image_url")?,
        attributes: serde_json::from_str(&attributes_json)
            .context("failed to deserialize image attributes JSON")?,
    })
}

fn map_connection(row: SqliteRow) -> Result<ConnectionRecord> {
    Ok(ConnectionRecord {
        id: row.try_get("id")?,
        timestamp: parse_datetime(row.try_get("connected_at")?)?,
    })
}

/// Typed errors callers may need to branch on; returned inside `anyhow::Error`.
#[derive(Debug, Error, Clone)]
pub enum RecordError {
    #[error("image '{0}' already exists")]
    DuplicateImage(Uuid),
}

/// Input payload for group seeding.
#[derive(Debug, Clone, Copy)]
pub struct NewGroup<'a> {
    pub id: &'a str,
    pub name: Option<&'a str>,
    pub description: Option<&'a str>,
}

impl<'a> NewGroup<'a> {
    pub fn with_id(id: &'a str) -> Self {
        Self {
            id,
            name: None,
            description: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupRecord {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Fully assembled image row, server fields already decided by the caller.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub group_id: String,
    pub image_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub image_url: String,
    pub attributes: Map<String, Value>,
}

/// Persisted image metadata. Caller attributes are flattened next to the
/// server-assigned fields on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub group_id: String,
    pub image_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub image_url: String,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
}

/// Helper trait for background jobs that need a graceful shutdown.
#[async_trait]
pub trait BackgroundWorker: Send + Sync {
    async fn run(self: Arc<Self>) -> Result<()>;
}

/// A guard that owns the join handle of a running worker.
pub struct WorkerGuard {
    handle: JoinHandle<Result<()>>,
}

impl WorkerGuard {
    pub fn new(handle: JoinHandle<Result<()>>) -> Self {
        Self { handle }
    }

    pub async fn join(self) -> Result<()> {
        self.handle.await??;
        Ok(())
    }
}

/// Owns the join handles of long-running workers (the derivation worker) so the
/// daemon can surface their errors on shutdown.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<Vec<WorkerGuard>>,
}

impl WorkerRegistry {
    pub fn spawn<W>(&self, worker: Arc<W>)
    where
        W: BackgroundWorker + 'static,
    {
        let handle = tokio::spawn(worker.run());
        self.workers.write().push(WorkerGuard::new(handle));
    }

    pub async fn wait_all(self) -> Result<()> {
        for guard in self.workers.into_inner() {
            guard.join().await?;
        }
        Ok(())
    }
}
