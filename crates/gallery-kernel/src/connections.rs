//! Presence records for realtime transports, keyed by connection id.
//!
//! A row exists exactly while its transport is open; the daemon clears the
//! table on start-up because transports never survive a restart.

use chrono::Utc;
use gallery_db::{ConnectionRecord, Database};
use tracing::{debug, info};

use crate::KernelError;

/// Tracks live realtime connections. Presence only; nothing is pushed to them.
#[derive(Clone)]
pub struct ConnectionRegistry {
    db: Database,
}

impl ConnectionRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Records `connection_id` with the current time. Reconnecting with the
    /// same id refreshes the timestamp.
    pub async fn on_connect(&self, connection_id: &str) -> Result<ConnectionRecord, KernelError> {
        if connection_id.trim().is_empty() {
            return Err(KernelError::MalformedInput(
                "connection id must not be empty".into(),
            ));
        }
        let record = self.db.put_connection(connection_id, Utc::now()).await?;
        info!(connection_id, "connection registered");
        Ok(record)
    }

    /// Removes `connection_id`. Unknown ids are a no-op.
    pub async fn on_disconnect(&self, connection_id: &str) -> Result<(), KernelError> {
        let removed = self.db.delete_connection(connection_id).await?;
        if removed {
            info!(connection_id, "connection removed");
        } else {
            debug!(connection_id, "disconnect for unknown connection");
        }
        Ok(())
    }

    pub async fn is_connected(&self, connection_id: &str) -> Result<bool, KernelError> {
        Ok(self.db.fetch_connection(connection_id).await?.is_some())
    }

    pub async fn list(&self) -> Result<Vec<ConnectionRecord>, KernelError> {
        Ok(self.db.list_connections().await?)
    }
}
