//! Presence store — the shared registry of who occupies which room.
//!
//! ARCHITECTURE
//! ============
//! Presence is the one piece of realtime state that must outlive a process
//! and be visible to every server instance behind the load balancer, so it
//! lives behind a store trait with a Postgres implementation for deployment
//! and a process-local one for tests and single-instance runs. All writes
//! are single-statement atomic upserts keyed by `(room_id, identity_id)`,
//! which is what enforces the one-record-per-member invariant: a reconnect
//! replaces, never duplicates.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::{PgPool, Row};
use uuid::Uuid;

// =============================================================================
// TYPES
// =============================================================================

/// One member's live occupancy of one room.
#[derive(Debug, Clone, Serialize)]
pub struct PresenceRecord {
    pub room_id: Uuid,
    pub identity_id: Uuid,
    pub conn_id: Uuid,
    pub name: String,
    pub avatar_url: Option<String>,
    pub joined_at: i64,
    pub last_seen_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("presence store failed: {0}")]
    Store(#[from] sqlx::Error),
}

impl crate::frame::ErrorCode for PresenceError {
    fn error_code(&self) -> &'static str {
        "E_STORE"
    }

    fn retryable(&self) -> bool {
        true
    }
}

// =============================================================================
// TRAIT
// =============================================================================

#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Insert or replace the record for `(room_id, identity_id)`. On
    /// replace, `joined_at` of the existing record is preserved.
    async fn upsert(&self, record: &PresenceRecord) -> Result<(), PresenceError>;

    /// Fetch one member's record.
    async fn get(&self, room_id: Uuid, identity_id: Uuid) -> Result<Option<PresenceRecord>, PresenceError>;

    /// All records for a room, oldest join first.
    async fn list(&self, room_id: Uuid) -> Result<Vec<PresenceRecord>, PresenceError>;

    /// Current occupancy of a room.
    async fn count(&self, room_id: Uuid) -> Result<u64, PresenceError>;

    /// Refresh `last_seen_at` for a member. No-op if the record is gone.
    async fn touch(&self, room_id: Uuid, identity_id: Uuid, now_ms: i64) -> Result<(), PresenceError>;

    /// Remove a member's record. Returns whether a record was removed.
    async fn remove(&self, room_id: Uuid, identity_id: Uuid) -> Result<bool, PresenceError>;

    /// Remove a member's record only if it still belongs to `conn_id`.
    /// Guards disconnect cleanup against clobbering a newer connection's
    /// record. Returns whether a record was removed.
    async fn remove_if_conn(
        &self,
        room_id: Uuid,
        identity_id: Uuid,
        conn_id: Uuid,
    ) -> Result<bool, PresenceError>;
}

// =============================================================================
// POSTGRES IMPLEMENTATION
// =============================================================================

pub struct PgPresenceStore {
    pool: PgPool,
}

impl PgPresenceStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PresenceStore for PgPresenceStore {
    async fn upsert(&self, record: &PresenceRecord) -> Result<(), PresenceError> {
        sqlx::query(
            "INSERT INTO room_presence (room_id, identity_id, conn_id, name, avatar_url, joined_at, last_seen_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (room_id, identity_id) DO UPDATE SET \
                 conn_id = EXCLUDED.conn_id, name = EXCLUDED.name, \
                 avatar_url = EXCLUDED.avatar_url, last_seen_at = EXCLUDED.last_seen_at",
        )
        .bind(record.room_id)
        .bind(record.identity_id)
        .bind(record.conn_id)
        .bind(&record.name)
        .bind(&record.avatar_url)
        .bind(record.joined_at)
        .bind(record.last_seen_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, room_id: Uuid, identity_id: Uuid) -> Result<Option<PresenceRecord>, PresenceError> {
        let row = sqlx::query(
            "SELECT room_id, identity_id, conn_id, name, avatar_url, joined_at, last_seen_at \
             FROM room_presence WHERE room_id = $1 AND identity_id = $2",
        )
        .bind(room_id)
        .bind(identity_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| row_to_record(&r)))
    }

    async fn list(&self, room_id: Uuid) -> Result<Vec<PresenceRecord>, PresenceError> {
        let rows = sqlx::query(
            "SELECT room_id, identity_id, conn_id, name, avatar_url, joined_at, last_seen_at \
             FROM room_presence WHERE room_id = $1 ORDER BY joined_at ASC, identity_id ASC",
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    async fn count(&self, room_id: Uuid) -> Result<u64, PresenceError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM room_presence WHERE room_id = $1")
            .bind(room_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn touch(&self, room_id: Uuid, identity_id: Uuid, now_ms: i64) -> Result<(), PresenceError> {
        sqlx::query(
            "UPDATE room_presence SET last_seen_at = $3 WHERE room_id = $1 AND identity_id = $2",
        )
        .bind(room_id)
        .bind(identity_id)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, room_id: Uuid, identity_id: Uuid) -> Result<bool, PresenceError> {
        let result = sqlx::query("DELETE FROM room_presence WHERE room_id = $1 AND identity_id = $2")
            .bind(room_id)
            .bind(identity_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_if_conn(
        &self,
        room_id: Uuid,
        identity_id: Uuid,
        conn_id: Uuid,
    ) -> Result<bool, PresenceError> {
        let result = sqlx::query(
            "DELETE FROM room_presence WHERE room_id = $1 AND identity_id = $2 AND conn_id = $3",
        )
        .bind(room_id)
        .bind(identity_id)
        .bind(conn_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> PresenceRecord {
    PresenceRecord {
        room_id: row.get("room_id"),
        identity_id: row.get("identity_id"),
        conn_id: row.get("conn_id"),
        name: row.get("name"),
        avatar_url: row.get("avatar_url"),
        joined_at: row.get("joined_at"),
        last_seen_at: row.get("last_seen_at"),
    }
}

// =============================================================================
// IN-MEMORY IMPLEMENTATION
// =============================================================================

/// Process-local presence. Same contract, no durability; used by tests and
/// single-instance runs.
#[derive(Default)]
pub struct MemoryPresenceStore {
    records: Mutex<HashMap<(Uuid, Uuid), PresenceRecord>>,
}

impl MemoryPresenceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(Uuid, Uuid), PresenceRecord>> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn upsert(&self, record: &PresenceRecord) -> Result<(), PresenceError> {
        let mut records = self.lock();
        let key = (record.room_id, record.identity_id);
        let mut next = record.clone();
        if let Some(existing) = records.get(&key) {
            next.joined_at = existing.joined_at;
        }
        records.insert(key, next);
        Ok(())
    }

    async fn get(&self, room_id: Uuid, identity_id: Uuid) -> Result<Option<PresenceRecord>, PresenceError> {
        Ok(self.lock().get(&(room_id, identity_id)).cloned())
    }

    async fn list(&self, room_id: Uuid) -> Result<Vec<PresenceRecord>, PresenceError> {
        let mut members: Vec<PresenceRecord> = self
            .lock()
            .values()
            .filter(|r| r.room_id == room_id)
            .cloned()
            .collect();
        members.sort_by_key(|r| (r.joined_at, r.identity_id));
        Ok(members)
    }

    async fn count(&self, room_id: Uuid) -> Result<u64, PresenceError> {
        Ok(self.lock().values().filter(|r| r.room_id == room_id).count() as u64)
    }

    async fn touch(&self, room_id: Uuid, identity_id: Uuid, now_ms: i64) -> Result<(), PresenceError> {
        if let Some(record) = self.lock().get_mut(&(room_id, identity_id)) {
            record.last_seen_at = now_ms;
        }
        Ok(())
    }

    async fn remove(&self, room_id: Uuid, identity_id: Uuid) -> Result<bool, PresenceError> {
        Ok(self.lock().remove(&(room_id, identity_id)).is_some())
    }

    async fn remove_if_conn(
        &self,
        room_id: Uuid,
        identity_id: Uuid,
        conn_id: Uuid,
    ) -> Result<bool, PresenceError> {
        let mut records = self.lock();
        let key = (room_id, identity_id);
        match records.get(&key) {
            Some(record) if record.conn_id == conn_id => {
                records.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
