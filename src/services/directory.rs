//! Directory — read access to the durable user/room/session records.
//!
//! ARCHITECTURE
//! ============
//! Rooms, users, memberships, and sessions are owned by the wider product
//! (admin CRUD, billing, signup) and are consumed here read-only. The trait
//! keeps the realtime core testable without a live database and keeps model
//! relations id-based: records carry ids, never embedded objects, and every
//! hop is an explicit lookup.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::services::plan::PlanTier;

// =============================================================================
// TYPES
// =============================================================================

/// A room as the rest of the product stores it.
#[derive(Debug, Clone)]
pub struct RoomRecord {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    pub is_public: bool,
}

/// A persisted user.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: Uuid,
    pub name: String,
    pub avatar_url: Option<String>,
    pub plan: PlanTier,
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory query failed: {0}")]
    Store(#[from] sqlx::Error),
}

// =============================================================================
// TRAIT
// =============================================================================

#[async_trait]
pub trait Directory: Send + Sync {
    /// Fetch a room by id.
    async fn room(&self, room_id: Uuid) -> Result<Option<RoomRecord>, DirectoryError>;

    /// Whether a user is on the room's member roster.
    async fn is_room_member(&self, room_id: Uuid, user_id: Uuid) -> Result<bool, DirectoryError>;

    /// Fetch a user by id.
    async fn user(&self, user_id: Uuid) -> Result<Option<UserRecord>, DirectoryError>;

    /// Whether the user has at least one live session record.
    async fn session_exists(&self, user_id: Uuid) -> Result<bool, DirectoryError>;
}

// =============================================================================
// POSTGRES IMPLEMENTATION
// =============================================================================

pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Directory for PgDirectory {
    async fn room(&self, room_id: Uuid) -> Result<Option<RoomRecord>, DirectoryError> {
        let row = sqlx::query("SELECT id, name, owner_id, is_public FROM rooms WHERE id = $1")
            .bind(room_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| RoomRecord {
            id: r.get("id"),
            name: r.get("name"),
            owner_id: r.get("owner_id"),
            is_public: r.get("is_public"),
        }))
    }

    async fn is_room_member(&self, room_id: Uuid, user_id: Uuid) -> Result<bool, DirectoryError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM room_members WHERE room_id = $1 AND user_id = $2)",
        )
        .bind(room_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn user(&self, user_id: Uuid) -> Result<Option<UserRecord>, DirectoryError> {
        let row = sqlx::query("SELECT id, name, avatar_url, plan FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| UserRecord {
            id: r.get("id"),
            name: r.get("name"),
            avatar_url: r.get("avatar_url"),
            plan: PlanTier::parse(r.get::<String, _>("plan").as_str()),
        }))
    }

    async fn session_exists(&self, user_id: Uuid) -> Result<bool, DirectoryError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM sessions WHERE user_id = $1 AND expires_at > now())",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

// =============================================================================
// IN-MEMORY IMPLEMENTATION
// =============================================================================

/// Process-local directory. Used by tests and single-instance dev runs.
#[derive(Default)]
pub struct MemoryDirectory {
    rooms: Mutex<HashMap<Uuid, RoomRecord>>,
    users: Mutex<HashMap<Uuid, UserRecord>>,
    members: Mutex<HashSet<(Uuid, Uuid)>>,
    sessions: Mutex<HashSet<Uuid>>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_room(&self, room: RoomRecord) {
        self.rooms
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(room.id, room);
    }

    pub fn add_user(&self, user: UserRecord) {
        self.users
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(user.id, user);
    }

    pub fn add_member(&self, room_id: Uuid, user_id: Uuid) {
        self.members
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert((room_id, user_id));
    }

    pub fn add_session(&self, user_id: Uuid) {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(user_id);
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn room(&self, room_id: Uuid) -> Result<Option<RoomRecord>, DirectoryError> {
        Ok(self
            .rooms
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&room_id)
            .cloned())
    }

    async fn is_room_member(&self, room_id: Uuid, user_id: Uuid) -> Result<bool, DirectoryError> {
        Ok(self
            .members
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(&(room_id, user_id)))
    }

    async fn user(&self, user_id: Uuid) -> Result<Option<UserRecord>, DirectoryError> {
        Ok(self
            .users
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&user_id)
            .cloned())
    }

    async fn session_exists(&self, user_id: Uuid) -> Result<bool, DirectoryError> {
        Ok(self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(&user_id))
    }
}
