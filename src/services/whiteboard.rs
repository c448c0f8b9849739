//! Whiteboard document engine — shared element list, versioning, snapshots.
//!
//! DESIGN
//! ======
//! The document is an ordered list of opaque elements plus view state. The
//! engine interprets nothing beyond element ids: update and delete match by
//! id, everything else is carried verbatim. Every accepted mutation bumps
//! `version` by exactly 1, stamps the author, and is persisted in full
//! before the in-memory copy is replaced — a failed save leaves memory
//! untouched and surfaces a store error (writes fail closed).
//!
//! Conflict policy is last-write-wins in server receipt order; the write
//! lock on the channel registry serializes mutations per room, so broadcast
//! order matches the order versions were assigned. That ordering is the
//! only consistency promise made to clients.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::state::AppState;

/// Snapshots kept per document; oldest evicted beyond this.
pub const SNAPSHOT_LIMIT: usize = 50;

/// A single mutation touching more than this many elements triggers an
/// automatic pre-mutation snapshot.
pub const SNAPSHOT_ELEMENT_THRESHOLD: usize = 10;

// =============================================================================
// TYPES
// =============================================================================

/// One drawable unit. Only `id` is interpreted; the body is opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: String,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

/// Point-in-time copy of a document's mutable fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub elements: Vec<Element>,
    pub view_state: Value,
    pub files: Value,
    pub ts: i64,
    pub author_id: Option<Uuid>,
    pub version: i64,
}

/// The shared whiteboard document for one room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Whiteboard {
    pub room_id: Uuid,
    pub elements: Vec<Element>,
    pub view_state: Value,
    pub files: Value,
    pub version: i64,
    pub last_modified_by: Option<Uuid>,
    pub last_modified_at: i64,
    pub snapshots: Vec<Snapshot>,
}

#[derive(Debug, thiserror::Error)]
pub enum WhiteboardError {
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("no snapshot at version {0}")]
    SnapshotNotFound(i64),
    #[error("not a member of room {0}")]
    NotMember(Uuid),
    #[error("only the room owner can restore snapshots")]
    OwnerOnly,
    #[error(transparent)]
    Store(#[from] DocumentStoreError),
}

impl crate::frame::ErrorCode for WhiteboardError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::ElementNotFound(_) => "E_ELEMENT_NOT_FOUND",
            Self::SnapshotNotFound(_) => "E_SNAPSHOT_NOT_FOUND",
            Self::NotMember(_) => "E_NOT_MEMBER",
            Self::OwnerOnly => "E_OWNER_ONLY",
            Self::Store(_) => "E_STORE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

// =============================================================================
// DOCUMENT MODEL
// =============================================================================

impl Whiteboard {
    /// A fresh, never-written document at version 0.
    #[must_use]
    pub fn empty(room_id: Uuid) -> Self {
        Self {
            room_id,
            elements: Vec::new(),
            view_state: Value::Object(Map::new()),
            files: Value::Object(Map::new()),
            version: 0,
            last_modified_by: None,
            last_modified_at: 0,
            snapshots: Vec::new(),
        }
    }

    /// Stamp an accepted mutation: version +1, author, time.
    fn commit(&mut self, author: Uuid, now_ms: i64) {
        self.version += 1;
        self.last_modified_by = Some(author);
        self.last_modified_at = now_ms;
    }

    /// Append a snapshot of the current state, evicting the oldest beyond
    /// [`SNAPSHOT_LIMIT`].
    fn push_snapshot(&mut self, author: Uuid, now_ms: i64) {
        self.snapshots.push(Snapshot {
            elements: self.elements.clone(),
            view_state: self.view_state.clone(),
            files: self.files.clone(),
            ts: now_ms,
            author_id: Some(author),
            version: self.version,
        });
        if self.snapshots.len() > SNAPSHOT_LIMIT {
            let excess = self.snapshots.len() - SNAPSHOT_LIMIT;
            self.snapshots.drain(..excess);
        }
    }

    /// How many elements differ between the current list and `incoming`:
    /// added + removed + modified, matched by id.
    #[must_use]
    pub fn changed_count(&self, incoming: &[Element]) -> usize {
        let current: HashMap<&str, &Element> =
            self.elements.iter().map(|e| (e.id.as_str(), e)).collect();
        let next: HashMap<&str, &Element> = incoming.iter().map(|e| (e.id.as_str(), e)).collect();

        let removed = current.keys().filter(|id| !next.contains_key(*id)).count();
        let added_or_modified = next
            .iter()
            .filter(|(id, el)| match current.get(**id) {
                None => true,
                Some(existing) => existing != *el,
            })
            .count();

        removed + added_or_modified
    }

    /// Bulk replace of the element list and view state (full-document sync).
    /// Returns how many elements changed. Takes an automatic pre-mutation
    /// snapshot when the change is larger than the threshold, so a
    /// destructive bulk overwrite stays recoverable.
    pub fn replace(
        &mut self,
        elements: Vec<Element>,
        view_state: Option<Value>,
        files: Option<Value>,
        author: Uuid,
        now_ms: i64,
    ) -> usize {
        let changed = self.changed_count(&elements);
        if changed > SNAPSHOT_ELEMENT_THRESHOLD {
            self.push_snapshot(author, now_ms);
        }

        self.elements = elements;
        if let Some(view_state) = view_state {
            self.view_state = view_state;
        }
        if let Some(files) = files {
            self.files = files;
        }
        self.commit(author, now_ms);
        changed
    }

    /// Append a new element.
    pub fn create_element(&mut self, element: Element, author: Uuid, now_ms: i64) {
        self.elements.push(element);
        self.commit(author, now_ms);
    }

    /// Merge a patch into the element with the given id. The id itself is
    /// immutable.
    ///
    /// # Errors
    ///
    /// `ElementNotFound` when no element carries the id; the document is
    /// unchanged and the version does not advance.
    pub fn update_element(
        &mut self,
        id: &str,
        patch: &Map<String, Value>,
        author: Uuid,
        now_ms: i64,
    ) -> Result<Element, WhiteboardError> {
        let element = self
            .elements
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| WhiteboardError::ElementNotFound(id.to_string()))?;

        for (key, value) in patch {
            if key == "id" {
                continue;
            }
            element.body.insert(key.clone(), value.clone());
        }
        let updated = element.clone();
        self.commit(author, now_ms);
        Ok(updated)
    }

    /// Remove the element with the given id.
    ///
    /// # Errors
    ///
    /// `ElementNotFound` when absent; version does not advance.
    pub fn delete_element(&mut self, id: &str, author: Uuid, now_ms: i64) -> Result<(), WhiteboardError> {
        let index = self
            .elements
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| WhiteboardError::ElementNotFound(id.to_string()))?;

        self.elements.remove(index);
        self.commit(author, now_ms);
        Ok(())
    }

    /// Materialize the current state into the snapshot list. Not a document
    /// mutation: the version does not advance.
    pub fn take_snapshot(&mut self, author: Uuid, now_ms: i64) -> i64 {
        self.push_snapshot(author, now_ms);
        self.version
    }

    /// Replace the document's mutable fields from the snapshot taken at
    /// `version`. Bumps the live version by 1 like any other mutation.
    ///
    /// # Errors
    ///
    /// `SnapshotNotFound` when no snapshot carries that version.
    pub fn restore(&mut self, version: i64, author: Uuid, now_ms: i64) -> Result<(), WhiteboardError> {
        let snapshot = self
            .snapshots
            .iter()
            .rev()
            .find(|s| s.version == version)
            .cloned()
            .ok_or(WhiteboardError::SnapshotNotFound(version))?;

        self.elements = snapshot.elements;
        self.view_state = snapshot.view_state;
        self.files = snapshot.files;
        self.commit(author, now_ms);
        Ok(())
    }
}

// =============================================================================
// DOCUMENT STORE
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DocumentStoreError {
    #[error("document store failed: {0}")]
    Store(#[from] sqlx::Error),
    #[error("document store unavailable")]
    Unavailable,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Load the persisted document for a room, if any exists yet.
    async fn load(&self, room_id: Uuid) -> Result<Option<Whiteboard>, DocumentStoreError>;

    /// Persist the full document state.
    async fn save(&self, doc: &Whiteboard) -> Result<(), DocumentStoreError>;
}

pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn load(&self, room_id: Uuid) -> Result<Option<Whiteboard>, DocumentStoreError> {
        let row = sqlx::query(
            "SELECT room_id, elements, view_state, files, version, last_modified_by, last_modified_at, snapshots \
             FROM whiteboards WHERE room_id = $1",
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Whiteboard {
            room_id: r.get("room_id"),
            elements: serde_json::from_value(r.get::<Value, _>("elements")).unwrap_or_default(),
            view_state: r.get("view_state"),
            files: r.get("files"),
            version: r.get("version"),
            last_modified_by: r.get("last_modified_by"),
            last_modified_at: r.get("last_modified_at"),
            snapshots: serde_json::from_value(r.get::<Value, _>("snapshots")).unwrap_or_default(),
        }))
    }

    async fn save(&self, doc: &Whiteboard) -> Result<(), DocumentStoreError> {
        sqlx::query(
            "INSERT INTO whiteboards (room_id, elements, view_state, files, version, last_modified_by, last_modified_at, snapshots) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (room_id) DO UPDATE SET \
                 elements = EXCLUDED.elements, view_state = EXCLUDED.view_state, \
                 files = EXCLUDED.files, version = EXCLUDED.version, \
                 last_modified_by = EXCLUDED.last_modified_by, \
                 last_modified_at = EXCLUDED.last_modified_at, \
                 snapshots = EXCLUDED.snapshots",
        )
        .bind(doc.room_id)
        .bind(serde_json::to_value(&doc.elements).unwrap_or_default())
        .bind(&doc.view_state)
        .bind(&doc.files)
        .bind(doc.version)
        .bind(doc.last_modified_by)
        .bind(doc.last_modified_at)
        .bind(serde_json::to_value(&doc.snapshots).unwrap_or_default())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Process-local document store for tests and single-instance runs.
#[derive(Default)]
pub struct MemoryDocumentStore {
    docs: Mutex<HashMap<Uuid, Whiteboard>>,
}

impl MemoryDocumentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn load(&self, room_id: Uuid) -> Result<Option<Whiteboard>, DocumentStoreError> {
        Ok(self
            .docs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&room_id)
            .cloned())
    }

    async fn save(&self, doc: &Whiteboard) -> Result<(), DocumentStoreError> {
        self.docs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(doc.room_id, doc.clone());
        Ok(())
    }
}

// =============================================================================
// SERVICE
// =============================================================================

/// Read the current document: channel cache, then the store, then an empty
/// version-0 document. Caches into the channel when one exists.
pub async fn load_document(state: &AppState, room_id: Uuid) -> Result<Whiteboard, WhiteboardError> {
    {
        let rooms = state.rooms.read().await;
        if let Some(channel) = rooms.get(&room_id)
            && let Some(doc) = &channel.doc
        {
            return Ok(doc.clone());
        }
    }

    let doc = state
        .documents
        .load(room_id)
        .await?
        .unwrap_or_else(|| Whiteboard::empty(room_id));

    let mut rooms = state.rooms.write().await;
    if let Some(channel) = rooms.get_mut(&room_id)
        && channel.doc.is_none()
    {
        channel.doc = Some(doc.clone());
    }
    Ok(doc)
}

/// Apply one mutation under the room's channel lock: hydrate if needed,
/// run the closure on a working copy, persist, then commit to memory.
///
/// Persisting before committing is what makes writes fail closed — a store
/// failure leaves the in-memory document and its version untouched.
///
/// # Errors
///
/// `NotMember` when the room has no live channel, whatever the closure
/// returns, or a store error from hydration or persistence.
pub async fn mutate<R>(
    state: &AppState,
    room_id: Uuid,
    f: impl FnOnce(&mut Whiteboard) -> Result<R, WhiteboardError>,
) -> Result<(Whiteboard, R), WhiteboardError> {
    let mut rooms = state.rooms.write().await;
    let channel = rooms
        .get_mut(&room_id)
        .ok_or(WhiteboardError::NotMember(room_id))?;

    let mut next = match &channel.doc {
        Some(doc) => doc.clone(),
        None => state
            .documents
            .load(room_id)
            .await?
            .unwrap_or_else(|| Whiteboard::empty(room_id)),
    };

    let out = f(&mut next)?;
    state.documents.save(&next).await?;
    channel.doc = Some(next.clone());
    Ok((next, out))
}

#[cfg(test)]
#[path = "whiteboard_test.rs"]
mod tests;
