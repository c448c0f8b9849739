//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! Every external collaborator — the user/room directory, the presence
//! registry, the document and chat stores, the rate counters — sits behind
//! a trait object, so the realtime core runs identically against Postgres
//! in deployment and against in-memory fakes in tests. The only in-process
//! shared mutable state is the room channel registry: who is connected to
//! this instance and the cached document per room.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::frame::Frame;
use crate::rate_limit::{CounterStore, EventLimiter, MinIntervalGate, env_parse};
use crate::services::chat::ChatStore;
use crate::services::directory::Directory;
use crate::services::identity::{AuthConfig, Identity};
use crate::services::presence::PresenceStore;
use crate::services::whiteboard::{DocumentStore, Whiteboard};

const DEFAULT_WRITE_MIN_INTERVAL_MS: u64 = 100;
const DEFAULT_CURSOR_MIN_INTERVAL_MS: u64 = 50;

/// Outbound queue depth per connection before broadcasts are dropped.
pub const CLIENT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// ROOM CHANNEL
// =============================================================================

/// One connection attached to a room channel.
pub struct ConnectedMember {
    pub identity: Identity,
    pub tx: mpsc::Sender<Frame>,
}

/// Per-room live state on this instance: attached connections and the
/// cached whiteboard document.
pub struct RoomChannel {
    /// Connected clients: `conn_id` -> member.
    pub clients: HashMap<Uuid, ConnectedMember>,
    /// Cached document; hydrated from the store on first use.
    pub doc: Option<Whiteboard>,
}

impl RoomChannel {
    #[must_use]
    pub fn new() -> Self {
        Self { clients: HashMap::new(), doc: None }
    }
}

impl Default for RoomChannel {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state. Clone is required by Axum — all inner fields
/// are Arc-wrapped or cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub directory: Arc<dyn Directory>,
    pub presence: Arc<dyn PresenceStore>,
    pub documents: Arc<dyn DocumentStore>,
    pub chat: Arc<dyn ChatStore>,
    pub rooms: Arc<RwLock<HashMap<Uuid, RoomChannel>>>,
    pub limiter: EventLimiter,
    pub write_gate: Arc<MinIntervalGate>,
    pub cursor_gate: Arc<MinIntervalGate>,
    pub auth: AuthConfig,
}

impl AppState {
    #[must_use]
    pub fn new(
        directory: Arc<dyn Directory>,
        presence: Arc<dyn PresenceStore>,
        documents: Arc<dyn DocumentStore>,
        chat: Arc<dyn ChatStore>,
        counters: Arc<dyn CounterStore>,
    ) -> Self {
        let write_ms = env_parse("WRITE_MIN_INTERVAL_MS", DEFAULT_WRITE_MIN_INTERVAL_MS);
        let cursor_ms = env_parse("CURSOR_MIN_INTERVAL_MS", DEFAULT_CURSOR_MIN_INTERVAL_MS);

        Self {
            directory,
            presence,
            documents,
            chat,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            limiter: EventLimiter::new(counters),
            write_gate: Arc::new(MinIntervalGate::new(Duration::from_millis(write_ms))),
            cursor_gate: Arc::new(MinIntervalGate::new(Duration::from_millis(cursor_ms))),
            auth: AuthConfig::from_env(),
        }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use crate::rate_limit::{LimiterConfig, MemoryCounterStore};
    use crate::services::chat::MemoryChatStore;
    use crate::services::directory::{MemoryDirectory, RoomRecord, UserRecord};
    use crate::services::plan::PlanTier;
    use crate::services::presence::MemoryPresenceStore;
    use crate::services::whiteboard::MemoryDocumentStore;

    /// An `AppState` wired to in-memory stores, with typed handles kept for
    /// seeding and inspection.
    pub struct TestHarness {
        pub state: AppState,
        pub directory: Arc<MemoryDirectory>,
        pub presence: Arc<MemoryPresenceStore>,
        pub documents: Arc<MemoryDocumentStore>,
        pub chat: Arc<MemoryChatStore>,
    }

    fn permissive_limits() -> LimiterConfig {
        LimiterConfig {
            room_limit: 10_000,
            room_window: Duration::from_secs(60),
            doc_limit: 10_000,
            doc_window: Duration::from_secs(60),
            chat_limit: 10_000,
            chat_window: Duration::from_secs(60),
            ephemeral_limit: 10_000,
            ephemeral_window: Duration::from_secs(60),
            connect_limit: 10_000,
            connect_window: Duration::from_secs(60),
        }
    }

    /// Harness with open gates and permissive limits, so behavior under
    /// test is not accidentally throttled.
    #[must_use]
    pub fn test_state() -> TestHarness {
        test_state_with_write_interval(Duration::ZERO)
    }

    /// Harness with a specific document-write gate interval.
    #[must_use]
    pub fn test_state_with_write_interval(write_interval: Duration) -> TestHarness {
        let directory = Arc::new(MemoryDirectory::new());
        let presence = Arc::new(MemoryPresenceStore::new());
        let documents = Arc::new(MemoryDocumentStore::new());
        let chat = Arc::new(MemoryChatStore::new());
        let counters = Arc::new(MemoryCounterStore::new());

        let state = AppState {
            directory: directory.clone(),
            presence: presence.clone(),
            documents: documents.clone(),
            chat: chat.clone(),
            rooms: Arc::new(RwLock::new(HashMap::new())),
            limiter: EventLimiter::with_config(counters, permissive_limits()),
            write_gate: Arc::new(MinIntervalGate::new(write_interval)),
            cursor_gate: Arc::new(MinIntervalGate::new(Duration::ZERO)),
            auth: AuthConfig { secret: "test-secret".into() },
        };

        TestHarness { state, directory, presence, documents, chat }
    }

    /// A non-anonymous identity on the given plan.
    #[must_use]
    pub fn identity_on(name: &str, plan: PlanTier) -> Identity {
        Identity {
            id: Uuid::new_v4(),
            name: name.into(),
            avatar_url: None,
            plan,
            is_anonymous: false,
        }
    }

    /// A non-anonymous free-tier identity.
    #[must_use]
    pub fn identity(name: &str) -> Identity {
        identity_on(name, PlanTier::Free)
    }

    /// Seed an owner user plus a room they own; returns the room id.
    pub fn seed_room(harness: &TestHarness, owner: &Identity, is_public: bool) -> Uuid {
        harness.directory.add_user(UserRecord {
            id: owner.id,
            name: owner.name.clone(),
            avatar_url: owner.avatar_url.clone(),
            plan: owner.plan,
        });
        let room_id = Uuid::new_v4();
        harness.directory.add_room(RoomRecord {
            id: room_id,
            name: format!("{}'s room", owner.name),
            owner_id: owner.id,
            is_public,
        });
        room_id
    }

    /// Attach a connection directly to a room channel, bypassing the join
    /// flow. Returns the connection id and its broadcast receiver.
    pub async fn attach(
        state: &AppState,
        room_id: Uuid,
        identity: &Identity,
    ) -> (Uuid, mpsc::Receiver<Frame>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
        let mut rooms = state.rooms.write().await;
        rooms
            .entry(room_id)
            .or_default()
            .clients
            .insert(conn_id, ConnectedMember { identity: identity.clone(), tx });
        (conn_id, rx)
    }
}
