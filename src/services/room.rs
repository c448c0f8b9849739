//! Room coordinator — join/leave/reconnect semantics, capacity, fan-out.
//!
//! DESIGN
//! ======
//! The membership state machine per (identity, room) is NotJoined → Joined
//! → (Reconnected | Left | Disconnected). The presence store is the single
//! source of truth for occupancy; the directory's room/member tables are
//! consulted only for access control. Capacity is the room owner's
//! plan-derived participant limit, checked before any presence write so a
//! rejected join leaves no trace and triggers no broadcast.
//!
//! ERROR HANDLING
//! ==============
//! Join failures are reported to the joiner only, always with a typed code.
//! Disconnect cleanup never errors outward: it logs and keeps going, and
//! removes presence only when the record still belongs to the departing
//! connection, so a reconnect that already replaced the record is spared.

use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::{Frame, now_ms};
use crate::services::directory::DirectoryError;
use crate::services::identity::Identity;
use crate::services::presence::{PresenceError, PresenceRecord};
use crate::services::whiteboard::{self, Whiteboard, WhiteboardError};
use crate::state::{AppState, ConnectedMember};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("room not found: {0}")]
    NotFound(Uuid),
    #[error("room owner not found: {0}")]
    OwnerNotFound(Uuid),
    #[error("not a member of this room")]
    NotMember,
    #[error("room is full (limit {limit} participants)")]
    ParticipantLimit { limit: usize },
    #[error("could not determine room occupancy")]
    LimitCheckFailed,
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Presence(#[from] PresenceError),
    #[error(transparent)]
    Document(#[from] WhiteboardError),
}

impl crate::frame::ErrorCode for RoomError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_ROOM_NOT_FOUND",
            Self::OwnerNotFound(_) => "E_OWNER_NOT_FOUND",
            Self::NotMember => "E_NOT_MEMBER",
            Self::ParticipantLimit { .. } => "E_PARTICIPANT_LIMIT",
            Self::LimitCheckFailed => "E_LIMIT_CHECK_FAILED",
            Self::Directory(_) | Self::Presence(_) | Self::Document(_) => "E_STORE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(
            self,
            Self::LimitCheckFailed | Self::Directory(_) | Self::Presence(_) | Self::Document(_)
        )
    }
}

/// Client-supplied display overrides on join.
#[derive(Debug, Default, Clone)]
pub struct DisplayHints {
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

/// State handed back to a joiner: their own record, the member list, and
/// the current document.
#[derive(Debug)]
pub struct JoinState {
    pub member: PresenceRecord,
    pub members: Vec<PresenceRecord>,
    pub document: Whiteboard,
}

#[derive(Debug)]
pub enum JoinOutcome {
    /// First join for this (identity, room): peers get `room:member:join`.
    Joined(JoinState),
    /// The identity already had a presence record (network blip): peers get
    /// the lighter `room:member:restore`, never a duplicate join.
    Reconnected(JoinState),
}

/// A room a disconnecting connection actually departed (its presence record
/// was removed), with the remaining member list for the broadcast.
pub struct DepartedRoom {
    pub room_id: Uuid,
    pub members: Vec<PresenceRecord>,
}

// =============================================================================
// JOIN
// =============================================================================

/// Join (or rejoin) a room.
///
/// # Errors
///
/// Typed [`RoomError`] on unknown room/owner, access denial, capacity, or
/// store failure. Nothing is written and nothing broadcast on any error.
pub async fn join(
    state: &AppState,
    identity: &Identity,
    conn_id: Uuid,
    room_id: Uuid,
    hints: DisplayHints,
    tx: mpsc::Sender<Frame>,
) -> Result<JoinOutcome, RoomError> {
    let room = state
        .directory
        .room(room_id)
        .await?
        .ok_or(RoomError::NotFound(room_id))?;

    if !room.is_public && room.owner_id != identity.id {
        let on_roster = state.directory.is_room_member(room_id, identity.id).await?;
        if !on_roster {
            return Err(RoomError::NotMember);
        }
    }

    let now = now_ms();
    let name = hints.name.unwrap_or_else(|| identity.name.clone());
    let avatar_url = hints.avatar_url.or_else(|| identity.avatar_url.clone());

    // Reconnect short-circuit: the record is refreshed in place, so there
    // is never a second record and never a capacity re-check for someone
    // who is already counted.
    if let Some(existing) = state.presence.get(room_id, identity.id).await? {
        let record = PresenceRecord {
            room_id,
            identity_id: identity.id,
            conn_id,
            name,
            avatar_url,
            joined_at: existing.joined_at,
            last_seen_at: now,
        };
        state.presence.upsert(&record).await?;
        attach(state, room_id, conn_id, identity, tx).await;

        let members = state.presence.list(room_id).await?;
        let document = whiteboard::load_document(state, room_id).await?;
        info!(%room_id, %conn_id, identity_id = %identity.id, "member reconnected");
        return Ok(JoinOutcome::Reconnected(JoinState { member: record, members, document }));
    }

    let owner = state
        .directory
        .user(room.owner_id)
        .await?
        .ok_or(RoomError::OwnerNotFound(room.owner_id))?;
    let limit = owner.plan.room_participant_limit();

    let occupancy = match state.presence.count(room_id).await {
        Ok(n) => n,
        Err(e) => {
            warn!(%room_id, error = %e, "occupancy read failed; rejecting join");
            return Err(RoomError::LimitCheckFailed);
        }
    };
    if usize::try_from(occupancy).unwrap_or(usize::MAX) >= limit {
        return Err(RoomError::ParticipantLimit { limit });
    }

    let record = PresenceRecord {
        room_id,
        identity_id: identity.id,
        conn_id,
        name,
        avatar_url,
        joined_at: now,
        last_seen_at: now,
    };
    state.presence.upsert(&record).await?;
    attach(state, room_id, conn_id, identity, tx).await;

    let members = state.presence.list(room_id).await?;
    let document = whiteboard::load_document(state, room_id).await?;
    info!(%room_id, %conn_id, identity_id = %identity.id, occupancy = members.len(), "member joined");
    Ok(JoinOutcome::Joined(JoinState { member: record, members, document }))
}

// =============================================================================
// LEAVE / DISCONNECT
// =============================================================================

/// Explicit leave. Returns the remaining member list for the departure
/// broadcast.
///
/// # Errors
///
/// `NotMember` when the identity has no presence record for the room.
pub async fn leave(
    state: &AppState,
    identity: &Identity,
    conn_id: Uuid,
    room_id: Uuid,
) -> Result<Vec<PresenceRecord>, RoomError> {
    if state.presence.get(room_id, identity.id).await?.is_none() {
        return Err(RoomError::NotMember);
    }

    state.presence.remove(room_id, identity.id).await?;
    detach(state, room_id, conn_id).await;

    // Best-effort read: the leave already happened.
    let members = state.presence.list(room_id).await.unwrap_or_default();
    info!(%room_id, %conn_id, identity_id = %identity.id, "member left");
    Ok(members)
}

/// Transport-level disconnect cleanup across the connection's room set
/// (snapshotted by the caller before the transport cleared it).
///
/// Presence is removed only where the stored record still belongs to this
/// connection; a newer connection's record for the same identity survives.
/// Idempotent: repeated delivery finds nothing left to remove and returns
/// no departures, so nothing is double-broadcast.
pub async fn disconnect(
    state: &AppState,
    identity: &Identity,
    conn_id: Uuid,
    room_ids: &[Uuid],
) -> Vec<DepartedRoom> {
    let mut departed = Vec::new();

    for &room_id in room_ids {
        detach(state, room_id, conn_id).await;

        match state
            .presence
            .remove_if_conn(room_id, identity.id, conn_id)
            .await
        {
            Ok(true) => {
                let members = state.presence.list(room_id).await.unwrap_or_default();
                info!(%room_id, %conn_id, identity_id = %identity.id, "member disconnected");
                departed.push(DepartedRoom { room_id, members });
            }
            Ok(false) => {
                // Stale record from an older connection, or already gone.
            }
            Err(e) => {
                warn!(%room_id, %conn_id, error = %e, "presence cleanup failed on disconnect");
            }
        }
    }

    departed
}

// =============================================================================
// CHANNEL REGISTRY
// =============================================================================

async fn attach(
    state: &AppState,
    room_id: Uuid,
    conn_id: Uuid,
    identity: &Identity,
    tx: mpsc::Sender<Frame>,
) {
    let mut rooms = state.rooms.write().await;
    rooms
        .entry(room_id)
        .or_default()
        .clients
        .insert(conn_id, ConnectedMember { identity: identity.clone(), tx });
}

async fn detach(state: &AppState, room_id: Uuid, conn_id: Uuid) {
    let mut rooms = state.rooms.write().await;
    if let Some(channel) = rooms.get_mut(&room_id) {
        channel.clients.remove(&conn_id);
        if channel.clients.is_empty() {
            rooms.remove(&room_id);
            info!(%room_id, "evicted idle room channel");
        }
    }
}

/// Whether any connection in the room's channel carries this identity.
pub async fn channel_has_identity(state: &AppState, room_id: Uuid, identity_id: Uuid) -> bool {
    let rooms = state.rooms.read().await;
    rooms
        .get(&room_id)
        .is_some_and(|channel| channel.clients.values().any(|m| m.identity.id == identity_id))
}

// =============================================================================
// FAN-OUT
// =============================================================================

/// Broadcast a frame to all connections in a room, optionally excluding one.
pub async fn broadcast(state: &AppState, room_id: Uuid, frame: &Frame, exclude: Option<Uuid>) {
    let rooms = state.rooms.read().await;
    let Some(channel) = rooms.get(&room_id) else {
        return;
    };

    for (conn_id, member) in &channel.clients {
        if exclude == Some(*conn_id) {
            continue;
        }
        // Best-effort: a client with a full queue misses the frame.
        let _ = member.tx.try_send(frame.clone());
    }
}

/// Deliver a frame to the one connection in the room whose identity matches.
/// Returns whether a target connection was found and sent to.
pub async fn send_to_identity(state: &AppState, room_id: Uuid, identity_id: Uuid, frame: &Frame) -> bool {
    let rooms = state.rooms.read().await;
    let Some(channel) = rooms.get(&room_id) else {
        return false;
    };

    for member in channel.clients.values() {
        if member.identity.id == identity_id {
            return member.tx.try_send(frame.clone()).is_ok();
        }
    }
    false
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
