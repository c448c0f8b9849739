//! WebRTC signaling relay — unicast offer/answer/ICE forwarding.
//!
//! DESIGN
//! ======
//! The server relays but never interprets signaling payloads. Offers and
//! answers are access-checked on both ends (sender and target must be
//! current members of the room's channel) and a missing target is reported
//! back. ICE candidates are frequent and loss-tolerant: they skip the
//! membership check and vanish silently when the target is gone. Nothing
//! here is ever broadcast to the whole room.

use serde_json::Value;
use uuid::Uuid;

use crate::frame::{Data, Frame};
use crate::services::identity::Identity;
use crate::services::room;
use crate::state::AppState;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    Ice,
}

impl SignalKind {
    /// The event name a relayed frame of this kind carries.
    #[must_use]
    pub fn event(self) -> &'static str {
        match self {
            Self::Offer => "rtc:offer",
            Self::Answer => "rtc:answer",
            Self::Ice => "rtc:ice",
        }
    }

    /// Offers and answers verify membership of both ends; ICE does not.
    #[must_use]
    fn checks_membership(self) -> bool {
        matches!(self, Self::Offer | Self::Answer)
    }
}

/// What happened to a relayed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered,
    /// ICE only: the target was gone and the candidate was dropped.
    Dropped,
}

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("target user not found in room: {0}")]
    TargetNotFound(Uuid),
    #[error("not a member of this room")]
    NotMember,
    #[error("call participant limit reached (limit {limit})")]
    CallLimit { limit: usize },
    #[error("could not determine room occupancy")]
    LimitCheckFailed,
}

impl crate::frame::ErrorCode for SignalError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::TargetNotFound(_) => "E_USER_NOT_FOUND",
            Self::NotMember => "E_NOT_MEMBER",
            Self::CallLimit { .. } => "E_CALL_LIMIT",
            Self::LimitCheckFailed => "E_LIMIT_CHECK_FAILED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::LimitCheckFailed)
    }
}

/// Occupancy admitted to a call, returned to the initiator.
#[derive(Debug)]
pub struct CallAdmission {
    pub occupancy: u64,
    pub limit: usize,
}

// =============================================================================
// RELAY
// =============================================================================

/// Forward one signaling message to the named target identity.
///
/// # Errors
///
/// `NotMember` / `TargetNotFound` for offer/answer access failures. ICE
/// never errors: an unreachable target yields `Dropped`.
pub async fn relay(
    state: &AppState,
    room_id: Uuid,
    sender: &Identity,
    target_id: Uuid,
    kind: SignalKind,
    payload: Value,
) -> Result<RelayOutcome, SignalError> {
    if kind.checks_membership() {
        if !room::channel_has_identity(state, room_id, sender.id).await {
            return Err(SignalError::NotMember);
        }
        if !room::channel_has_identity(state, room_id, target_id).await {
            return Err(SignalError::TargetNotFound(target_id));
        }
    }

    let mut data = Data::new();
    data.insert("sender_id".into(), serde_json::json!(sender.id));
    data.insert("sender_name".into(), serde_json::json!(sender.name));
    data.insert("target_id".into(), serde_json::json!(target_id));
    data.insert("payload".into(), payload);

    let frame = Frame::request(kind.event(), data)
        .with_room_id(room_id)
        .with_from(sender.id.to_string());

    if room::send_to_identity(state, room_id, target_id, &frame).await {
        Ok(RelayOutcome::Delivered)
    } else if kind == SignalKind::Ice {
        Ok(RelayOutcome::Dropped)
    } else {
        Err(SignalError::TargetNotFound(target_id))
    }
}

/// Admission check for starting a call: current room occupancy must fit
/// within the caller's plan-derived call cap. Distinct from the room join
/// capacity check.
///
/// # Errors
///
/// `NotMember` when the caller isn't attached to the room,
/// `LimitCheckFailed` when occupancy can't be read, `CallLimit` when the
/// room holds more people than the caller's plan can put on a call.
pub async fn initiate_call(
    state: &AppState,
    room_id: Uuid,
    caller: &Identity,
) -> Result<CallAdmission, SignalError> {
    if !room::channel_has_identity(state, room_id, caller.id).await {
        return Err(SignalError::NotMember);
    }

    let occupancy = state
        .presence
        .count(room_id)
        .await
        .map_err(|_| SignalError::LimitCheckFailed)?;

    let limit = caller.plan.call_participant_limit();
    if usize::try_from(occupancy).unwrap_or(usize::MAX) > limit {
        return Err(SignalError::CallLimit { limit });
    }

    Ok(CallAdmission { occupancy, limit })
}

#[cfg(test)]
#[path = "signaling_test.rs"]
mod tests;
