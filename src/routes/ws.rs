//! WebSocket gateway and event dispatch.
//!
//! DESIGN
//! ======
//! The upgrade path applies the per-source connection-attempt limiter, then
//! resolves an identity (signed token → verified user, no token → guest)
//! and fixes it into a typed per-connection context. The connection task is
//! a `select!` loop: inbound frames are dispatched by event prefix, frames
//! from room peers arrive on the connection's channel and are forwarded.
//!
//! Handler functions are pure business logic — they validate, call
//! services, and return an `Outcome`. The dispatch layer owns all outbound
//! concerns: replies to the sender and broadcasts to peers. The per-event
//! rate limiter runs before any handler; ephemeral classes drop silently
//! on limit, everything else gets a typed error frame.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → connection limiter → authenticate → `session:connected`
//! 2. Client frames → dispatch → handler returns Outcome
//! 3. Dispatch applies Outcome (reply / broadcast / both / silence)
//! 4. Close → presence cleanup from the snapshotted room set → departure
//!    broadcasts

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::{Data, Frame, now_ms};
use crate::rate_limit::{self, LimitDecision, RateLimitError};
use crate::services::identity::{self, Identity};
use crate::services::room::{self, DisplayHints, JoinOutcome, RoomError};
use crate::services::signaling::{self, RelayOutcome, SignalKind};
use crate::services::chat;
use crate::services::whiteboard::{self, Element, WhiteboardError};
use crate::state::{AppState, CLIENT_CHANNEL_CAPACITY};

// =============================================================================
// CONNECTION CONTEXT
// =============================================================================

/// Typed per-connection state, created once at authentication time and
/// threaded explicitly through every handler.
pub struct ConnCtx {
    pub conn_id: Uuid,
    pub identity: Identity,
    /// Rooms this connection has joined. Snapshotted for disconnect
    /// cleanup before the transport tears the connection down.
    pub rooms: HashSet<Uuid>,
}

impl ConnCtx {
    #[must_use]
    pub fn new(identity: Identity) -> Self {
        Self { conn_id: Uuid::new_v4(), identity, rooms: HashSet::new() }
    }
}

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. The dispatch layer uses this to
/// decide who receives what — handlers never send frames directly.
enum Outcome {
    /// Broadcast to ALL room members (sender included, through its own
    /// channel like everyone else), plus an empty ack to the sender. Chat.
    Broadcast { event: String, data: Data },
    /// Broadcast to peers EXCLUDING the sender, no reply. Cursor, typing.
    BroadcastExcludeSender { event: String, data: Data },
    /// Send done+data to the sender only.
    Reply(Data),
    /// Send an empty done to the sender only.
    Done,
    /// Reply to the sender with one payload, broadcast different data to
    /// peers. Joins and whiteboard mutations.
    ReplyAndBroadcast { reply: Data, event: String, broadcast: Data },
    /// Send nothing at all. Dropped ephemeral traffic.
    Silent,
}

/// Payload validation failure, reported with a stable code.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Invalid(&'static str);

impl crate::frame::ErrorCode for Invalid {
    fn error_code(&self) -> &'static str {
        "E_VALIDATION"
    }
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let LimitDecision::Limited { limit, window_secs } = state.limiter.check_connect(addr.ip()).await {
        warn!(%addr, limit, window_secs, "connection attempts rate limited");
        return (StatusCode::TOO_MANY_REQUESTS, "connection attempts rate limited").into_response();
    }

    // Token priority: explicit query parameter, then Authorization header.
    let token = params
        .get("token")
        .map(String::as_str)
        .or_else(|| bearer_token(&headers));

    match identity::authenticate(state.directory.as_ref(), &state.auth, token, now_ms()).await {
        Ok(resolved) => ws.on_upgrade(move |socket| run_ws(socket, state, resolved)),
        Err(e) => {
            warn!(%addr, error = %e, "ws authentication rejected");
            (StatusCode::UNAUTHORIZED, e.to_string()).into_response()
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, identity: Identity) {
    let mut ctx = ConnCtx::new(identity);

    // Per-connection channel for frames broadcast by room peers.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(CLIENT_CHANNEL_CAPACITY);

    let welcome = Frame::request("session:connected", Data::new())
        .with_data("conn_id", ctx.conn_id.to_string())
        .with_data("identity", serde_json::to_value(&ctx.identity).unwrap_or_default());
    if send_frame(&mut socket, &welcome).await.is_err() {
        return;
    }

    info!(
        conn_id = %ctx.conn_id,
        identity_id = %ctx.identity.id,
        anonymous = ctx.identity.is_anonymous,
        "ws: client connected"
    );

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies = process_frame(&state, &mut ctx, &client_tx, text.as_str()).await;
                        for frame in replies {
                            let _ = send_frame(&mut socket, &frame).await;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = client_rx.recv() => {
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    // Snapshot room memberships BEFORE cleanup; the transport has already
    // stopped servicing this connection and the context is all that's left.
    let joined: Vec<Uuid> = ctx.rooms.iter().copied().collect();
    let departed = room::disconnect(&state, &ctx.identity, ctx.conn_id, &joined).await;
    for dep in departed {
        let frame = member_left_frame(dep.room_id, ctx.identity.id, &dep.members);
        room::broadcast(&state, dep.room_id, &frame, Some(ctx.conn_id)).await;
    }

    info!(conn_id = %ctx.conn_id, "ws: client disconnected");
}

fn member_left_frame(room_id: Uuid, identity_id: Uuid, members: &[crate::services::presence::PresenceRecord]) -> Frame {
    Frame::request("room:member:leave", Data::new())
        .with_room_id(room_id)
        .with_data("identity_id", identity_id.to_string())
        .with_data("members", serde_json::to_value(members).unwrap_or_default())
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse one inbound text frame, rate-limit, dispatch, apply the outcome.
/// Returns the frames owed to the sender. Kept free of socket concerns so
/// tests can drive the whole event surface directly.
async fn process_frame(
    state: &AppState,
    ctx: &mut ConnCtx,
    client_tx: &mpsc::Sender<Frame>,
    text: &str,
) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(conn_id = %ctx.conn_id, error = %e, "ws: invalid inbound frame");
            let err = Frame::request("gateway:error", Data::new())
                .with_data("code", "E_VALIDATION")
                .with_data("message", format!("invalid json: {e}"));
            return vec![err];
        }
    };

    // Stamp the authenticated identity; clients cannot impersonate.
    req.from = Some(ctx.identity.id.to_string());

    let class = rate_limit::classify(&req.event);
    if let LimitDecision::Limited { limit, window_secs } =
        state.limiter.check_event(ctx.identity.id, &req.event).await
    {
        if rate_limit::is_ephemeral(class) {
            return vec![];
        }
        return vec![req.error_from(&RateLimitError::Exceeded { limit, window_secs })];
    }

    if !rate_limit::is_ephemeral(class) {
        info!(conn_id = %ctx.conn_id, id = %req.id, event = %req.event, "ws: recv frame");
    }

    let room_id = req.room_id.or_else(|| {
        req.data
            .get("room_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    });

    let result = match req.prefix() {
        "room" => handle_room(state, ctx, client_tx, room_id, &req).await,
        "whiteboard" | "element" => handle_whiteboard(state, ctx, room_id, &req).await,
        "cursor" => handle_cursor(state, ctx, room_id, &req),
        "rtc" => handle_rtc(state, ctx, room_id, &req).await,
        "chat" => handle_chat(state, ctx, room_id, &req).await,
        "session" => handle_session(state, ctx, &req).await,
        other => Err(req.error(format!("unknown event prefix: {other}"))),
    };

    apply_outcome(state, ctx, room_id, &req, result).await
}

/// Apply a handler outcome — the dispatch layer owns all outbound logic.
async fn apply_outcome(
    state: &AppState,
    ctx: &ConnCtx,
    room_id: Option<Uuid>,
    req: &Frame,
    result: Result<Outcome, Frame>,
) -> Vec<Frame> {
    match result {
        Ok(Outcome::Broadcast { event, data }) => {
            if let Some(rid) = room_id {
                let frame = Frame::request(event, data)
                    .with_room_id(rid)
                    .with_from(ctx.identity.id.to_string());
                room::broadcast(state, rid, &frame, None).await;
            }
            vec![req.done()]
        }
        Ok(Outcome::BroadcastExcludeSender { event, data }) => {
            if let Some(rid) = room_id {
                let frame = Frame::request(event, data).with_room_id(rid);
                room::broadcast(state, rid, &frame, Some(ctx.conn_id)).await;
            }
            vec![]
        }
        Ok(Outcome::Reply(data)) => vec![req.done_with(data)],
        Ok(Outcome::Done) => vec![req.done()],
        Ok(Outcome::ReplyAndBroadcast { reply, event, broadcast }) => {
            if let Some(rid) = room_id {
                let frame = Frame::request(event, broadcast).with_room_id(rid);
                room::broadcast(state, rid, &frame, Some(ctx.conn_id)).await;
            }
            vec![req.done_with(reply)]
        }
        Ok(Outcome::Silent) => vec![],
        Err(err_frame) => vec![err_frame],
    }
}

// =============================================================================
// ROOM HANDLERS
// =============================================================================

async fn handle_room(
    state: &AppState,
    ctx: &mut ConnCtx,
    client_tx: &mpsc::Sender<Frame>,
    room_id: Option<Uuid>,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let Some(room_id) = room_id else {
        return Err(req.error_from(&Invalid("room_id required")));
    };

    match req.op() {
        "join" => {
            let hints = DisplayHints {
                name: req.data.get("name").and_then(|v| v.as_str()).map(str::to_string),
                avatar_url: req
                    .data
                    .get("avatar_url")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            };

            match room::join(state, &ctx.identity, ctx.conn_id, room_id, hints, client_tx.clone()).await {
                Ok(outcome) => {
                    ctx.rooms.insert(room_id);
                    let (event, join_state) = match outcome {
                        JoinOutcome::Joined(s) => ("room:member:join", s),
                        JoinOutcome::Reconnected(s) => ("room:member:restore", s),
                    };

                    let mut reply = Data::new();
                    reply.insert(
                        "members".into(),
                        serde_json::to_value(&join_state.members).unwrap_or_default(),
                    );
                    reply.insert(
                        "document".into(),
                        serde_json::to_value(&join_state.document).unwrap_or_default(),
                    );

                    let mut broadcast = Data::new();
                    broadcast.insert(
                        "member".into(),
                        serde_json::to_value(&join_state.member).unwrap_or_default(),
                    );

                    Ok(Outcome::ReplyAndBroadcast { reply, event: event.into(), broadcast })
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "leave" => match room::leave(state, &ctx.identity, ctx.conn_id, room_id).await {
            Ok(members) => {
                ctx.rooms.remove(&room_id);

                let mut reply = Data::new();
                reply.insert("left".into(), serde_json::json!(true));

                let mut broadcast = Data::new();
                broadcast.insert("identity_id".into(), serde_json::json!(ctx.identity.id));
                broadcast.insert("members".into(), serde_json::to_value(&members).unwrap_or_default());

                Ok(Outcome::ReplyAndBroadcast {
                    reply,
                    event: "room:member:leave".into(),
                    broadcast,
                })
            }
            Err(e) => Err(req.error_from(&e)),
        },
        "members" => {
            if !ctx.rooms.contains(&room_id) {
                return Err(req.error_from(&RoomError::NotMember));
            }
            match state.presence.list(room_id).await {
                Ok(members) => {
                    let mut reply = Data::new();
                    reply.insert("members".into(), serde_json::to_value(&members).unwrap_or_default());
                    Ok(Outcome::Reply(reply))
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        other => Err(req.error(format!("unknown room op: {other}"))),
    }
}

// =============================================================================
// WHITEBOARD HANDLERS
// =============================================================================

#[allow(clippy::too_many_lines)]
async fn handle_whiteboard(
    state: &AppState,
    ctx: &ConnCtx,
    room_id: Option<Uuid>,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let Some(room_id) = room_id else {
        return Err(req.error_from(&Invalid("room_id required")));
    };
    // Every read and mutation requires live membership of the room channel.
    if !ctx.rooms.contains(&room_id) {
        return Err(req.error_from(&WhiteboardError::NotMember(room_id)));
    }

    let author = ctx.identity.id;
    let now = now_ms();

    match (req.prefix(), req.op()) {
        ("whiteboard", "load") => match whiteboard::load_document(state, room_id).await {
            Ok(doc) => {
                let mut reply = Data::new();
                reply.insert("document".into(), serde_json::to_value(&doc).unwrap_or_default());
                Ok(Outcome::Reply(reply))
            }
            Err(e) => Err(req.error_from(&e)),
        },
        ("whiteboard", "replace") => {
            check_write_gate(state, ctx, room_id, req)?;

            let Some(raw) = req.data.get("elements") else {
                return Err(req.error_from(&Invalid("elements required")));
            };
            let Ok(elements) = serde_json::from_value::<Vec<Element>>(raw.clone()) else {
                return Err(req.error_from(&Invalid("malformed elements")));
            };
            let view_state = req.data.get("view_state").cloned();
            let files = req.data.get("files").cloned();

            match whiteboard::mutate(state, room_id, |doc| {
                Ok(doc.replace(elements, view_state, files, author, now))
            })
            .await
            {
                Ok((doc, changed)) => {
                    let mut reply = Data::new();
                    reply.insert("version".into(), serde_json::json!(doc.version));
                    reply.insert("changed".into(), serde_json::json!(changed));

                    let mut broadcast = Data::new();
                    broadcast.insert("elements".into(), serde_json::to_value(&doc.elements).unwrap_or_default());
                    broadcast.insert("view_state".into(), doc.view_state.clone());
                    broadcast.insert("files".into(), doc.files.clone());
                    broadcast.insert("version".into(), serde_json::json!(doc.version));
                    broadcast.insert("identity_id".into(), serde_json::json!(author));

                    Ok(Outcome::ReplyAndBroadcast {
                        reply,
                        event: "whiteboard:replace".into(),
                        broadcast,
                    })
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        ("whiteboard", "snapshot") => {
            match whiteboard::mutate(state, room_id, |doc| Ok(doc.take_snapshot(author, now))).await {
                Ok((doc, at_version)) => {
                    let mut reply = Data::new();
                    reply.insert("version".into(), serde_json::json!(at_version));
                    reply.insert("snapshots".into(), serde_json::json!(doc.snapshots.len()));
                    Ok(Outcome::Reply(reply))
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        ("whiteboard", "snapshots") => match whiteboard::load_document(state, room_id).await {
            Ok(doc) => {
                let listing: Vec<Value> = doc
                    .snapshots
                    .iter()
                    .map(|s| {
                        serde_json::json!({
                            "version": s.version,
                            "ts": s.ts,
                            "author_id": s.author_id,
                            "elements": s.elements.len(),
                        })
                    })
                    .collect();
                let mut reply = Data::new();
                reply.insert("snapshots".into(), serde_json::json!(listing));
                Ok(Outcome::Reply(reply))
            }
            Err(e) => Err(req.error_from(&e)),
        },
        ("whiteboard", "restore") => {
            let room = match state.directory.room(room_id).await {
                Ok(Some(room)) => room,
                Ok(None) => return Err(req.error_from(&RoomError::NotFound(room_id))),
                Err(e) => return Err(req.error_from(&RoomError::from(e))),
            };
            if room.owner_id != ctx.identity.id {
                return Err(req.error_from(&WhiteboardError::OwnerOnly));
            }

            let Some(version) = req.data.get("version").and_then(Value::as_i64) else {
                return Err(req.error_from(&Invalid("version required")));
            };

            match whiteboard::mutate(state, room_id, |doc| doc.restore(version, author, now)).await {
                Ok((doc, ())) => {
                    let mut reply = Data::new();
                    reply.insert("version".into(), serde_json::json!(doc.version));

                    // Distinct event so clients can tell a jump from an
                    // incremental edit.
                    let mut broadcast = Data::new();
                    broadcast.insert("elements".into(), serde_json::to_value(&doc.elements).unwrap_or_default());
                    broadcast.insert("view_state".into(), doc.view_state.clone());
                    broadcast.insert("files".into(), doc.files.clone());
                    broadcast.insert("version".into(), serde_json::json!(doc.version));
                    broadcast.insert("restored_from".into(), serde_json::json!(version));
                    broadcast.insert("identity_id".into(), serde_json::json!(author));

                    Ok(Outcome::ReplyAndBroadcast {
                        reply,
                        event: "whiteboard:restore".into(),
                        broadcast,
                    })
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        ("element", "create") => {
            check_write_gate(state, ctx, room_id, req)?;
            let element = parse_element(req)?;

            match whiteboard::mutate(state, room_id, |doc| {
                doc.create_element(element.clone(), author, now);
                Ok(())
            })
            .await
            {
                Ok((doc, ())) => Ok(element_outcome(&doc, "element:create", |broadcast| {
                    broadcast.insert(
                        "element".into(),
                        serde_json::to_value(&element).unwrap_or_default(),
                    );
                })),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        ("element", "update") => {
            check_write_gate(state, ctx, room_id, req)?;
            let id = require_element_id(req)?;
            let patch = match req.data.get("patch") {
                Some(Value::Object(map)) => map.clone(),
                Some(_) => return Err(req.error_from(&Invalid("patch must be an object"))),
                None => serde_json::Map::new(),
            };

            match whiteboard::mutate(state, room_id, |doc| doc.update_element(&id, &patch, author, now)).await {
                Ok((doc, updated)) => Ok(element_outcome(&doc, "element:update", |broadcast| {
                    broadcast.insert(
                        "element".into(),
                        serde_json::to_value(&updated).unwrap_or_default(),
                    );
                })),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        ("element", "delete") => {
            check_write_gate(state, ctx, room_id, req)?;
            let id = require_element_id(req)?;

            match whiteboard::mutate(state, room_id, |doc| doc.delete_element(&id, author, now)).await {
                Ok((doc, ())) => Ok(element_outcome(&doc, "element:delete", |broadcast| {
                    broadcast.insert("id".into(), serde_json::json!(id));
                })),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        (_, other) => Err(req.error(format!("unknown whiteboard op: {other}"))),
    }
}

/// Writes share a minimum-interval gate per (identity, room); rejections
/// are reported so clients can back off.
fn check_write_gate(state: &AppState, ctx: &ConnCtx, room_id: Uuid, req: &Frame) -> Result<(), Frame> {
    if state.write_gate.try_pass(ctx.identity.id, room_id) {
        Ok(())
    } else {
        let min_interval_ms =
            u64::try_from(state.write_gate.interval().as_millis()).unwrap_or(u64::MAX);
        Err(req.error_from(&RateLimitError::WriteThrottled { min_interval_ms }))
    }
}

fn parse_element(req: &Frame) -> Result<Element, Frame> {
    let Some(raw) = req.data.get("element") else {
        return Err(req.error_from(&Invalid("element required")));
    };
    let Ok(element) = serde_json::from_value::<Element>(raw.clone()) else {
        return Err(req.error_from(&Invalid("malformed element")));
    };
    if element.id.is_empty() {
        return Err(req.error_from(&Invalid("element id required")));
    }
    Ok(element)
}

fn require_element_id(req: &Frame) -> Result<String, Frame> {
    req.data
        .get("id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| req.error_from(&Invalid("id required")))
}

/// Standard mutation outcome: version ack to the author, delta + version to
/// everyone else (the author never receives its own echo).
fn element_outcome(doc: &whiteboard::Whiteboard, event: &str, fill: impl FnOnce(&mut Data)) -> Outcome {
    let mut reply = Data::new();
    reply.insert("version".into(), serde_json::json!(doc.version));

    let mut broadcast = Data::new();
    broadcast.insert("version".into(), serde_json::json!(doc.version));
    if let Some(author) = doc.last_modified_by {
        broadcast.insert("identity_id".into(), serde_json::json!(author));
    }
    fill(&mut broadcast);

    Outcome::ReplyAndBroadcast { reply, event: event.into(), broadcast }
}

// =============================================================================
// CURSOR HANDLER
// =============================================================================

/// Cursor traffic is best-effort: gate rejections and pre-join moves are
/// dropped without a reply.
fn handle_cursor(
    state: &AppState,
    ctx: &ConnCtx,
    room_id: Option<Uuid>,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let Some(room_id) = room_id else {
        return Ok(Outcome::Silent);
    };
    if !ctx.rooms.contains(&room_id) {
        return Ok(Outcome::Silent);
    }
    if !state.cursor_gate.try_pass(ctx.identity.id, room_id) {
        return Ok(Outcome::Silent);
    }

    let x = req.data.get("x").and_then(Value::as_f64).unwrap_or(0.0);
    let y = req.data.get("y").and_then(Value::as_f64).unwrap_or(0.0);

    let mut data = Data::new();
    data.insert("identity_id".into(), serde_json::json!(ctx.identity.id));
    data.insert("name".into(), serde_json::json!(ctx.identity.name));
    data.insert("x".into(), serde_json::json!(x));
    data.insert("y".into(), serde_json::json!(y));

    Ok(Outcome::BroadcastExcludeSender { event: "cursor:move".into(), data })
}

// =============================================================================
// SIGNALING HANDLERS
// =============================================================================

async fn handle_rtc(
    state: &AppState,
    ctx: &ConnCtx,
    room_id: Option<Uuid>,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let Some(room_id) = room_id else {
        return Err(req.error_from(&Invalid("room_id required")));
    };

    match req.op() {
        op @ ("offer" | "answer" | "ice") => {
            let kind = match op {
                "offer" => SignalKind::Offer,
                "answer" => SignalKind::Answer,
                _ => SignalKind::Ice,
            };

            let target_id = req
                .data
                .get("target_id")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<Uuid>().ok());
            let Some(target_id) = target_id else {
                if kind == SignalKind::Ice {
                    return Ok(Outcome::Silent);
                }
                return Err(req.error_from(&Invalid("target_id required")));
            };

            let payload = req.data.get("payload").cloned().unwrap_or(Value::Null);
            match signaling::relay(state, room_id, &ctx.identity, target_id, kind, payload).await {
                Ok(RelayOutcome::Delivered) => Ok(Outcome::Done),
                Ok(RelayOutcome::Dropped) => Ok(Outcome::Silent),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "call" => match signaling::initiate_call(state, room_id, &ctx.identity).await {
            Ok(admission) => {
                let mut reply = Data::new();
                reply.insert("occupancy".into(), serde_json::json!(admission.occupancy));
                reply.insert("limit".into(), serde_json::json!(admission.limit));
                Ok(Outcome::Reply(reply))
            }
            Err(e) => Err(req.error_from(&e)),
        },
        other => Err(req.error(format!("unknown rtc op: {other}"))),
    }
}

// =============================================================================
// CHAT HANDLERS
// =============================================================================

async fn handle_chat(
    state: &AppState,
    ctx: &ConnCtx,
    room_id: Option<Uuid>,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let Some(room_id) = room_id else {
        return Err(req.error_from(&Invalid("room_id required")));
    };

    match req.op() {
        "send" => {
            if !ctx.rooms.contains(&room_id) {
                return Err(req.error_from(&RoomError::NotMember));
            }

            let content = req.data.get("content").and_then(|v| v.as_str()).unwrap_or("");
            let kind = req.data.get("kind").and_then(|v| v.as_str());

            let message = match chat::build_message(room_id, &ctx.identity, content, kind) {
                Ok(m) => m,
                Err(e) => return Err(req.error_from(&e)),
            };
            if let Err(e) = state.chat.append(&message).await {
                return Err(req.error_from(&chat::ChatError::from(e)));
            }

            let mut data = Data::new();
            data.insert("message".into(), serde_json::to_value(&message).unwrap_or_default());
            Ok(Outcome::Broadcast { event: "chat:send".into(), data })
        }
        op @ ("typing:start" | "typing:stop") => {
            if !ctx.rooms.contains(&room_id) {
                return Ok(Outcome::Silent);
            }

            let mut data = Data::new();
            data.insert("identity_id".into(), serde_json::json!(ctx.identity.id));
            data.insert("name".into(), serde_json::json!(ctx.identity.name));
            data.insert("typing".into(), serde_json::json!(op == "typing:start"));
            Ok(Outcome::BroadcastExcludeSender { event: req.event.clone(), data })
        }
        other => Err(req.error(format!("unknown chat op: {other}"))),
    }
}

// =============================================================================
// SESSION HANDLER
// =============================================================================

async fn handle_session(state: &AppState, ctx: &ConnCtx, req: &Frame) -> Result<Outcome, Frame> {
    match req.op() {
        "ping" => {
            let now = now_ms();
            for room_id in &ctx.rooms {
                if let Err(e) = state.presence.touch(*room_id, ctx.identity.id, now).await {
                    warn!(room_id = %room_id, error = %e, "presence heartbeat failed");
                }
            }
            Ok(Outcome::Done)
        }
        other => Err(req.error(format!("unknown session op: {other}"))),
    }
}

// =============================================================================
// HELPERS
// =============================================================================

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };

    let quiet = frame.event.starts_with("cursor:");
    if !quiet {
        if frame.status == crate::frame::Status::Error {
            let code = frame.data.get("code").and_then(|v| v.as_str()).unwrap_or("-");
            let message = frame.data.get("message").and_then(|v| v.as_str()).unwrap_or("-");
            warn!(id = %frame.id, event = %frame.event, code, message, "ws: send frame status=Error");
        } else {
            info!(id = %frame.id, event = %frame.event, status = ?frame.status, "ws: send frame");
        }
    }

    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
