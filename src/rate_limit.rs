//! Rate limiting for the realtime event surface.
//!
//! DESIGN
//! ======
//! Three mechanisms, chosen per abuse surface:
//! - Fixed-window counters behind the [`CounterStore`] trait, keyed by
//!   `(identity, event)`. The in-memory store serves a single instance; the
//!   Postgres store shares windows across instances via one atomic upsert.
//! - In-process token buckets for signaling, whose bounds are much tighter
//!   than chat or presence traffic.
//! - Minimum-interval gates for document writes (~100ms) and cursor moves
//!   (~50ms), keyed by `(identity, room)`.
//!
//! ERROR HANDLING
//! ==============
//! Counter-store failures fail OPEN: the event is allowed and a warning is
//! logged. Collaboration availability outranks strict enforcement.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::frame::now_ms;

const DEFAULT_ROOM_LIMIT: u64 = 20;
const DEFAULT_ROOM_WINDOW_SECS: u64 = 60;

const DEFAULT_DOC_LIMIT: u64 = 240;
const DEFAULT_DOC_WINDOW_SECS: u64 = 60;

const DEFAULT_CHAT_LIMIT: u64 = 30;
const DEFAULT_CHAT_WINDOW_SECS: u64 = 60;

const DEFAULT_EPHEMERAL_LIMIT: u64 = 1200;
const DEFAULT_EPHEMERAL_WINDOW_SECS: u64 = 60;

const DEFAULT_CONNECT_LIMIT: u64 = 10;
const DEFAULT_CONNECT_WINDOW_SECS: u64 = 60;

// Signaling buckets: offers/answers are rare, ICE candidates are bursty.
const OFFER_BUCKET_CAPACITY: f64 = 6.0;
const OFFER_BUCKET_REFILL_PER_SEC: f64 = 0.5;
const ICE_BUCKET_CAPACITY: f64 = 60.0;
const ICE_BUCKET_REFILL_PER_SEC: f64 = 20.0;

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

// =============================================================================
// TYPES
// =============================================================================

/// Coarse event family; each family has its own limits because its abuse
/// surface differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    RoomControl,
    DocumentWrite,
    Chat,
    Signaling,
    Ephemeral,
    Other,
}

/// Classify an event name by its prefix.
#[must_use]
pub fn classify(event: &str) -> EventClass {
    let prefix = event.split_once(':').map_or(event, |(p, _)| p);
    match prefix {
        "room" => EventClass::RoomControl,
        "whiteboard" | "element" => EventClass::DocumentWrite,
        "chat" => EventClass::Chat,
        "rtc" => EventClass::Signaling,
        "cursor" | "session" => EventClass::Ephemeral,
        _ => EventClass::Other,
    }
}

/// Whether failures of this class are reported back or silently dropped.
#[must_use]
pub fn is_ephemeral(class: EventClass) -> bool {
    matches!(class, EventClass::Ephemeral)
}

/// Outcome of a limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitDecision {
    Allowed,
    Limited { limit: u64, window_secs: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded (max {limit} events/{window_secs}s)")]
    Exceeded { limit: u64, window_secs: u64 },
    #[error("writes limited to one per {min_interval_ms}ms")]
    WriteThrottled { min_interval_ms: u64 },
}

impl crate::frame::ErrorCode for RateLimitError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Exceeded { .. } => "E_RATE_LIMIT",
            Self::WriteThrottled { .. } => "E_WRITE_THROTTLED",
        }
    }

    fn retryable(&self) -> bool {
        true
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CounterError {
    #[error("counter store failed: {0}")]
    Store(#[from] sqlx::Error),
    #[error("counter store unavailable")]
    Unavailable,
}

// =============================================================================
// COUNTER STORE
// =============================================================================

/// Fixed-window counter. `increment` bumps the counter for `key`, rolling
/// the window over when the previous one has expired, and returns the
/// post-increment count within the current window.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, CounterError>;
}

/// Process-local counters. Single-instance deployments and tests.
#[derive(Default)]
pub struct MemoryCounterStore {
    windows: Mutex<HashMap<String, (Instant, u64)>>,
}

impl MemoryCounterStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn increment_at(&self, key: &str, window: Duration, now: Instant) -> u64 {
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = windows.entry(key.to_string()).or_insert((now, 0));
        if now.duration_since(entry.0) > window {
            *entry = (now, 0);
        }
        entry.1 += 1;
        entry.1
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, CounterError> {
        Ok(self.increment_at(key, window, Instant::now()))
    }
}

/// Shared counters in Postgres: one atomic upsert per increment, windows
/// roll over in the statement itself. Over-counting by one concurrent
/// request at a rollover boundary is acceptable.
pub struct PgCounterStore {
    pool: PgPool,
}

impl PgCounterStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, CounterError> {
        let now = now_ms();
        let cutoff = now - i64::try_from(window.as_millis()).unwrap_or(i64::MAX);

        let count: i64 = sqlx::query_scalar(
            "INSERT INTO rate_counters (key, window_start, count) VALUES ($1, $2, 1) \
             ON CONFLICT (key) DO UPDATE SET \
                 count = CASE WHEN rate_counters.window_start > $3 THEN rate_counters.count + 1 ELSE 1 END, \
                 window_start = CASE WHEN rate_counters.window_start > $3 THEN rate_counters.window_start ELSE $2 END \
             RETURNING count",
        )
        .bind(key)
        .bind(now)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }
}

// =============================================================================
// TOKEN BUCKETS
// =============================================================================

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// In-process token buckets, keyed by caller-provided strings.
#[derive(Default)]
pub struct TokenBuckets {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl TokenBuckets {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take one token. Refill happens lazily on access.
    pub fn take(&self, key: &str, capacity: f64, refill_per_sec: f64) -> bool {
        self.take_at(key, capacity, refill_per_sec, Instant::now())
    }

    pub(crate) fn take_at(&self, key: &str, capacity: f64, refill_per_sec: f64, now: Instant) -> bool {
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let bucket = buckets
            .entry(key.to_string())
            .or_insert(Bucket { tokens: capacity, last_refill: now });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_sec).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// =============================================================================
// EVENT LIMITER
// =============================================================================

/// Per-class window limits, loaded from the environment.
#[derive(Debug, Clone, Copy)]
pub struct LimiterConfig {
    pub room_limit: u64,
    pub room_window: Duration,
    pub doc_limit: u64,
    pub doc_window: Duration,
    pub chat_limit: u64,
    pub chat_window: Duration,
    pub ephemeral_limit: u64,
    pub ephemeral_window: Duration,
    pub connect_limit: u64,
    pub connect_window: Duration,
}

impl LimiterConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            room_limit: env_parse("RATE_LIMIT_ROOM", DEFAULT_ROOM_LIMIT),
            room_window: Duration::from_secs(env_parse("RATE_LIMIT_ROOM_WINDOW_SECS", DEFAULT_ROOM_WINDOW_SECS)),
            doc_limit: env_parse("RATE_LIMIT_DOC", DEFAULT_DOC_LIMIT),
            doc_window: Duration::from_secs(env_parse("RATE_LIMIT_DOC_WINDOW_SECS", DEFAULT_DOC_WINDOW_SECS)),
            chat_limit: env_parse("RATE_LIMIT_CHAT", DEFAULT_CHAT_LIMIT),
            chat_window: Duration::from_secs(env_parse("RATE_LIMIT_CHAT_WINDOW_SECS", DEFAULT_CHAT_WINDOW_SECS)),
            ephemeral_limit: env_parse("RATE_LIMIT_EPHEMERAL", DEFAULT_EPHEMERAL_LIMIT),
            ephemeral_window: Duration::from_secs(env_parse(
                "RATE_LIMIT_EPHEMERAL_WINDOW_SECS",
                DEFAULT_EPHEMERAL_WINDOW_SECS,
            )),
            connect_limit: env_parse("RATE_LIMIT_CONNECT", DEFAULT_CONNECT_LIMIT),
            connect_window: Duration::from_secs(env_parse(
                "RATE_LIMIT_CONNECT_WINDOW_SECS",
                DEFAULT_CONNECT_WINDOW_SECS,
            )),
        }
    }
}

/// The per-event limiter applied by the dispatcher before any handler runs.
#[derive(Clone)]
pub struct EventLimiter {
    counters: Arc<dyn CounterStore>,
    buckets: Arc<TokenBuckets>,
    config: LimiterConfig,
}

impl EventLimiter {
    #[must_use]
    pub fn new(counters: Arc<dyn CounterStore>) -> Self {
        Self::with_config(counters, LimiterConfig::from_env())
    }

    #[must_use]
    pub fn with_config(counters: Arc<dyn CounterStore>, config: LimiterConfig) -> Self {
        Self { counters, buckets: Arc::new(TokenBuckets::new()), config }
    }

    /// Check one inbound event against its class limits.
    pub async fn check_event(&self, identity: Uuid, event: &str) -> LimitDecision {
        let (limit, window) = match classify(event) {
            EventClass::Signaling => return self.check_bucket(identity, event),
            EventClass::RoomControl | EventClass::Other => (self.config.room_limit, self.config.room_window),
            EventClass::DocumentWrite => (self.config.doc_limit, self.config.doc_window),
            EventClass::Chat => (self.config.chat_limit, self.config.chat_window),
            EventClass::Ephemeral => (self.config.ephemeral_limit, self.config.ephemeral_window),
        };

        let key = format!("{identity}:{event}");
        self.check_window(&key, limit, window).await
    }

    /// Check one connection attempt from a source address.
    pub async fn check_connect(&self, source: IpAddr) -> LimitDecision {
        let key = format!("connect:{source}");
        self.check_window(&key, self.config.connect_limit, self.config.connect_window)
            .await
    }

    async fn check_window(&self, key: &str, limit: u64, window: Duration) -> LimitDecision {
        match self.counters.increment(key, window).await {
            Ok(count) if count > limit => LimitDecision::Limited { limit, window_secs: window.as_secs() },
            Ok(_) => LimitDecision::Allowed,
            Err(e) => {
                // Fail open: availability over strict enforcement.
                warn!(key, error = %e, "counter store failed; allowing event");
                LimitDecision::Allowed
            }
        }
    }

    fn check_bucket(&self, identity: Uuid, event: &str) -> LimitDecision {
        let (capacity, refill) = if event == "rtc:ice" {
            (ICE_BUCKET_CAPACITY, ICE_BUCKET_REFILL_PER_SEC)
        } else {
            (OFFER_BUCKET_CAPACITY, OFFER_BUCKET_REFILL_PER_SEC)
        };

        let key = format!("{identity}:{event}");
        if self.buckets.take(&key, capacity, refill) {
            LimitDecision::Allowed
        } else {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let limit = capacity as u64;
            LimitDecision::Limited { limit, window_secs: 1 }
        }
    }
}

// =============================================================================
// MINIMUM-INTERVAL GATES
// =============================================================================

/// Rejects events from the same `(identity, room)` arriving closer together
/// than the configured interval. Document writes report the rejection;
/// cursor moves drop it silently.
pub struct MinIntervalGate {
    interval: Duration,
    last: Mutex<HashMap<(Uuid, Uuid), Instant>>,
}

impl MinIntervalGate {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: Mutex::new(HashMap::new()) }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns whether the event may pass; records the passage time if so.
    pub fn try_pass(&self, identity: Uuid, room: Uuid) -> bool {
        self.try_pass_at(identity, room, Instant::now())
    }

    pub(crate) fn try_pass_at(&self, identity: Uuid, room: Uuid, now: Instant) -> bool {
        let mut last = self
            .last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match last.get(&(identity, room)) {
            Some(&prev) if now.duration_since(prev) < self.interval => false,
            _ => {
                last.insert((identity, room), now);
                true
            }
        }
    }
}

#[cfg(test)]
#[path = "rate_limit_test.rs"]
mod tests;
