use super::*;

fn tight_config() -> LimiterConfig {
    LimiterConfig {
        room_limit: 3,
        room_window: Duration::from_secs(60),
        doc_limit: 5,
        doc_window: Duration::from_secs(60),
        chat_limit: 2,
        chat_window: Duration::from_secs(60),
        ephemeral_limit: 4,
        ephemeral_window: Duration::from_secs(60),
        connect_limit: 2,
        connect_window: Duration::from_secs(60),
    }
}

#[test]
fn classify_by_prefix() {
    assert_eq!(classify("room:join"), EventClass::RoomControl);
    assert_eq!(classify("whiteboard:replace"), EventClass::DocumentWrite);
    assert_eq!(classify("element:update"), EventClass::DocumentWrite);
    assert_eq!(classify("chat:send"), EventClass::Chat);
    assert_eq!(classify("rtc:offer"), EventClass::Signaling);
    assert_eq!(classify("cursor:move"), EventClass::Ephemeral);
    assert_eq!(classify("session:ping"), EventClass::Ephemeral);
    assert_eq!(classify("mystery:event"), EventClass::Other);
}

#[test]
fn window_allows_up_to_limit_then_rejects() {
    let store = MemoryCounterStore::new();
    let window = Duration::from_secs(60);
    let now = Instant::now();

    for i in 1..=5 {
        assert_eq!(store.increment_at("k", window, now), i);
    }
    // The caller compares against its limit; the 6th count is 6.
    assert_eq!(store.increment_at("k", window, now), 6);
}

#[test]
fn window_rolls_over_after_expiry() {
    let store = MemoryCounterStore::new();
    let window = Duration::from_secs(60);
    let start = Instant::now();

    for _ in 0..10 {
        store.increment_at("k", window, start);
    }

    // First event after the window rolls over counts from 1 again.
    let later = start + window + Duration::from_millis(1);
    assert_eq!(store.increment_at("k", window, later), 1);
}

#[test]
fn windows_are_per_key() {
    let store = MemoryCounterStore::new();
    let window = Duration::from_secs(60);
    let now = Instant::now();

    assert_eq!(store.increment_at("a", window, now), 1);
    assert_eq!(store.increment_at("b", window, now), 1);
    assert_eq!(store.increment_at("a", window, now), 2);
}

#[tokio::test]
async fn limiter_rejects_after_limit() {
    let limiter = EventLimiter::with_config(Arc::new(MemoryCounterStore::new()), tight_config());
    let identity = Uuid::new_v4();

    for _ in 0..2 {
        assert_eq!(limiter.check_event(identity, "chat:send").await, LimitDecision::Allowed);
    }
    assert!(matches!(
        limiter.check_event(identity, "chat:send").await,
        LimitDecision::Limited { limit: 2, .. }
    ));
}

#[tokio::test]
async fn limiter_keys_by_identity_and_event() {
    let limiter = EventLimiter::with_config(Arc::new(MemoryCounterStore::new()), tight_config());
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    for _ in 0..2 {
        assert_eq!(limiter.check_event(a, "chat:send").await, LimitDecision::Allowed);
    }
    assert!(matches!(limiter.check_event(a, "chat:send").await, LimitDecision::Limited { .. }));

    // Different identity, same event: unaffected.
    assert_eq!(limiter.check_event(b, "chat:send").await, LimitDecision::Allowed);
    // Same identity, different event: separate window.
    assert_eq!(limiter.check_event(a, "room:join").await, LimitDecision::Allowed);
}

#[tokio::test]
async fn connect_limit_is_per_source() {
    let limiter = EventLimiter::with_config(Arc::new(MemoryCounterStore::new()), tight_config());
    let here: IpAddr = "10.0.0.1".parse().unwrap();
    let there: IpAddr = "10.0.0.2".parse().unwrap();

    for _ in 0..2 {
        assert_eq!(limiter.check_connect(here).await, LimitDecision::Allowed);
    }
    assert!(matches!(limiter.check_connect(here).await, LimitDecision::Limited { .. }));
    assert_eq!(limiter.check_connect(there).await, LimitDecision::Allowed);
}

struct FailingCounterStore;

#[async_trait]
impl CounterStore for FailingCounterStore {
    async fn increment(&self, _key: &str, _window: Duration) -> Result<u64, CounterError> {
        Err(CounterError::Unavailable)
    }
}

#[tokio::test]
async fn counter_store_failure_fails_open() {
    let limiter = EventLimiter::with_config(Arc::new(FailingCounterStore), tight_config());
    let identity = Uuid::new_v4();

    // Far past any configured limit; every event is still allowed.
    for _ in 0..50 {
        assert_eq!(limiter.check_event(identity, "chat:send").await, LimitDecision::Allowed);
    }
}

#[test]
fn bucket_drains_and_refills() {
    let buckets = TokenBuckets::new();
    let start = Instant::now();

    for _ in 0..3 {
        assert!(buckets.take_at("k", 3.0, 1.0, start));
    }
    assert!(!buckets.take_at("k", 3.0, 1.0, start));

    // One second refills one token.
    let later = start + Duration::from_secs(1);
    assert!(buckets.take_at("k", 3.0, 1.0, later));
    assert!(!buckets.take_at("k", 3.0, 1.0, later));
}

#[test]
fn bucket_never_exceeds_capacity() {
    let buckets = TokenBuckets::new();
    let start = Instant::now();

    // Long idle must not accumulate beyond capacity.
    let much_later = start + Duration::from_secs(3600);
    assert!(buckets.take_at("k", 2.0, 10.0, start));
    assert!(buckets.take_at("k", 2.0, 10.0, much_later));
    assert!(buckets.take_at("k", 2.0, 10.0, much_later));
    assert!(!buckets.take_at("k", 2.0, 10.0, much_later));
}

#[tokio::test]
async fn signaling_uses_buckets_not_windows() {
    let limiter = EventLimiter::with_config(Arc::new(FailingCounterStore), tight_config());
    let identity = Uuid::new_v4();

    // Buckets are in-process; the failing counter store is never consulted.
    assert_eq!(limiter.check_event(identity, "rtc:offer").await, LimitDecision::Allowed);
}

#[test]
fn gate_enforces_min_interval() {
    let gate = MinIntervalGate::new(Duration::from_millis(100));
    let identity = Uuid::new_v4();
    let room = Uuid::new_v4();
    let start = Instant::now();

    assert!(gate.try_pass_at(identity, room, start));
    assert!(!gate.try_pass_at(identity, room, start + Duration::from_millis(10)));
    assert!(gate.try_pass_at(identity, room, start + Duration::from_millis(100)));
}

#[test]
fn gate_is_per_identity_and_room() {
    let gate = MinIntervalGate::new(Duration::from_millis(100));
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let room = Uuid::new_v4();
    let other_room = Uuid::new_v4();
    let now = Instant::now();

    assert!(gate.try_pass_at(a, room, now));
    // A different identity writes to the same room within the interval.
    assert!(gate.try_pass_at(b, room, now + Duration::from_millis(10)));
    // The same identity writes to a different room within the interval.
    assert!(gate.try_pass_at(a, other_room, now + Duration::from_millis(10)));
    // But the same (identity, room) pair is still gated.
    assert!(!gate.try_pass_at(a, room, now + Duration::from_millis(10)));
}
