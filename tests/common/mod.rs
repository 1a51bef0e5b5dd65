#![allow(dead_code)]

use dripline::{DistributedRateLimiter, InMemoryStore, ManualClock, MemorySink};

/// Fixed starting instant for deterministic store clocks.
pub const T0: u64 = 1_700_000_000_000;

pub fn manual_store() -> (ManualClock, InMemoryStore) {
    let clock = ManualClock::new(T0);
    let store = InMemoryStore::with_clock(clock.clone());
    (clock, store)
}

pub async fn attach(
    store: &InMemoryStore,
    prefix: &str,
    rate: f64,
) -> DistributedRateLimiter<InMemoryStore> {
    DistributedRateLimiter::builder(store.clone(), prefix)
        .tokens_per_second(rate)
        .connect()
        .await
        .expect("limiter should initialize")
}

pub async fn attach_with_sink(
    store: &InMemoryStore,
    prefix: &str,
    rate: f64,
) -> (DistributedRateLimiter<InMemoryStore, MemorySink>, MemorySink) {
    let sink = MemorySink::new();
    let limiter = DistributedRateLimiter::builder(store.clone(), prefix)
        .tokens_per_second(rate)
        .sink(sink.clone())
        .connect()
        .await
        .expect("limiter should initialize");
    (limiter, sink)
}

pub fn assert_close(actual: f64, expected: f64) {
    assert!((actual - expected).abs() < 1e-9, "expected {expected}, got {actual}");
}

pub fn stored_f64(store: &InMemoryStore, key: &str) -> f64 {
    store
        .peek(key)
        .unwrap_or_else(|| panic!("{key} missing"))
        .parse()
        .unwrap_or_else(|_| panic!("{key} not a number"))
}
