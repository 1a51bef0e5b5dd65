//! The store's procedures have the final say even when the local estimate passed.

mod common;

use async_trait::async_trait;
use common::{assert_close, manual_store, stored_f64};
use dripline::store::{BatchCommand, BatchReply, BucketStore};
use dripline::telemetry::{AdmissionEvent, DenyReason, ReservationEvent};
use dripline::{
    BucketEvent, BucketKeys, DistributedRateLimiter, InMemoryStore, MemorySink, MemoryStoreError,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Lets another process consume tokens between the local drip and the procedure call.
#[derive(Clone)]
struct Contended {
    inner: InMemoryStore,
    pending: Arc<Mutex<Option<f64>>>,
}

impl Contended {
    fn new(inner: InMemoryStore) -> Self {
        Self { inner, pending: Arc::new(Mutex::new(None)) }
    }

    /// Consume `count` tokens just before the next procedure runs.
    fn consume_before_next_procedure(&self, count: f64) {
        *self.pending.lock().unwrap() = Some(count);
    }

    async fn interleave(&self, keys: &BucketKeys) -> Result<(), MemoryStoreError> {
        let pending = self.pending.lock().unwrap().take();
        if let Some(count) = pending {
            self.inner.incr_by_float(keys.content(), -count).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BucketStore for Contended {
    type Error = MemoryStoreError;

    async fn load_procedures(&self) -> Result<(), Self::Error> {
        self.inner.load_procedures().await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Self::Error> {
        self.inner.get(key).await
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, Self::Error> {
        self.inner.set_if_absent(key, value).await
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<String>>, Self::Error> {
        self.inner.mget(keys).await
    }

    async fn mset(&self, pairs: &[(&str, String)]) -> Result<(), Self::Error> {
        self.inner.mset(pairs).await
    }

    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64, Self::Error> {
        self.inner.incr_by_float(key, delta).await
    }

    async fn time_millis(&self) -> Result<u64, Self::Error> {
        self.inner.time_millis().await
    }

    async fn snapshot(&self, keys: &[&str]) -> Result<(u64, Vec<Option<String>>), Self::Error> {
        self.inner.snapshot(keys).await
    }

    async fn atomic_batch(&self, commands: &[BatchCommand]) -> Result<Vec<BatchReply>, Self::Error> {
        self.inner.atomic_batch(commands).await
    }

    async fn conditional_decrement(
        &self,
        keys: &BucketKeys,
        count: f64,
        tokens_per_second: f64,
    ) -> Result<bool, Self::Error> {
        self.interleave(keys).await?;
        self.inner.conditional_decrement(keys, count, tokens_per_second).await
    }

    async fn reserve_with_expiry(
        &self,
        keys: &BucketKeys,
        amount: f64,
        capacity: f64,
        ttl: Duration,
    ) -> Result<bool, Self::Error> {
        self.interleave(keys).await?;
        self.inner.reserve_with_expiry(keys, amount, capacity, ttl).await
    }
}

type Harness = (InMemoryStore, Contended, DistributedRateLimiter<Contended, MemorySink>, MemorySink);

async fn contended(prefix: &str) -> Harness {
    let (_clock, store) = manual_store();
    let shared = Contended::new(store.clone());
    let sink = MemorySink::new();
    let limiter = DistributedRateLimiter::builder(shared.clone(), prefix)
        .tokens_per_second(10.0)
        .sink(sink.clone())
        .connect()
        .await
        .expect("limiter should initialize");
    sink.clear();
    (store, shared, limiter, sink)
}

#[tokio::test]
async fn store_refuses_decrement_after_local_estimate_passes() {
    let (store, shared, limiter, sink) = contended("raced").await;

    shared.consume_before_next_procedure(8.0);
    assert!(!limiter.try_remove_tokens(5.0).await.unwrap());

    assert_close(stored_f64(&store, "raced.content"), 2.0);
    assert_eq!(
        sink.events(),
        vec![BucketEvent::Admission(AdmissionEvent::Denied {
            count: 5.0,
            reason: DenyReason::Store,
        })]
    );

    assert!(limiter.try_remove_tokens(2.0).await.unwrap());
    assert_close(stored_f64(&store, "raced.content"), 0.0);
}

#[tokio::test]
async fn store_refuses_reservation_after_local_estimate_passes() {
    let (store, shared, limiter, sink) = contended("held").await;

    shared.consume_before_next_procedure(8.0);
    assert!(!limiter.pre_auth(Some(6.0)).await.unwrap());

    assert_close(stored_f64(&store, "held.content"), 2.0);
    assert_close(stored_f64(&store, "held.preAuth"), 0.0);
    assert_eq!(
        sink.events(),
        vec![BucketEvent::Reservation(ReservationEvent::Rejected { amount: 6.0 })]
    );
}
