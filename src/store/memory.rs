//! In-process [`BucketStore`].
//!
//! Every command runs under one mutex, so the procedures are trivially atomic. Clones
//! share the same data, which makes it easy to attach several limiters ("processes") to
//! one bucket in tests. Expiry is evaluated lazily against the store's [`Clock`].

use super::{BatchCommand, BatchReply, BucketStore};
use crate::clock::{Clock, SystemClock};
use crate::keys::BucketKeys;
use crate::procedures::{self, Procedure};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Errors from [`InMemoryStore`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryStoreError {
    /// Injected outage, see [`InMemoryStore::set_unavailable`].
    #[error("store unavailable")]
    Unavailable,
    /// `INCRBYFLOAT` against a value that is not a number.
    #[error("value at '{0}' is not a valid float")]
    NotAFloat(String),
    /// A procedure was invoked before `load_procedures`.
    #[error("NOSCRIPT procedure '{0}' is not loaded")]
    NoScript(&'static str),
    /// A previous holder of the data lock panicked.
    #[error("store lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<u64>,
}

#[derive(Debug, Default)]
struct Data {
    entries: HashMap<String, Entry>,
    loaded: HashSet<Procedure>,
}

impl Data {
    fn live(&mut self, key: &str, now: u64) -> Option<&Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map_or(false, |at| at <= now);
        if expired {
            self.entries.remove(key);
        }
        self.entries.get(key)
    }

    fn get(&mut self, key: &str, now: u64) -> Option<String> {
        self.live(key, now).map(|e| e.value.clone())
    }

    fn get_f64(&mut self, key: &str, now: u64) -> Option<f64> {
        self.get(key, now).and_then(|v| v.parse().ok())
    }

    fn get_u64(&mut self, key: &str, now: u64) -> Option<u64> {
        self.get(key, now).and_then(|v| v.parse::<f64>().ok()).map(|v| v.max(0.0) as u64)
    }

    fn set(&mut self, key: &str, value: String, expires_at: Option<u64>) {
        self.entries.insert(key.to_string(), Entry { value, expires_at });
    }

    fn incr_by_float(&mut self, key: &str, delta: f64, now: u64) -> Result<f64, MemoryStoreError> {
        let (current, expires_at) = match self.live(key, now) {
            Some(e) => (
                e.value.parse::<f64>().map_err(|_| MemoryStoreError::NotAFloat(key.to_string()))?,
                e.expires_at,
            ),
            None => (0.0, None),
        };
        let next = current + delta;
        self.set(key, next.to_string(), expires_at);
        Ok(next)
    }

    fn require(&self, procedure: Procedure) -> Result<(), MemoryStoreError> {
        if self.loaded.contains(&procedure) {
            Ok(())
        } else {
            Err(MemoryStoreError::NoScript(procedure.name()))
        }
    }
}

/// Simple in-memory bucket store.
#[derive(Clone, Debug)]
pub struct InMemoryStore {
    data: Arc<Mutex<Data>>,
    clock: Arc<dyn Clock>,
    unavailable: Arc<AtomicBool>,
    procedure_calls: Arc<AtomicUsize>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Store driven by the system wall clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Store driven by a custom clock (e.g. [`ManualClock`](crate::clock::ManualClock)).
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self {
            data: Arc::new(Mutex::new(Data::default())),
            clock: Arc::new(clock),
            unavailable: Arc::new(AtomicBool::new(false)),
            procedure_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make every subsequent command fail with [`MemoryStoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of procedure invocations served so far.
    pub fn procedure_calls(&self) -> usize {
        self.procedure_calls.load(Ordering::SeqCst)
    }

    /// Read a raw value, honoring expiry, without going through the async API.
    pub fn peek(&self, key: &str) -> Option<String> {
        let now = self.clock.now_millis();
        self.data.lock().ok().and_then(|mut d| d.get(key, now))
    }

    /// Write a raw value with no expiry.
    pub fn put(&self, key: &str, value: impl Into<String>) {
        if let Ok(mut d) = self.data.lock() {
            d.set(key, value.into(), None);
        }
    }

    /// Remaining lifetime of a key, if it exists and has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now_millis();
        let mut d = self.data.lock().ok()?;
        let at = d.live(key, now)?.expires_at?;
        Some(Duration::from_millis(at.saturating_sub(now)))
    }

    fn lock(&self) -> Result<(MutexGuard<'_, Data>, u64), MemoryStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MemoryStoreError::Unavailable);
        }
        let guard = self.data.lock().map_err(|_| MemoryStoreError::Poisoned)?;
        Ok((guard, self.clock.now_millis()))
    }

    fn expiry(now: u64, ttl: Duration) -> u64 {
        now.saturating_add(super::ttl_millis(ttl))
    }
}

#[async_trait]
impl BucketStore for InMemoryStore {
    type Error = MemoryStoreError;

    async fn load_procedures(&self) -> Result<(), Self::Error> {
        let (mut d, _) = self.lock()?;
        d.loaded.extend(Procedure::ALL);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Self::Error> {
        let (mut d, now) = self.lock()?;
        Ok(d.get(key, now))
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, Self::Error> {
        let (mut d, now) = self.lock()?;
        if d.live(key, now).is_some() {
            return Ok(false);
        }
        d.set(key, value.to_string(), None);
        Ok(true)
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<String>>, Self::Error> {
        let (mut d, now) = self.lock()?;
        Ok(keys.iter().map(|k| d.get(k, now)).collect())
    }

    async fn mset(&self, pairs: &[(&str, String)]) -> Result<(), Self::Error> {
        let (mut d, _) = self.lock()?;
        for (k, v) in pairs {
            d.set(k, v.clone(), None);
        }
        Ok(())
    }

    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64, Self::Error> {
        let (mut d, now) = self.lock()?;
        d.incr_by_float(key, delta, now)
    }

    async fn time_millis(&self) -> Result<u64, Self::Error> {
        let (_data, now) = self.lock()?;
        Ok(now)
    }

    async fn snapshot(&self, keys: &[&str]) -> Result<(u64, Vec<Option<String>>), Self::Error> {
        let (mut d, now) = self.lock()?;
        Ok((now, keys.iter().map(|k| d.get(k, now)).collect()))
    }

    async fn atomic_batch(&self, commands: &[BatchCommand]) -> Result<Vec<BatchReply>, Self::Error> {
        let (mut d, now) = self.lock()?;
        // Reject the whole batch up front so nothing is half-applied.
        for cmd in commands {
            if let BatchCommand::IncrByFloat { key, .. } = cmd {
                if let Some(e) = d.live(key, now) {
                    if e.value.parse::<f64>().is_err() {
                        return Err(MemoryStoreError::NotAFloat(key.clone()));
                    }
                }
            }
        }
        let mut replies = Vec::with_capacity(commands.len());
        for cmd in commands {
            match cmd {
                BatchCommand::Set { key, value, ttl } => {
                    d.set(key, value.clone(), ttl.map(|t| Self::expiry(now, t)));
                    replies.push(BatchReply::Done);
                }
                BatchCommand::IncrByFloat { key, delta } => {
                    replies.push(BatchReply::Value(d.incr_by_float(key, *delta, now)?));
                }
                BatchCommand::Expire { key, ttl } => {
                    if let Some(e) = d.entries.get_mut(key.as_str()) {
                        e.expires_at = Some(Self::expiry(now, *ttl));
                    }
                    replies.push(BatchReply::Done);
                }
            }
        }
        Ok(replies)
    }

    async fn conditional_decrement(
        &self,
        keys: &BucketKeys,
        count: f64,
        tokens_per_second: f64,
    ) -> Result<bool, Self::Error> {
        let (mut d, now) = self.lock()?;
        d.require(Procedure::ConditionalDecrement)?;
        self.procedure_calls.fetch_add(1, Ordering::SeqCst);

        let (Some(content), Some(last_drip)) =
            (d.get_f64(keys.content(), now), d.get_u64(keys.last_drip(), now))
        else {
            return Ok(false);
        };
        match procedures::conditional_decrement(content, last_drip, now, count, tokens_per_second) {
            Some(next) => {
                d.set(keys.content(), next.content.to_string(), None);
                d.set(keys.last_drip(), next.last_drip.to_string(), None);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reserve_with_expiry(
        &self,
        keys: &BucketKeys,
        amount: f64,
        capacity: f64,
        ttl: Duration,
    ) -> Result<bool, Self::Error> {
        let (mut d, now) = self.lock()?;
        d.require(Procedure::ReserveWithExpiry)?;
        self.procedure_calls.fetch_add(1, Ordering::SeqCst);

        let (Some(content), Some(last_drip)) =
            (d.get_f64(keys.content(), now), d.get_u64(keys.last_drip(), now))
        else {
            return Ok(false);
        };
        let reserved = d.get_f64(keys.pre_auth(), now).unwrap_or(0.0);
        match procedures::reserve_with_expiry(content, last_drip, reserved, now, amount, capacity) {
            Some(total) => {
                d.set(keys.pre_auth(), total.to_string(), Some(Self::expiry(now, ttl)));
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn seeded(clock: &ManualClock, content: f64) -> (InMemoryStore, BucketKeys) {
        let store = InMemoryStore::with_clock(clock.clone());
        let keys = BucketKeys::new("t");
        store.put(keys.content(), content.to_string());
        store.put(keys.last_drip(), clock.now_millis().to_string());
        (store, keys)
    }

    #[tokio::test]
    async fn procedures_require_loading() {
        let clock = ManualClock::new(0);
        let (store, keys) = seeded(&clock, 10.0);
        let err = store.conditional_decrement(&keys, 1.0, 10.0).await.unwrap_err();
        assert_eq!(err, MemoryStoreError::NoScript("conditional_decrement"));
        store.load_procedures().await.unwrap();
        assert!(store.conditional_decrement(&keys, 1.0, 10.0).await.unwrap());
        assert_eq!(store.procedure_calls(), 1);
    }

    #[tokio::test]
    async fn keys_expire_on_the_store_clock() {
        let clock = ManualClock::new(0);
        let store = InMemoryStore::with_clock(clock.clone());
        store
            .atomic_batch(&[BatchCommand::Set {
                key: "k".into(),
                value: "1".into(),
                ttl: Some(Duration::from_millis(100)),
            }])
            .await
            .unwrap();
        assert_eq!(store.ttl("k"), Some(Duration::from_millis(100)));
        clock.advance(Duration::from_millis(99));
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("1"));
        clock.advance(Duration::from_millis(1));
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn incr_by_float_keeps_ttl_and_rejects_text() {
        let clock = ManualClock::new(0);
        let store = InMemoryStore::with_clock(clock.clone());
        store
            .atomic_batch(&[BatchCommand::Set {
                key: "r".into(),
                value: "2".into(),
                ttl: Some(Duration::from_secs(5)),
            }])
            .await
            .unwrap();
        assert_eq!(store.incr_by_float("r", 1.5).await.unwrap(), 3.5);
        assert!(store.ttl("r").is_some());

        store.put("s", "abc");
        let err = store
            .atomic_batch(&[
                BatchCommand::IncrByFloat { key: "r".into(), delta: 1.0 },
                BatchCommand::IncrByFloat { key: "s".into(), delta: 1.0 },
            ])
            .await
            .unwrap_err();
        assert_eq!(err, MemoryStoreError::NotAFloat("s".into()));
        assert_eq!(store.peek("r").as_deref(), Some("3.5"), "batch must not half-apply");
    }

    #[tokio::test]
    async fn set_if_absent_only_writes_once() {
        let store = InMemoryStore::new();
        assert!(store.set_if_absent("c", "a").await.unwrap());
        assert!(!store.set_if_absent("c", "b").await.unwrap());
        assert_eq!(store.peek("c").as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn outage_fails_every_command() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        assert_eq!(store.get("x").await.unwrap_err(), MemoryStoreError::Unavailable);
        assert_eq!(store.time_millis().await.unwrap_err(), MemoryStoreError::Unavailable);
        store.set_unavailable(false);
        assert!(store.get("x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reserve_sets_expiring_counter() {
        let clock = ManualClock::new(1_000);
        let (store, keys) = seeded(&clock, 10.0);
        store.load_procedures().await.unwrap();
        let ttl = Duration::from_secs(5);
        assert!(store.reserve_with_expiry(&keys, 6.0, 10.0, ttl).await.unwrap());
        assert!(!store.reserve_with_expiry(&keys, 6.0, 10.0, ttl).await.unwrap());
        assert_eq!(store.peek(keys.pre_auth()).as_deref(), Some("6"));
        clock.advance(ttl);
        assert!(store.peek(keys.pre_auth()).is_none());
        assert!(store.reserve_with_expiry(&keys, 6.0, 10.0, ttl).await.unwrap());
    }
}
