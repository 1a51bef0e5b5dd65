//! The key-value store collaborator.
//!
//! [`BucketStore`] is the only way the limiter touches shared state. It mirrors the
//! primitives a Redis-like store offers: point and multi-key reads and writes, a server
//! clock, pipelines, atomic batches, and the two registered procedures. Implement it for
//! any backend that can run both procedures indivisibly per key family.

use crate::keys::BucketKeys;
use async_trait::async_trait;
use std::time::Duration;

pub mod memory;
pub use memory::{InMemoryStore, MemoryStoreError};

/// One command inside an [`atomic_batch`](BucketStore::atomic_batch).
#[derive(Debug, Clone, PartialEq)]
pub enum BatchCommand {
    /// `SET key value [PX ttl]`
    Set { key: String, value: String, ttl: Option<Duration> },
    /// `INCRBYFLOAT key delta`
    IncrByFloat { key: String, delta: f64 },
    /// `PEXPIRE key ttl`
    Expire { key: String, ttl: Duration },
}

/// Per-command reply from an atomic batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BatchReply {
    /// Acknowledgement of `Set` / `Expire`.
    Done,
    /// New value after `IncrByFloat`.
    Value(f64),
}

impl BatchReply {
    pub fn value(self) -> Option<f64> {
        match self {
            BatchReply::Value(v) => Some(v),
            BatchReply::Done => None,
        }
    }
}

/// A TTL as whole milliseconds (`PX` / `PEXPIRE` argument), saturating at `u64::MAX`.
pub fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

/// Abstract storage interface for shared bucket state.
///
/// Values travel as strings, as they do on the wire; parsing is the limiter's job so a
/// corrupt value surfaces as `MalformedState` rather than a transport error.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Register both atomic procedures with the store.
    async fn load_procedures(&self) -> Result<(), Self::Error>;

    /// `GET key`
    async fn get(&self, key: &str) -> Result<Option<String>, Self::Error>;

    /// `SET key value NX`. Returns `true` if this call created the key.
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, Self::Error>;

    /// `MGET keys...`, one slot per key.
    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<String>>, Self::Error>;

    /// `MSET k1 v1 k2 v2 ...`
    async fn mset(&self, pairs: &[(&str, String)]) -> Result<(), Self::Error>;

    /// `INCRBYFLOAT key delta`, returning the new value.
    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64, Self::Error>;

    /// Store clock in epoch milliseconds.
    async fn time_millis(&self) -> Result<u64, Self::Error>;

    /// Store clock plus `MGET keys...` in one round trip.
    async fn snapshot(&self, keys: &[&str]) -> Result<(u64, Vec<Option<String>>), Self::Error>;

    /// Apply every command or none (`MULTI ... EXEC`).
    async fn atomic_batch(&self, commands: &[BatchCommand]) -> Result<Vec<BatchReply>, Self::Error>;

    /// Run conditional-decrement. `Ok(true)` if `count` tokens were consumed.
    async fn conditional_decrement(
        &self,
        keys: &BucketKeys,
        count: f64,
        tokens_per_second: f64,
    ) -> Result<bool, Self::Error>;

    /// Run reserve-with-expiry. `Ok(true)` if `amount` was added to the reservation.
    async fn reserve_with_expiry(
        &self,
        keys: &BucketKeys,
        amount: f64,
        capacity: f64,
        ttl: Duration,
    ) -> Result<bool, Self::Error>;
}

#[async_trait]
impl<T> BucketStore for std::sync::Arc<T>
where
    T: BucketStore + ?Sized,
{
    type Error = T::Error;

    async fn load_procedures(&self) -> Result<(), Self::Error> {
        (**self).load_procedures().await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Self::Error> {
        (**self).get(key).await
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, Self::Error> {
        (**self).set_if_absent(key, value).await
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<String>>, Self::Error> {
        (**self).mget(keys).await
    }

    async fn mset(&self, pairs: &[(&str, String)]) -> Result<(), Self::Error> {
        (**self).mset(pairs).await
    }

    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64, Self::Error> {
        (**self).incr_by_float(key, delta).await
    }

    async fn time_millis(&self) -> Result<u64, Self::Error> {
        (**self).time_millis().await
    }

    async fn snapshot(&self, keys: &[&str]) -> Result<(u64, Vec<Option<String>>), Self::Error> {
        (**self).snapshot(keys).await
    }

    async fn atomic_batch(&self, commands: &[BatchCommand]) -> Result<Vec<BatchReply>, Self::Error> {
        (**self).atomic_batch(commands).await
    }

    async fn conditional_decrement(
        &self,
        keys: &BucketKeys,
        count: f64,
        tokens_per_second: f64,
    ) -> Result<bool, Self::Error> {
        (**self).conditional_decrement(keys, count, tokens_per_second).await
    }

    async fn reserve_with_expiry(
        &self,
        keys: &BucketKeys,
        amount: f64,
        capacity: f64,
        ttl: Duration,
    ) -> Result<bool, Self::Error> {
        (**self).reserve_with_expiry(keys, amount, capacity, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_is_sent_in_whole_milliseconds() {
        assert_eq!(ttl_millis(Duration::from_millis(5_000)), 5_000);
        assert_eq!(ttl_millis(Duration::from_micros(1_999)), 1);
        assert_eq!(ttl_millis(Duration::MAX), u64::MAX);
    }
}
