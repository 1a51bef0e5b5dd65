//! Redis store for `dripline` (companion crate).
//! Bring your own `redis::aio::ConnectionManager`; both procedures run as Lua scripts.
//!
//! ```no_run
//! use dripline::DistributedRateLimiter;
//! use dripline_redis::RedisStore;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisStore::connect("redis://127.0.0.1:6379").await?;
//! let limiter = DistributedRateLimiter::builder(store, "api")
//!     .tokens_per_second(50.0)
//!     .connect()
//!     .await?;
//! let admitted = limiter.try_remove_tokens(1.0).await?;
//! # let _ = admitted;
//! # Ok(()) }
//! ```

use async_trait::async_trait;
use dripline::store::{ttl_millis, BatchCommand, BatchReply, BucketStore};
use dripline::{BucketKeys, Procedure};
use redis::aio::ConnectionManager;
use redis::{RedisError, RedisResult, Script, ScriptInvocation, Value};
use std::time::Duration;

/// [`BucketStore`] backed by Redis (or any server speaking its protocol with Lua).
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    decrement: Script,
    reserve: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("conn", &"<redis::aio::ConnectionManager>")
            .field("decrement", &self.decrement.get_hash())
            .field("reserve", &self.reserve.get_hash())
            .finish()
    }
}

impl RedisStore {
    /// Use an existing connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            decrement: Script::new(Procedure::ConditionalDecrement.lua()),
            reserve: Script::new(Procedure::ReserveWithExpiry.lua()),
        }
    }

    /// Open a client for `url` and wrap a new connection manager.
    pub async fn connect(url: &str) -> RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }

    fn invocation(&self, procedure: Procedure, keys: &BucketKeys) -> ScriptInvocation<'_> {
        let script = match procedure {
            Procedure::ConditionalDecrement => &self.decrement,
            Procedure::ReserveWithExpiry => &self.reserve,
        };
        let mut invocation = script.prepare_invoke();
        for key in procedure.keys(keys) {
            invocation.key(key);
        }
        invocation
    }
}

fn logged<T>(op: &'static str, result: RedisResult<T>) -> RedisResult<T> {
    if let Err(e) = &result {
        tracing::warn!(target: "dripline::redis", op, error = %e, "redis command failed");
    }
    result
}

#[async_trait]
impl BucketStore for RedisStore {
    type Error = RedisError;

    async fn load_procedures(&self) -> Result<(), Self::Error> {
        let mut conn = self.conn.clone();
        for procedure in Procedure::ALL {
            let sha: String = logged(
                "script_load",
                redis::cmd("SCRIPT").arg("LOAD").arg(procedure.lua()).query_async(&mut conn).await,
            )?;
            tracing::debug!(target: "dripline::redis", procedure = procedure.name(), sha = %sha, "loaded procedure");
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Self::Error> {
        let mut conn = self.conn.clone();
        logged("get", redis::cmd("GET").arg(key).query_async(&mut conn).await)
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, Self::Error> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = logged(
            "set_nx",
            redis::cmd("SET").arg(key).arg(value).arg("NX").query_async(&mut conn).await,
        )?;
        Ok(reply.is_some())
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<String>>, Self::Error> {
        let mut conn = self.conn.clone();
        logged("mget", redis::cmd("MGET").arg(keys).query_async(&mut conn).await)
    }

    async fn mset(&self, pairs: &[(&str, String)]) -> Result<(), Self::Error> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("MSET");
        for (key, value) in pairs {
            cmd.arg(*key).arg(value.as_str());
        }
        logged("mset", cmd.query_async(&mut conn).await)
    }

    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64, Self::Error> {
        let mut conn = self.conn.clone();
        logged("incrbyfloat", redis::cmd("INCRBYFLOAT").arg(key).arg(delta).query_async(&mut conn).await)
    }

    async fn time_millis(&self) -> Result<u64, Self::Error> {
        let mut conn = self.conn.clone();
        let (secs, micros): (u64, u64) =
            logged("time", redis::cmd("TIME").query_async(&mut conn).await)?;
        Ok(secs * 1000 + micros / 1000)
    }

    async fn snapshot(&self, keys: &[&str]) -> Result<(u64, Vec<Option<String>>), Self::Error> {
        let mut conn = self.conn.clone();
        let ((secs, micros), values): ((u64, u64), Vec<Option<String>>) = logged(
            "snapshot",
            redis::pipe().cmd("TIME").cmd("MGET").arg(keys).query_async(&mut conn).await,
        )?;
        Ok((secs * 1000 + micros / 1000, values))
    }

    async fn atomic_batch(&self, commands: &[BatchCommand]) -> Result<Vec<BatchReply>, Self::Error> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in commands {
            match command {
                BatchCommand::Set { key, value, ttl: Some(ttl) } => {
                    pipe.cmd("SET").arg(key).arg(value).arg("PX").arg(ttl_millis(*ttl));
                }
                BatchCommand::Set { key, value, ttl: None } => {
                    pipe.cmd("SET").arg(key).arg(value);
                }
                BatchCommand::IncrByFloat { key, delta } => {
                    pipe.cmd("INCRBYFLOAT").arg(key).arg(*delta);
                }
                BatchCommand::Expire { key, ttl } => {
                    pipe.cmd("PEXPIRE").arg(key).arg(ttl_millis(*ttl));
                }
            }
        }
        let values: Vec<Value> = logged("multi_exec", pipe.query_async(&mut conn).await)?;

        commands
            .iter()
            .zip(values.iter())
            .map(|(command, value)| match command {
                BatchCommand::IncrByFloat { .. } => {
                    redis::from_redis_value::<f64>(value).map(BatchReply::Value)
                }
                _ => Ok(BatchReply::Done),
            })
            .collect()
    }

    async fn conditional_decrement(
        &self,
        keys: &BucketKeys,
        count: f64,
        tokens_per_second: f64,
    ) -> Result<bool, Self::Error> {
        let mut conn = self.conn.clone();
        let mut invocation = self.invocation(Procedure::ConditionalDecrement, keys);
        invocation.arg(count).arg(tokens_per_second);
        let granted: i64 =
            logged("conditional_decrement", invocation.invoke_async(&mut conn).await)?;
        Ok(granted == 1)
    }

    async fn reserve_with_expiry(
        &self,
        keys: &BucketKeys,
        amount: f64,
        capacity: f64,
        ttl: Duration,
    ) -> Result<bool, Self::Error> {
        let mut conn = self.conn.clone();
        let mut invocation = self.invocation(Procedure::ReserveWithExpiry, keys);
        invocation.arg(amount).arg(capacity).arg(ttl_millis(ttl));
        let reserved: i64 =
            logged("reserve_with_expiry", invocation.invoke_async(&mut conn).await)?;
        Ok(reserved == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_hash_the_embedded_sources() {
        let a = Script::new(Procedure::ConditionalDecrement.lua());
        let b = Script::new(Procedure::ReserveWithExpiry.lua());
        assert_ne!(a.get_hash(), b.get_hash());
        assert_eq!(a.get_hash().len(), 40);
    }
}
