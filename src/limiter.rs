//! The distributed token bucket.
//!
//! [`DistributedRateLimiter`] ties the three parts of the protocol together:
//!
//! - **Lifecycle**: on build, a background task registers the procedures, validates or
//!   writes the shared configuration and seeds a full bucket. Calls made before it
//!   finishes wait for it; if it fails they all fail with the same error.
//! - **Drip**: every call first refills the bucket from the store clock and writes the
//!   result back. This step is intentionally not atomic; concurrent drips compute
//!   similar values from the same `lastDrip` and the next drip corrects any loss.
//! - **Consumption**: the decision itself is made by a procedure running on the store,
//!   which re-derives the content at its own instant of evaluation.
//!
//! Nothing about the bucket is cached between calls.

use crate::adaptive::DynamicConfig;
use crate::config::{BucketConfig, StoredConfig, DEFAULT_PRE_AUTH_COUNT, DEFAULT_PRE_AUTH_TTL};
use crate::drip;
use crate::error::BucketError;
use crate::keys::BucketKeys;
use crate::readiness::{self, Readiness, ReadinessSignal};
use crate::store::{BatchCommand, BucketStore};
use crate::telemetry::{
    emit_best_effort, AdmissionEvent, BucketEvent, DenyReason, LifecycleEvent, NullSink,
    ReservationEvent, TelemetrySink,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A token bucket whose state lives in a shared [`BucketStore`].
///
/// Clones share the same handle; use one per bucket and clone it into tasks.
///
/// # Examples
/// ```
/// use dripline::{DistributedRateLimiter, InMemoryStore};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), dripline::BucketError> {
/// let limiter = DistributedRateLimiter::builder(InMemoryStore::new(), "rate-limiter")
///     .tokens_per_second(10.0)
///     .connect()
///     .await?;
///
/// assert!(!limiter.try_remove_tokens(20.0).await?);
/// assert!(limiter.try_remove_tokens(2.2).await?);
/// # Ok(()) }
/// ```
pub struct DistributedRateLimiter<S, T = NullSink> {
    inner: Arc<Inner<S, T>>,
}

struct Inner<S, T> {
    store: S,
    keys: BucketKeys,
    config: DynamicConfig<BucketConfig>,
    readiness: Readiness,
    sink: T,
}

impl<S, T> Clone for DistributedRateLimiter<S, T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<S, T> std::fmt::Debug for DistributedRateLimiter<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedRateLimiter")
            .field("prefix", &self.inner.keys.prefix())
            .field("config", &self.inner.config.get())
            .field("ready", &self.inner.readiness.is_ready())
            .finish()
    }
}

/// Builder for [`DistributedRateLimiter`].
pub struct DistributedRateLimiterBuilder<S, T = NullSink> {
    store: S,
    prefix: String,
    tokens_per_second: Option<f64>,
    pre_auth_count: f64,
    pre_auth_ttl: Duration,
    sink: T,
}

impl<S> DistributedRateLimiter<S, NullSink>
where
    S: BucketStore + 'static,
{
    /// Start configuring a limiter for the bucket at `prefix` in `store`.
    pub fn builder(store: S, prefix: impl Into<String>) -> DistributedRateLimiterBuilder<S> {
        DistributedRateLimiterBuilder {
            store,
            prefix: prefix.into(),
            tokens_per_second: None,
            pre_auth_count: DEFAULT_PRE_AUTH_COUNT,
            pre_auth_ttl: DEFAULT_PRE_AUTH_TTL,
            sink: NullSink,
        }
    }
}

impl<S, T> DistributedRateLimiterBuilder<S, T>
where
    S: BucketStore + 'static,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    /// Refill rate and capacity. Required.
    pub fn tokens_per_second(mut self, rate: f64) -> Self {
        self.tokens_per_second = Some(rate);
        self
    }

    /// Default reservation size for [`DistributedRateLimiter::pre_auth`]. Defaults to 3.
    pub fn pre_auth_count(mut self, count: f64) -> Self {
        self.pre_auth_count = count;
        self
    }

    /// Lifetime of unsettled reservations. Defaults to 5 seconds.
    pub fn pre_auth_ttl(mut self, ttl: Duration) -> Self {
        self.pre_auth_ttl = ttl;
        self
    }

    /// Send lifecycle and decision events to `sink`.
    pub fn sink<U>(self, sink: U) -> DistributedRateLimiterBuilder<S, U>
    where
        U: TelemetrySink,
    {
        DistributedRateLimiterBuilder {
            store: self.store,
            prefix: self.prefix,
            tokens_per_second: self.tokens_per_second,
            pre_auth_count: self.pre_auth_count,
            pre_auth_ttl: self.pre_auth_ttl,
            sink,
        }
    }

    fn validate(&self) -> Result<(String, BucketConfig), BucketError> {
        let prefix = BucketKeys::normalize_prefix(&self.prefix).map_err(BucketError::InvalidConfig)?;
        let rate = self
            .tokens_per_second
            .ok_or_else(|| BucketError::InvalidConfig("tokens_per_second is required".into()))?;
        let config = BucketConfig::new(rate)?
            .with_pre_auth_count(self.pre_auth_count)?
            .with_pre_auth_ttl(self.pre_auth_ttl)?;
        Ok((prefix, config))
    }

    /// Validate the configuration and start initialization in the background.
    ///
    /// Returns immediately; operations wait for initialization on their own. Must be
    /// called from within a Tokio runtime.
    pub fn build(self) -> Result<DistributedRateLimiter<S, T>, BucketError> {
        let (prefix, config) = self.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            BucketError::InvalidConfig("building a limiter requires a Tokio runtime".into())
        })?;
        let (signal, readiness) = readiness::channel();
        let limiter = DistributedRateLimiter {
            inner: Arc::new(Inner {
                store: self.store,
                keys: BucketKeys::new(prefix),
                config: DynamicConfig::new(config),
                readiness,
                sink: self.sink,
            }),
        };
        let init = limiter.clone();
        runtime.spawn(async move { init.run_initialization(signal).await });
        Ok(limiter)
    }

    /// Build and wait until the bucket is ready.
    pub async fn connect(self) -> Result<DistributedRateLimiter<S, T>, BucketError> {
        let limiter = self.build()?;
        limiter.ready().await?;
        Ok(limiter)
    }
}

impl<S, T> DistributedRateLimiter<S, T>
where
    S: BucketStore + 'static,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    /// Wait for initialization. Resolves immediately once it has finished.
    pub async fn ready(&self) -> Result<(), BucketError> {
        self.inner.readiness.wait().await
    }

    /// Whether initialization has completed successfully.
    pub fn is_ready(&self) -> bool {
        self.inner.readiness.is_ready()
    }

    /// Configuration in effect (the store's record once attached).
    pub fn config(&self) -> Arc<BucketConfig> {
        self.inner.config.get()
    }

    /// Store keys backing this bucket.
    pub fn keys(&self) -> &BucketKeys {
        &self.inner.keys
    }

    /// Consume `count` tokens if available. `Ok(false)` means denied by policy.
    ///
    /// Requests larger than the bucket capacity are always denied without touching the
    /// store. Otherwise a drip gives a local estimate; if that is already short the store
    /// is not asked. The store's conditional-decrement makes the final decision.
    pub async fn try_remove_tokens(&self, count: f64) -> Result<bool, BucketError> {
        check_count(count)?;
        self.ready().await?;
        let cfg = self.config();
        if count > cfg.tokens_per_second() {
            debug!(prefix = %self.inner.keys.prefix(), count, "request exceeds bucket capacity");
            self.deny(count, DenyReason::ExceedsCapacity).await;
            return Ok(false);
        }

        let estimate = self.drip_with(&cfg).await?;
        if estimate < count {
            debug!(prefix = %self.inner.keys.prefix(), count, estimate, "denied on local estimate");
            self.deny(count, DenyReason::LocalEstimate).await;
            return Ok(false);
        }

        let granted = self
            .inner
            .store
            .conditional_decrement(&self.inner.keys, count, cfg.tokens_per_second())
            .await
            .map_err(BucketError::store)?;
        debug!(prefix = %self.inner.keys.prefix(), count, granted, "conditional decrement");
        if granted {
            self.emit(BucketEvent::Admission(AdmissionEvent::Granted { count })).await;
        } else {
            self.deny(count, DenyReason::Store).await;
        }
        Ok(granted)
    }

    /// Unconditionally remove `count` tokens and return the resulting content.
    ///
    /// Content may go negative; it then takes longer to refill. Use
    /// [`try_remove_tokens`](Self::try_remove_tokens) when the limit must be enforced.
    pub async fn remove_tokens(&self, count: f64) -> Result<f64, BucketError> {
        check_count(count)?;
        self.ready().await?;
        let cfg = self.config();
        self.drip_with(&cfg).await?;
        let content = self
            .inner
            .store
            .incr_by_float(self.inner.keys.content(), -count)
            .await
            .map_err(BucketError::store)?;
        debug!(prefix = %self.inner.keys.prefix(), count, content, "forced removal");
        self.emit(BucketEvent::Admission(AdmissionEvent::Forced { count, content })).await;
        Ok(content)
    }

    /// Reserve capacity for an operation whose cost is not known yet.
    ///
    /// `estimate` defaults to the configured `pre_auth_count` and is clamped to the bucket
    /// capacity. The reservation succeeds only if content minus every outstanding
    /// reservation covers it, and it expires after `pre_auth_ttl` unless settled with
    /// [`clear_transaction`](Self::clear_transaction).
    pub async fn pre_auth(&self, estimate: Option<f64>) -> Result<bool, BucketError> {
        if let Some(e) = estimate {
            check_count(e)?;
        }
        self.ready().await?;
        let cfg = self.config();
        let amount = estimate.unwrap_or(cfg.pre_auth_count()).min(cfg.tokens_per_second());

        let estimate = self.drip_with(&cfg).await?;
        if estimate < amount {
            debug!(prefix = %self.inner.keys.prefix(), amount, estimate, "reservation denied on local estimate");
            self.emit(BucketEvent::Reservation(ReservationEvent::Rejected { amount })).await;
            return Ok(false);
        }

        let reserved = self
            .inner
            .store
            .reserve_with_expiry(
                &self.inner.keys,
                amount,
                cfg.tokens_per_second(),
                cfg.pre_auth_ttl(),
            )
            .await
            .map_err(BucketError::store)?;
        debug!(prefix = %self.inner.keys.prefix(), amount, reserved, "reserve with expiry");
        let event = if reserved {
            ReservationEvent::Reserved { amount }
        } else {
            ReservationEvent::Rejected { amount }
        };
        self.emit(BucketEvent::Reservation(event)).await;
        Ok(reserved)
    }

    /// Settle a reservation: take `actual` tokens from the bucket and release `reserved`
    /// (default `pre_auth_count`) from the reservation counter, in one atomic batch.
    ///
    /// Pass the amount originally reserved; a mismatch makes the counter drift. If the
    /// counter ends up negative it counts as zero for later reservations.
    pub async fn clear_transaction(
        &self,
        actual: f64,
        reserved: Option<f64>,
    ) -> Result<(), BucketError> {
        check_count(actual)?;
        if let Some(r) = reserved {
            check_count(r)?;
        }
        self.ready().await?;
        let cfg = self.config();
        let reserved = reserved.unwrap_or(cfg.pre_auth_count());
        let keys = &self.inner.keys;
        let replies = self
            .inner
            .store
            .atomic_batch(&[
                BatchCommand::IncrByFloat { key: keys.content().to_string(), delta: -actual },
                BatchCommand::IncrByFloat { key: keys.pre_auth().to_string(), delta: -reserved },
                BatchCommand::Expire { key: keys.pre_auth().to_string(), ttl: cfg.pre_auth_ttl() },
            ])
            .await
            .map_err(BucketError::store)?;

        if let Some(outstanding) = replies.get(1).and_then(|r| r.value()) {
            if outstanding < 0.0 {
                warn!(
                    prefix = %keys.prefix(),
                    reserved,
                    outstanding,
                    "settled more than was reserved (or the reservation expired); counter treated as zero"
                );
            }
        }
        debug!(prefix = %keys.prefix(), actual, reserved, "transaction cleared");
        self.emit(BucketEvent::Reservation(ReservationEvent::Settled { actual, reserved })).await;
        Ok(())
    }

    /// Current content after a drip. For introspection only; admission decisions must go
    /// through [`try_remove_tokens`](Self::try_remove_tokens) or [`pre_auth`](Self::pre_auth).
    pub async fn get_tokens_remaining(&self) -> Result<f64, BucketError> {
        self.drip().await
    }

    /// Refill the bucket from the store clock, write it back and return the content.
    pub async fn drip(&self) -> Result<f64, BucketError> {
        self.ready().await?;
        let cfg = self.config();
        self.drip_with(&cfg).await
    }

    async fn drip_with(&self, cfg: &BucketConfig) -> Result<f64, BucketError> {
        let keys = &self.inner.keys;
        let store = &self.inner.store;
        let (now, values) = store
            .snapshot(&[keys.content(), keys.last_drip()])
            .await
            .map_err(BucketError::store)?;
        let content = parse_content(keys.content(), values.first())?;
        let last_drip = parse_millis(keys.last_drip(), values.get(1))?;

        let next = drip::refill(content, last_drip, now, cfg.tokens_per_second());
        store
            .mset(&[
                (keys.content(), next.content.to_string()),
                (keys.last_drip(), next.last_drip.to_string()),
            ])
            .await
            .map_err(BucketError::store)?;
        Ok(next.content)
    }

    async fn run_initialization(&self, signal: ReadinessSignal) {
        let prefix = self.inner.keys.prefix().to_string();
        let outcome = self.initialize().await;
        match &outcome {
            Ok(()) => {
                info!(prefix = %prefix, "rate limiter ready");
                self.emit(BucketEvent::Lifecycle(LifecycleEvent::Ready { prefix })).await;
            }
            Err(e) => {
                error!(prefix = %prefix, error = %e, "rate limiter initialization failed");
                self.emit(BucketEvent::Lifecycle(LifecycleEvent::InitFailed {
                    prefix,
                    error: e.to_string(),
                }))
                .await;
            }
        }
        signal.resolve(outcome);
    }

    async fn initialize(&self) -> Result<(), BucketError> {
        let store = &self.inner.store;
        let keys = &self.inner.keys;
        let requested = self.config();

        store.load_procedures().await.map_err(BucketError::store)?;

        let existing = store.get(keys.conf()).await.map_err(BucketError::store)?;
        let stored = match existing {
            Some(raw) => self.attach(&raw, &requested).await?,
            None => {
                let fresh = StoredConfig::from_config(&requested);
                let created = store
                    .set_if_absent(keys.conf(), &fresh.to_json())
                    .await
                    .map_err(BucketError::store)?;
                if created {
                    info!(prefix = %keys.prefix(), tokens_per_second = fresh.tokens_per_second, "created bucket configuration");
                    self.emit(BucketEvent::Lifecycle(LifecycleEvent::Created {
                        prefix: keys.prefix().to_string(),
                        tokens_per_second: fresh.tokens_per_second,
                    }))
                    .await;
                    fresh
                } else {
                    // Another process won the write; validate what it wrote.
                    let raw = store.get(keys.conf()).await.map_err(BucketError::store)?.ok_or_else(
                        || BucketError::malformed(keys.conf(), "configuration vanished during initialization"),
                    )?;
                    self.attach(&raw, &requested).await?
                }
            }
        };
        if let Some(shared) = stored.pre_auth_count {
            debug!(prefix = %keys.prefix(), shared, local = requested.pre_auth_count(), "ignoring shared preAuthCount");
        }
        let adopted = requested.adopt(&stored);
        self.inner.config.set(adopted.clone());

        let current = store
            .mget(&[keys.content(), keys.last_drip()])
            .await
            .map_err(BucketError::store)?;
        if current.iter().any(Option::is_none) {
            let now = store.time_millis().await.map_err(BucketError::store)?;
            store
                .atomic_batch(&[
                    BatchCommand::Set {
                        key: keys.content().to_string(),
                        value: adopted.tokens_per_second().to_string(),
                        ttl: None,
                    },
                    BatchCommand::Set {
                        key: keys.last_drip().to_string(),
                        value: now.to_string(),
                        ttl: None,
                    },
                    BatchCommand::Set {
                        key: keys.pre_auth().to_string(),
                        value: "0".to_string(),
                        ttl: Some(adopted.pre_auth_ttl()),
                    },
                ])
                .await
                .map_err(BucketError::store)?;
            info!(prefix = %keys.prefix(), content = adopted.tokens_per_second(), "seeded full bucket");
        }
        Ok(())
    }

    async fn attach(
        &self,
        raw: &str,
        requested: &BucketConfig,
    ) -> Result<StoredConfig, BucketError> {
        let keys = &self.inner.keys;
        let stored = StoredConfig::parse(keys.conf(), raw)?;
        stored.check_rate(keys.prefix(), requested)?;
        info!(prefix = %keys.prefix(), tokens_per_second = stored.tokens_per_second, "attached to existing bucket");
        self.emit(BucketEvent::Lifecycle(LifecycleEvent::Attached {
            prefix: keys.prefix().to_string(),
            tokens_per_second: stored.tokens_per_second,
        }))
        .await;
        Ok(stored)
    }

    async fn deny(&self, count: f64, reason: DenyReason) {
        self.emit(BucketEvent::Admission(AdmissionEvent::Denied { count, reason })).await;
    }

    async fn emit(&self, event: BucketEvent) {
        emit_best_effort(self.inner.sink.clone(), event).await;
    }
}

fn check_count(count: f64) -> Result<(), BucketError> {
    if count.is_finite() && count >= 0.0 {
        Ok(())
    } else {
        Err(BucketError::InvalidCount(count))
    }
}

fn parse_content(key: &str, raw: Option<&Option<String>>) -> Result<f64, BucketError> {
    let raw = raw
        .and_then(Option::as_deref)
        .ok_or_else(|| BucketError::malformed(key, "missing; bucket is not initialized"))?;
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(BucketError::malformed(key, format!("expected a number, found '{raw}'"))),
    }
}

fn parse_millis(key: &str, raw: Option<&Option<String>>) -> Result<u64, BucketError> {
    let raw = raw
        .and_then(Option::as_deref)
        .ok_or_else(|| BucketError::malformed(key, "missing; bucket is not initialized"))?;
    if let Ok(v) = raw.parse::<u64>() {
        return Ok(v);
    }
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => Ok(v as u64),
        _ => Err(BucketError::malformed(key, format!("expected epoch milliseconds, found '{raw}'"))),
    }
}
