#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # dripline
//!
//! A token bucket shared by every process that points at the same key-value store.
//!
//! ## Features
//!
//! - **Lazy refill**: no background timers; each call drips tokens in from the store clock
//! - **Atomic consumption** via two server-side procedures that re-derive the refill
//! - **Pre-authorization**: reserve an estimate now, settle the real cost later
//! - **Expiring reservations** so a crashed holder cannot pin capacity forever
//! - **Tower middleware** that admits requests by cost
//! - **Pluggable stores**: an in-process store for tests, Redis in `dripline-redis`
//!
//! ## Quick Start
//!
//! ```rust
//! use dripline::{DistributedRateLimiter, InMemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), dripline::BucketError> {
//!     let limiter = DistributedRateLimiter::builder(InMemoryStore::new(), "api")
//!         .tokens_per_second(10.0)
//!         .build()?;
//!
//!     // Calls wait for initialization on their own.
//!     if limiter.try_remove_tokens(1.0).await? {
//!         // admitted
//!     }
//!
//!     // Reserve before an operation of unknown cost, settle when it is known.
//!     if limiter.pre_auth(Some(4.0)).await? {
//!         let actual = 2.5;
//!         limiter.clear_transaction(actual, Some(4.0)).await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod adaptive;
pub mod clock;
pub mod config;
pub mod drip;
pub mod error;
pub mod keys;
pub mod limiter;
pub mod middleware;
pub mod prelude;
pub mod procedures;
pub mod readiness;
pub mod store;
pub mod telemetry;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BucketConfig, StoredConfig, DEFAULT_PRE_AUTH_COUNT, DEFAULT_PRE_AUTH_TTL};
pub use error::{AdmissionError, BucketError, StoreErrorSource};
pub use keys::BucketKeys;
pub use limiter::{DistributedRateLimiter, DistributedRateLimiterBuilder};
pub use middleware::{AdmissionLayer, AdmissionService, RequestCost, UnitCost};
pub use procedures::Procedure;
pub use store::{BatchCommand, BatchReply, BucketStore, InMemoryStore, MemoryStoreError};
pub use telemetry::{BucketEvent, LogSink, MemorySink, NullSink, TelemetrySink};
