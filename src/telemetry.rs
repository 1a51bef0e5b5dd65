//! Telemetry for the distributed bucket.
//!
//! The limiter emits structured [`BucketEvent`]s for its lifecycle (ready, init failure)
//! and for every admission and reservation decision. Events flow through
//! [`TelemetrySink`] implementations, which are plain `tower::Service<BucketEvent>`s, so
//! they compose with standard tower combinators.
//!
//! # Event Types
//!
//! - **Lifecycle**: `Created`, `Attached`, `Ready`, `InitFailed`
//! - **Admission**: `Granted`, `Denied`, `Forced`
//! - **Reservation**: `Reserved`, `Rejected`, `Settled`
//!
//! ```rust
//! use dripline::telemetry::{AdmissionEvent, BucketEvent, DenyReason};
//!
//! let denied = BucketEvent::Admission(AdmissionEvent::Denied {
//!     count: 20.0,
//!     reason: DenyReason::ExceedsCapacity,
//! });
//! assert_eq!(denied.to_string(), "Admission::Denied(count=20, reason=exceeds_capacity)");
//! ```

pub mod events;
pub mod sinks;

pub use events::{
    event_to_json, AdmissionEvent, BucketEvent, DenyReason, LifecycleEvent, ReservationEvent,
};
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, TelemetrySink};
