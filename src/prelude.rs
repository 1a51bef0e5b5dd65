//! Convenient re-exports for common dripline types.
pub use crate::{
    error::{AdmissionError, BucketError},
    limiter::{DistributedRateLimiter, DistributedRateLimiterBuilder},
    middleware::{AdmissionLayer, RequestCost},
    store::{BucketStore, InMemoryStore},
    telemetry::{BucketEvent, LogSink, TelemetrySink},
    BucketConfig,
};
