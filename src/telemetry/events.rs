use serde_json::json;
use std::fmt;

/// Events emitted by a [`DistributedRateLimiter`](crate::DistributedRateLimiter).
#[derive(Debug, Clone, PartialEq)]
pub enum BucketEvent {
    /// Initialization and attachment
    Lifecycle(LifecycleEvent),
    /// `try_remove_tokens` / `remove_tokens` outcomes
    Admission(AdmissionEvent),
    /// `pre_auth` / `clear_transaction` outcomes
    Reservation(ReservationEvent),
}

/// Events emitted while establishing bucket state.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// This process wrote the shared configuration.
    Created {
        /// Key prefix of the bucket
        prefix: String,
        /// Rate written to the store
        tokens_per_second: f64,
    },
    /// A configuration already existed and matched.
    Attached {
        /// Key prefix of the bucket
        prefix: String,
        /// Rate found in the store
        tokens_per_second: f64,
    },
    /// Initialization finished; calls are being served.
    ///
    /// Emitted exactly once per limiter.
    Ready {
        /// Key prefix of the bucket
        prefix: String,
    },
    /// Initialization failed; every waiting call was failed with the same error.
    InitFailed {
        /// Key prefix of the bucket
        prefix: String,
        /// Rendered error
        error: String,
    },
}

/// Why a `try_remove_tokens` call was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The request is larger than the bucket can ever hold.
    ExceedsCapacity,
    /// The local drip estimate was already short; the store was not asked.
    LocalEstimate,
    /// The atomic procedure found too few tokens.
    Store,
}

/// Events emitted by token consumption.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionEvent {
    /// Tokens were consumed atomically.
    Granted {
        /// Tokens consumed
        count: f64,
    },
    /// The request was refused by policy.
    Denied {
        /// Tokens requested
        count: f64,
        /// Where the refusal was decided
        reason: DenyReason,
    },
    /// An unconditional `remove_tokens`.
    Forced {
        /// Tokens removed
        count: f64,
        /// Content after removal, possibly negative
        content: f64,
    },
}

/// Events emitted by pre-authorization.
#[derive(Debug, Clone, PartialEq)]
pub enum ReservationEvent {
    /// Capacity was reserved.
    Reserved {
        /// Tokens reserved (after clamping)
        amount: f64,
    },
    /// Not enough capacity net of outstanding reservations.
    Rejected {
        /// Tokens requested (after clamping)
        amount: f64,
    },
    /// A reservation was settled with its real cost.
    Settled {
        /// Real cost taken from content
        actual: f64,
        /// Amount released from the reservation counter
        reserved: f64,
    },
}

impl fmt::Display for BucketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketEvent::Lifecycle(event) => write!(f, "Lifecycle::{}", event),
            BucketEvent::Admission(event) => write!(f, "Admission::{}", event),
            BucketEvent::Reservation(event) => write!(f, "Reservation::{}", event),
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::Created { prefix, tokens_per_second } => {
                write!(f, "Created(prefix={}, rate={})", prefix, tokens_per_second)
            }
            LifecycleEvent::Attached { prefix, tokens_per_second } => {
                write!(f, "Attached(prefix={}, rate={})", prefix, tokens_per_second)
            }
            LifecycleEvent::Ready { prefix } => write!(f, "Ready(prefix={})", prefix),
            LifecycleEvent::InitFailed { prefix, error } => {
                write!(f, "InitFailed(prefix={}, error={})", prefix, error)
            }
        }
    }
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::ExceedsCapacity => "exceeds_capacity",
            DenyReason::LocalEstimate => "local_estimate",
            DenyReason::Store => "store",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::Granted { count } => write!(f, "Granted(count={})", count),
            AdmissionEvent::Denied { count, reason } => {
                write!(f, "Denied(count={}, reason={})", count, reason)
            }
            AdmissionEvent::Forced { count, content } => {
                write!(f, "Forced(count={}, content={})", count, content)
            }
        }
    }
}

impl fmt::Display for ReservationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReservationEvent::Reserved { amount } => write!(f, "Reserved(amount={})", amount),
            ReservationEvent::Rejected { amount } => write!(f, "Rejected(amount={})", amount),
            ReservationEvent::Settled { actual, reserved } => {
                write!(f, "Settled(actual={}, reserved={})", actual, reserved)
            }
        }
    }
}

/// Convert a BucketEvent into a JSON value for sinks.
pub fn event_to_json(event: &BucketEvent) -> serde_json::Value {
    match event {
        BucketEvent::Lifecycle(l) => match l {
            LifecycleEvent::Created { prefix, tokens_per_second } => json!({
                "kind": "bucket_created",
                "prefix": prefix,
                "tokens_per_second": tokens_per_second,
            }),
            LifecycleEvent::Attached { prefix, tokens_per_second } => json!({
                "kind": "bucket_attached",
                "prefix": prefix,
                "tokens_per_second": tokens_per_second,
            }),
            LifecycleEvent::Ready { prefix } => json!({ "kind": "ready", "prefix": prefix }),
            LifecycleEvent::InitFailed { prefix, error } => {
                json!({ "kind": "init_failed", "prefix": prefix, "error": error })
            }
        },
        BucketEvent::Admission(a) => match a {
            AdmissionEvent::Granted { count } => json!({ "kind": "granted", "count": count }),
            AdmissionEvent::Denied { count, reason } => {
                json!({ "kind": "denied", "count": count, "reason": reason.as_str() })
            }
            AdmissionEvent::Forced { count, content } => {
                json!({ "kind": "forced", "count": count, "content": content })
            }
        },
        BucketEvent::Reservation(r) => match r {
            ReservationEvent::Reserved { amount } => json!({ "kind": "reserved", "amount": amount }),
            ReservationEvent::Rejected { amount } => {
                json!({ "kind": "reservation_rejected", "amount": amount })
            }
            ReservationEvent::Settled { actual, reserved } => {
                json!({ "kind": "settled", "actual": actual, "reserved": reserved })
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_namespaced() {
        let e = BucketEvent::Lifecycle(LifecycleEvent::Ready { prefix: "api".into() });
        assert_eq!(e.to_string(), "Lifecycle::Ready(prefix=api)");
        let e = BucketEvent::Reservation(ReservationEvent::Settled { actual: 2.5, reserved: 3.0 });
        assert_eq!(e.to_string(), "Reservation::Settled(actual=2.5, reserved=3)");
    }

    #[test]
    fn json_kinds() {
        let e = BucketEvent::Admission(AdmissionEvent::Denied {
            count: 4.0,
            reason: DenyReason::LocalEstimate,
        });
        let v = event_to_json(&e);
        assert_eq!(v["kind"], "denied");
        assert_eq!(v["reason"], "local_estimate");
        assert_eq!(v["count"], 4.0);

        let e = BucketEvent::Lifecycle(LifecycleEvent::InitFailed {
            prefix: "p".into(),
            error: "nope".into(),
        });
        assert_eq!(event_to_json(&e)["kind"], "init_failed");
    }
}
