//! Error types for bucket operations and the admission layer
use std::fmt;
use std::sync::Arc;

/// Shared, cloneable handle to a store-level failure.
pub type StoreErrorSource = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by the distributed rate limiter.
///
/// Admission outcomes are never reported through this type: a denied request is
/// `Ok(false)`, an `Err` always means the policy could not be evaluated.
#[derive(thiserror::Error, Debug, Clone)]
pub enum BucketError {
    /// The stored `tokensPerSecond` disagrees with the value this process asked for.
    #[error(
        "tokensPerSecond mismatch for prefix '{prefix}': store has {stored}, requested {requested}"
    )]
    ConfigMismatch {
        /// Key prefix shared by both processes.
        prefix: String,
        /// Value found in the store.
        stored: f64,
        /// Value requested locally.
        requested: f64,
    },
    /// The key-value store rejected or failed to execute a command.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] StoreErrorSource),
    /// A bucket key holds a value that cannot be parsed.
    #[error("malformed state at '{key}': {reason}")]
    MalformedState {
        /// Store key holding the bad value.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
    /// Local configuration rejected before touching the store.
    #[error("invalid bucket configuration: {0}")]
    InvalidConfig(String),
    /// A token count passed to an operation was negative, NaN or infinite.
    #[error("token count must be finite and >= 0 (got {0})")]
    InvalidCount(f64),
    /// The initialization task ended without reporting an outcome.
    #[error("initialization aborted before completing")]
    InitializationAborted,
    /// Initialization failed; every call waiting on readiness receives this.
    #[error("error initiating rate limiter: {0}")]
    Initialization(#[source] Box<BucketError>),
}

impl BucketError {
    /// Wrap a store error.
    pub fn store<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        BucketError::StoreUnavailable(Arc::new(err))
    }

    pub(crate) fn malformed(key: &str, reason: impl Into<String>) -> Self {
        BucketError::MalformedState { key: key.to_string(), reason: reason.into() }
    }

    /// Check if this error is a configuration mismatch, directly or as the cause of a failed init.
    pub fn is_config_mismatch(&self) -> bool {
        matches!(self.root(), BucketError::ConfigMismatch { .. })
    }

    /// Check if this error came from the store transport.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self.root(), BucketError::StoreUnavailable(_))
    }

    /// Check if this error is due to unparseable stored state.
    pub fn is_malformed_state(&self) -> bool {
        matches!(self.root(), BucketError::MalformedState { .. })
    }

    /// Check if this error was handed out because initialization failed.
    pub fn is_initialization(&self) -> bool {
        matches!(self, BucketError::Initialization(_))
    }

    /// The innermost error, looking through `Initialization` wrappers.
    pub fn root(&self) -> &BucketError {
        match self {
            BucketError::Initialization(inner) => inner.root(),
            other => other,
        }
    }
}

/// Error returned by [`AdmissionService`](crate::middleware::AdmissionService).
#[derive(Debug, Clone)]
pub enum AdmissionError<E> {
    /// The bucket did not have enough tokens for this request.
    Denied { requested: f64 },
    /// The limiter could not evaluate the policy (store down, init failed, ...).
    Infrastructure(BucketError),
    /// The wrapped service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for AdmissionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Denied { requested } => {
                write!(f, "rate limited: {} tokens not available", requested)
            }
            Self::Infrastructure(e) => write!(f, "rate limiter unavailable: {}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AdmissionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Infrastructure(e) => Some(e),
            Self::Denied { .. } => None,
        }
    }
}

impl<E> AdmissionError<E> {
    /// Check if the request was denied by policy.
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied { .. })
    }
    /// Check if the limiter itself failed.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Infrastructure(_))
    }
    /// Check if this error wraps an inner service error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }
    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Borrow the limiter failure if present.
    pub fn as_bucket_error(&self) -> Option<&BucketError> {
        match self {
            Self::Infrastructure(e) => Some(e),
            _ => None,
        }
    }
}
