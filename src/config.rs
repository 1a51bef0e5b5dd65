//! Bucket configuration: local validation and the shared JSON record.

use crate::error::BucketError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default reservation size for [`pre_auth`](crate::DistributedRateLimiter::pre_auth).
pub const DEFAULT_PRE_AUTH_COUNT: f64 = 3.0;
/// Default lifetime of an unsettled reservation.
pub const DEFAULT_PRE_AUTH_TTL: Duration = Duration::from_secs(5);

/// Validated configuration for one bucket.
///
/// `tokens_per_second` is both the refill rate and the capacity, and must match across
/// every process attached to the prefix. `pre_auth_count` and `pre_auth_ttl` are local to
/// this process.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketConfig {
    tokens_per_second: f64,
    pre_auth_count: f64,
    pre_auth_ttl: Duration,
}

impl BucketConfig {
    /// Create a config with default pre-authorization settings.
    ///
    /// # Examples
    /// ```
    /// use dripline::BucketConfig;
    /// let cfg = BucketConfig::new(10.0).unwrap();
    /// assert_eq!(cfg.pre_auth_count(), 3.0);
    /// assert!(BucketConfig::new(0.0).is_err());
    /// ```
    pub fn new(tokens_per_second: f64) -> Result<Self, BucketError> {
        let cfg = Self {
            tokens_per_second,
            pre_auth_count: DEFAULT_PRE_AUTH_COUNT,
            pre_auth_ttl: DEFAULT_PRE_AUTH_TTL,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Override the default reservation size; must be finite and >= 0.
    pub fn with_pre_auth_count(mut self, count: f64) -> Result<Self, BucketError> {
        self.pre_auth_count = count;
        self.validate()?;
        Ok(self)
    }

    /// Override the reservation lifetime; must be at least one millisecond.
    pub fn with_pre_auth_ttl(mut self, ttl: Duration) -> Result<Self, BucketError> {
        self.pre_auth_ttl = ttl;
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), BucketError> {
        if !self.tokens_per_second.is_finite() || self.tokens_per_second <= 0.0 {
            return Err(BucketError::InvalidConfig(format!(
                "tokens_per_second must be a positive number (got {})",
                self.tokens_per_second
            )));
        }
        if !self.pre_auth_count.is_finite() || self.pre_auth_count < 0.0 {
            return Err(BucketError::InvalidConfig(format!(
                "pre_auth_count must be >= 0 (got {})",
                self.pre_auth_count
            )));
        }
        if self.pre_auth_ttl < Duration::from_millis(1) {
            return Err(BucketError::InvalidConfig(format!(
                "pre_auth_ttl must be at least 1ms (got {:?})",
                self.pre_auth_ttl
            )));
        }
        Ok(())
    }

    /// Refill rate, also the bucket capacity.
    pub fn tokens_per_second(&self) -> f64 {
        self.tokens_per_second
    }

    /// Capacity of the bucket (same as the rate).
    pub fn capacity(&self) -> f64 {
        self.tokens_per_second
    }

    /// Default reservation size.
    pub fn pre_auth_count(&self) -> f64 {
        self.pre_auth_count
    }

    /// Reservation lifetime.
    pub fn pre_auth_ttl(&self) -> Duration {
        self.pre_auth_ttl
    }

    /// Adopt the shared record. Only the rate is shared; local settings are kept.
    pub(crate) fn adopt(&self, stored: &StoredConfig) -> Self {
        Self { tokens_per_second: stored.tokens_per_second, ..self.clone() }
    }
}

/// The configuration record kept at `{prefix}.conf`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredConfig {
    pub tokens_per_second: f64,
    /// Written by older tooling; read but never adopted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_auth_count: Option<f64>,
}

impl StoredConfig {
    pub fn from_config(config: &BucketConfig) -> Self {
        Self { tokens_per_second: config.tokens_per_second, pre_auth_count: None }
    }

    /// Parse the raw value found at `key`.
    pub fn parse(key: &str, raw: &str) -> Result<Self, BucketError> {
        let stored: StoredConfig =
            serde_json::from_str(raw).map_err(|e| BucketError::malformed(key, e.to_string()))?;
        if !stored.tokens_per_second.is_finite() || stored.tokens_per_second <= 0.0 {
            return Err(BucketError::malformed(
                key,
                format!("tokensPerSecond must be positive (got {})", stored.tokens_per_second),
            ));
        }
        Ok(stored)
    }

    pub fn to_json(&self) -> String {
        // Serializing a struct of plain numbers cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!("{{\"tokensPerSecond\":{}}}", self.tokens_per_second)
        })
    }

    /// Fail with `ConfigMismatch` if the shared rate differs from the requested one.
    pub fn check_rate(&self, prefix: &str, requested: &BucketConfig) -> Result<(), BucketError> {
        if self.tokens_per_second != requested.tokens_per_second {
            return Err(BucketError::ConfigMismatch {
                prefix: prefix.to_string(),
                stored: self.tokens_per_second,
                requested: requested.tokens_per_second,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_or_non_finite_rates() {
        assert!(BucketConfig::new(0.0).is_err());
        assert!(BucketConfig::new(-1.0).is_err());
        assert!(BucketConfig::new(f64::NAN).is_err());
        assert!(BucketConfig::new(f64::INFINITY).is_err());
        assert!(BucketConfig::new(0.5).is_ok());
    }

    #[test]
    fn pre_auth_overrides_are_validated() {
        let cfg = BucketConfig::new(10.0).unwrap();
        assert!(cfg.clone().with_pre_auth_count(-1.0).is_err());
        assert!(cfg.clone().with_pre_auth_ttl(Duration::ZERO).is_err());
        let cfg = cfg
            .with_pre_auth_count(4.0)
            .unwrap()
            .with_pre_auth_ttl(Duration::from_millis(1500))
            .unwrap();
        assert_eq!(cfg.pre_auth_count(), 4.0);
        assert_eq!(cfg.pre_auth_ttl(), Duration::from_millis(1500));
    }

    #[test]
    fn stored_config_uses_camel_case_and_omits_pre_auth() {
        let cfg = BucketConfig::new(10.0).unwrap().with_pre_auth_count(7.0).unwrap();
        let json = StoredConfig::from_config(&cfg).to_json();
        assert_eq!(json, r#"{"tokensPerSecond":10.0}"#);
    }

    #[test]
    fn parse_accepts_integer_rates_and_ignores_extra_fields() {
        let stored =
            StoredConfig::parse("p.conf", r#"{"tokensPerSecond":10,"preAuthCount":9}"#).unwrap();
        assert_eq!(stored.tokens_per_second, 10.0);
        assert_eq!(stored.pre_auth_count, Some(9.0));

        let local = BucketConfig::new(10.0).unwrap();
        let adopted = local.adopt(&stored);
        assert_eq!(adopted.pre_auth_count(), DEFAULT_PRE_AUTH_COUNT);
    }

    #[test]
    fn parse_rejects_garbage() {
        let err = StoredConfig::parse("p.conf", "not json").unwrap_err();
        assert!(err.is_malformed_state());
        let err = StoredConfig::parse("p.conf", r#"{"tokensPerSecond":0}"#).unwrap_err();
        assert!(err.is_malformed_state());
        let err = StoredConfig::parse("p.conf", r#"{"rate":10}"#).unwrap_err();
        assert!(err.is_malformed_state());
    }

    #[test]
    fn check_rate_reports_mismatch() {
        let stored = StoredConfig { tokens_per_second: 10.0, pre_auth_count: None };
        let requested = BucketConfig::new(20.0).unwrap();
        let err = stored.check_rate("p", &requested).unwrap_err();
        assert!(err.is_config_mismatch());
        assert!(stored.check_rate("p", &BucketConfig::new(10.0).unwrap()).is_ok());
    }
}
