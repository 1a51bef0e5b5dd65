//! Store key naming for one bucket.

/// The four keys that make up a bucket, all under one caller-supplied prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketKeys {
    prefix: String,
    conf: String,
    content: String,
    last_drip: String,
    pre_auth: String,
}

impl BucketKeys {
    /// Build the key set for `prefix`. The prefix is used verbatim; validate it first
    /// with [`BucketKeys::normalize_prefix`].
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            conf: format!("{prefix}.conf"),
            content: format!("{prefix}.content"),
            last_drip: format!("{prefix}.lastDrip"),
            pre_auth: format!("{prefix}.preAuth"),
            prefix,
        }
    }

    /// Trim the prefix and reject empty or control-character prefixes.
    pub fn normalize_prefix(prefix: &str) -> Result<String, String> {
        let p = prefix.trim();
        if p.is_empty() {
            return Err("key prefix cannot be empty".to_string());
        }
        if p.chars().any(|c| c.is_control()) {
            return Err("key prefix cannot contain control characters".to_string());
        }
        Ok(p.to_string())
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// JSON configuration shared by every attached process.
    pub fn conf(&self) -> &str {
        &self.conf
    }

    /// Current token count.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Epoch milliseconds of the last refill.
    pub fn last_drip(&self) -> &str {
        &self.last_drip
    }

    /// Outstanding pre-authorized tokens (expiring).
    pub fn pre_auth(&self) -> &str {
        &self.pre_auth
    }
}
