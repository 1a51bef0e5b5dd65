//! The two server-side procedures that make check-and-consume atomic.
//!
//! Each procedure re-derives the bucket content with the drip formula at the instant the
//! store runs it, so the decision is made against the store's clock rather than the
//! caller's stale estimate. Stores that can run Lua (Redis, Valkey, KeyDB) load the
//! sources below; [`InMemoryStore`](crate::store::InMemoryStore) runs the Rust
//! evaluators under its lock.

use crate::drip::{refill, Drip};
use crate::keys::BucketKeys;

/// Lua source for `conditional-decrement(content, lastDrip; count, tokensPerSecond) -> 0|1`.
pub const CONDITIONAL_DECREMENT_LUA: &str = include_str!("procedures/conditional_decrement.lua");

/// Lua source for `reserve-with-expiry(content, lastDrip, preAuth; amount, capacity, ttlMs) -> 0|1`.
pub const RESERVE_WITH_EXPIRY_LUA: &str = include_str!("procedures/reserve_with_expiry.lua");

/// Identifies a registered procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Procedure {
    /// Consume tokens only if the refilled content covers them.
    ConditionalDecrement,
    /// Add to the reservation only if refilled content minus reservations covers it.
    ReserveWithExpiry,
}

impl Procedure {
    /// Every procedure, in load order.
    pub const ALL: [Procedure; 2] = [Procedure::ConditionalDecrement, Procedure::ReserveWithExpiry];

    /// Stable identifier used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Procedure::ConditionalDecrement => "conditional_decrement",
            Procedure::ReserveWithExpiry => "reserve_with_expiry",
        }
    }

    /// Embedded Lua source.
    pub fn lua(self) -> &'static str {
        match self {
            Procedure::ConditionalDecrement => CONDITIONAL_DECREMENT_LUA,
            Procedure::ReserveWithExpiry => RESERVE_WITH_EXPIRY_LUA,
        }
    }

    /// Number of KEYS the script expects.
    pub fn key_count(self) -> usize {
        match self {
            Procedure::ConditionalDecrement => 2,
            Procedure::ReserveWithExpiry => 3,
        }
    }

    /// The bucket keys passed as KEYS, in script order.
    pub fn keys(self, bucket: &BucketKeys) -> Vec<&str> {
        let all = [bucket.content(), bucket.last_drip(), bucket.pre_auth()];
        all[..self.key_count()].to_vec()
    }
}

/// Evaluate conditional-decrement. Returns the state to write back on success, or `None`
/// if the refilled content does not cover `count`.
pub fn conditional_decrement(
    content: f64,
    last_drip: u64,
    now: u64,
    count: f64,
    tokens_per_second: f64,
) -> Option<Drip> {
    let dripped = refill(content, last_drip, now, tokens_per_second);
    if dripped.content < count {
        return None;
    }
    Some(Drip { content: dripped.content - count, last_drip: dripped.last_drip })
}

/// Evaluate reserve-with-expiry. Returns the new reservation total on success.
///
/// A negative reservation (left behind by settling more than was reserved) counts as zero.
pub fn reserve_with_expiry(
    content: f64,
    last_drip: u64,
    reserved: f64,
    now: u64,
    amount: f64,
    capacity: f64,
) -> Option<f64> {
    let reserved = reserved.max(0.0);
    let dripped = refill(content, last_drip, now, capacity);
    if dripped.content - reserved < amount {
        return None;
    }
    Some(reserved + amount)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrement_uses_refilled_content() {
        // 1 token left, 200ms later two more have dripped in.
        let out = conditional_decrement(1.0, 1_000, 1_200, 3.0, 10.0).expect("enough after drip");
        assert!(out.content.abs() < 1e-9);
        assert_eq!(out.last_drip, 1_200);
        assert!(conditional_decrement(1.0, 1_000, 1_000, 3.0, 10.0).is_none());
    }

    #[test]
    fn reserve_counts_outstanding_reservations() {
        assert_eq!(reserve_with_expiry(10.0, 0, 0.0, 0, 6.0, 10.0), Some(6.0));
        assert_eq!(reserve_with_expiry(10.0, 0, 6.0, 0, 6.0, 10.0), None);
        assert_eq!(reserve_with_expiry(10.0, 0, 6.0, 0, 4.0, 10.0), Some(10.0));
    }

    #[test]
    fn reserve_clamps_negative_reservation() {
        assert_eq!(reserve_with_expiry(10.0, 0, -4.0, 0, 10.0, 10.0), Some(10.0));
    }

    #[test]
    fn lua_sources_are_embedded() {
        for p in Procedure::ALL {
            assert!(p.lua().contains("redis.call('TIME')"), "{} reads the store clock", p.name());
        }
    }

    #[test]
    fn keys_follow_script_order() {
        let bucket = BucketKeys::new("api");
        assert_eq!(Procedure::ConditionalDecrement.keys(&bucket), ["api.content", "api.lastDrip"]);
        assert_eq!(
            Procedure::ReserveWithExpiry.keys(&bucket),
            ["api.content", "api.lastDrip", "api.preAuth"]
        );
    }
}
