//! Lazy refill arithmetic.
//!
//! There is no background timer: whoever reads the bucket computes how much would have
//! dripped in since `lastDrip` and writes the result back. The same formula runs on the
//! client, inside the in-memory store's procedures, and in the Lua scripts.

/// Bucket content and refill timestamp after a drip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Drip {
    /// Refilled content, never above capacity.
    pub content: f64,
    /// New `lastDrip`; never earlier than the one read.
    pub last_drip: u64,
}

/// Refill `content` for the time elapsed between `last_drip` and `now`.
///
/// Elapsed time is clamped at zero so a clock that runs backwards can neither drain nor
/// overfill the bucket, and the returned timestamp never moves backwards.
pub fn refill(content: f64, last_drip: u64, now: u64, tokens_per_second: f64) -> Drip {
    let elapsed_ms = now.saturating_sub(last_drip) as f64;
    let amount = elapsed_ms * tokens_per_second / 1000.0;
    Drip { content: (content + amount).min(tokens_per_second), last_drip: last_drip.max(now) }
}
