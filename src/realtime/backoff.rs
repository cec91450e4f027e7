use std::time::Duration;

/// Delay before the next reconnect: `min(max, base * 2^attempts)`, where
/// `attempts` counts failed connects since the last confirmed subscription.
pub fn reconnect_delay(attempts: u32, base: Duration, max: Duration) -> Duration {
    let multiplier = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
    base.saturating_mul(multiplier).min(max)
}
