use std::time::Duration;

/// Reconnect delay for the given attempt (1-based): the base interval
/// doubled per prior attempt, capped.
pub fn reconnect_delay(base_ms: u64, cap_ms: u64, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(63);
    let multiplier = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
    let delay = base_ms.saturating_mul(multiplier).min(cap_ms);
    Duration::from_millis(delay)
}
