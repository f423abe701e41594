use std::time::Duration;

const BASE_MS: u64 = 500;
const CAP_MS: u64 = 30_000;

/// Bounded exponential backoff with jitter for the reconnect loop.
///
/// `delay = min(base * 2^attempt, cap) + random(0, delay * 0.5)`
pub async fn reconnect_sleep(attempt: u32) {
    tokio::time::sleep(reconnect_delay(attempt)).await;
}

fn reconnect_delay(attempt: u32) -> Duration {
    let base = BASE_MS.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let capped = base.min(CAP_MS);
    let jitter = (rand::random::<f64>() * capped as f64 * 0.5) as u64;
    Duration::from_millis(capped + jitter)
}

/// Backoff for a single in-flight send's ack-wait retries:
/// `base_timeout * 2^(attempt - 1)`, attempt is 1-based.
#[must_use]
pub fn ack_retry_delay(base_timeout: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1);
    let multiplier = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
    Duration::from_millis(base_timeout.as_millis() as u64 * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_is_capped() {
        let d = reconnect_delay(20);
        assert!(d.as_millis() as u64 <= (CAP_MS as f64 * 1.5) as u64);
    }

    #[test]
    fn reconnect_delay_grows_with_attempt() {
        assert!(reconnect_delay(0).as_millis() >= BASE_MS as u128);
        assert!(reconnect_delay(3).as_millis() >= (BASE_MS * 8) as u128);
    }

    #[test]
    fn ack_retry_delay_doubles_each_attempt() {
        let base = Duration::from_millis(1200);
        assert_eq!(ack_retry_delay(base, 1), Duration::from_millis(1200));
        assert_eq!(ack_retry_delay(base, 2), Duration::from_millis(2400));
        assert_eq!(ack_retry_delay(base, 3), Duration::from_millis(4800));
    }
}
