//! Exponential reconnect backoff.

use std::time::Duration;

/// Delay sequence `initial, initial * factor, initial * factor^2, ...`.
///
/// Attempts are not capped; the sequence restarts after [`Backoff::reset`].
/// Delays saturate at [`Duration::MAX`] instead of overflowing.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    factor: f64,
    current: Duration,
}

impl Backoff {
    /// A factor below 1 or not finite is treated as 1 (constant delay).
    pub fn new(initial: Duration, factor: f64) -> Self {
        let factor = if factor.is_finite() && factor >= 1.0 {
            factor
        } else {
            tracing::warn!(factor, "Invalid backoff factor, using constant delay");
            1.0
        };
        Self {
            initial,
            factor,
            current: initial,
        }
    }

    /// Delay to wait after the latest failure.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.factor)
            .unwrap_or(Duration::MAX);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_by_factor_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(500), 1.5);
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(750));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1125));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn invalid_factor_keeps_a_constant_delay() {
        for factor in [-1.0, 0.5, f64::NAN, f64::INFINITY] {
            let mut backoff = Backoff::new(Duration::from_millis(500), factor);
            assert_eq!(backoff.next_delay(), Duration::from_millis(500));
            assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        }
    }

    #[test]
    fn huge_delays_saturate() {
        let mut backoff = Backoff::new(Duration::from_secs(u64::MAX / 2), 4.0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(u64::MAX / 2));
        assert_eq!(backoff.next_delay(), Duration::MAX);
        assert_eq!(backoff.next_delay(), Duration::MAX);
    }
}
