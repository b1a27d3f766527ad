use std::time::Duration;

/// Exponential reconnect delay: `min`, `2·min`, `4·min`, … capped at `max`.
/// Never decreases until [`Backoff::reset`].
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    next: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self { min, max, next: min, attempt: 0 }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.attempt = self.attempt.saturating_add(1);
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    /// Attempts since a connection last delivered a frame.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.next = self.min;
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_then_caps() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<u64> = (0..8).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
        assert_eq!(b.attempt(), 8);
    }

    #[test]
    fn test_non_decreasing_and_reset() {
        let mut b = Backoff::new(Duration::from_millis(300), Duration::from_millis(1000));
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            let d = b.next_delay();
            assert!(d >= last && d <= Duration::from_millis(1000));
            last = d;
        }
        b.reset();
        assert_eq!(b.attempt(), 0);
        assert_eq!(b.next_delay(), Duration::from_millis(300));
    }

    #[test]
    fn test_max_below_min() {
        let mut b = Backoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(b.next_delay(), Duration::from_secs(5));
        assert_eq!(b.next_delay(), Duration::from_secs(5));
    }
}
