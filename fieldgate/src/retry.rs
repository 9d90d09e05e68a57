use std::time::Duration;

/// Trait that controls how a channel delays between restart attempts
pub trait RetryStrategy: Send + Sync {
    /// Reset internal state. Called after the channel has been stable in the
    /// running state for the configured stability threshold
    fn reset(&mut self);
    /// Return the next delay before making another start attempt
    fn next_delay(&mut self) -> Duration;
}

/// Return the default [`RetryStrategy`]
pub fn default_retry_strategy() -> Box<dyn RetryStrategy> {
    doubling_retry_strategy(Duration::from_millis(1000), Duration::from_millis(60000))
}

/// Return a [`RetryStrategy`] that doubles on each failure up to a maximum value
pub fn doubling_retry_strategy(min: Duration, max: Duration) -> Box<dyn RetryStrategy> {
    Doubling::create(min, max)
}

/// Return a [`RetryStrategy`] with a constant delay between attempts
pub fn fixed_retry_strategy(delay: Duration) -> Box<dyn RetryStrategy> {
    Box::new(Fixed { delay })
}

struct Doubling {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Doubling {
    pub(crate) fn create(min: Duration, max: Duration) -> Box<dyn RetryStrategy> {
        Box::new(Doubling {
            min,
            max,
            current: min,
        })
    }
}

impl RetryStrategy for Doubling {
    fn reset(&mut self) {
        self.current = self.min;
    }

    fn next_delay(&mut self) -> Duration {
        let ret = self.current;
        self.current = std::cmp::min(2 * self.current, self.max);
        ret
    }
}

struct Fixed {
    delay: Duration,
}

impl RetryStrategy for Fixed {
    fn reset(&mut self) {}

    fn next_delay(&mut self) -> Duration {
        self.delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubling_strategy_doubles_up_to_the_maximum() {
        let mut strategy =
            doubling_retry_strategy(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(strategy.next_delay(), Duration::from_millis(100));
        assert_eq!(strategy.next_delay(), Duration::from_millis(200));
        assert_eq!(strategy.next_delay(), Duration::from_millis(350));
        assert_eq!(strategy.next_delay(), Duration::from_millis(350));
        strategy.reset();
        assert_eq!(strategy.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn fixed_strategy_always_returns_the_same_delay() {
        let mut strategy = fixed_retry_strategy(Duration::from_millis(250));
        assert_eq!(strategy.next_delay(), Duration::from_millis(250));
        assert_eq!(strategy.next_delay(), Duration::from_millis(250));
        strategy.reset();
        assert_eq!(strategy.next_delay(), Duration::from_millis(250));
    }
}
