//! Rate limiting for repetitive error logs
//!
//! A store that is down fails every event; one line per interval is enough.

use std::time::{Duration, Instant};

pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl Default for LogThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_INTERVAL)
    }
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            suppressed: 0,
        }
    }

    /// `Some(suppressed_count)` when a line may be logged now, `None` otherwise
    pub fn allow(&mut self) -> Option<u64> {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&mut self, now: Instant) -> Option<u64> {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }
}

/// Log `error!` through a throttle, appending the suppressed count
#[macro_export]
macro_rules! throttled_error {
    ($throttle:expr, $($arg:tt)+) => {
        if let Some(suppressed) = $throttle.allow() {
            if suppressed > 0 {
                log::error!("{} ({} similar errors suppressed)", format_args!($($arg)+), suppressed);
            } else {
                log::error!($($arg)+);
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_call_allowed() {
        let mut throttle = LogThrottle::new(Duration::from_secs(10));
        assert_eq!(throttle.allow(), Some(0));
    }

    #[test]
    fn test_suppresses_within_interval() {
        let mut throttle = LogThrottle::new(Duration::from_secs(10));
        let start = Instant::now();

        assert_eq!(throttle.allow_at(start), Some(0));
        assert_eq!(throttle.allow_at(start + Duration::from_secs(1)), None);
        assert_eq!(throttle.allow_at(start + Duration::from_secs(5)), None);
        assert_eq!(throttle.allow_at(start + Duration::from_secs(10)), Some(2));
        assert_eq!(throttle.allow_at(start + Duration::from_secs(11)), None);
    }

    #[test]
    fn test_macro_compiles_and_counts() {
        let mut throttle = LogThrottle::new(Duration::from_secs(3600));
        throttled_error!(throttle, "store down: {}", "refused");
        throttled_error!(throttle, "store down: {}", "refused");
        assert_eq!(throttle.suppressed, 1);
    }
}
