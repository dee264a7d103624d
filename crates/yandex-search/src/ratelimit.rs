use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Per-endpoint request budget over three sliding windows.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub per_second: usize,
    pub per_minute: usize,
    pub per_hour: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: 10,
            per_minute: 600,
            per_hour: 35_000,
        }
    }
}

struct Rule {
    limit: usize,
    window: Duration,
    events: VecDeque<Instant>,
}

impl Rule {
    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.events.front() {
            if now.duration_since(front) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Sliding-window limiter: each rule keeps a queue of admission
/// timestamps; a call is admitted only once every window has room,
/// otherwise the caller sleeps until the oldest in-window timestamp
/// ages out. Admission into all windows is atomic.
pub struct SlidingWindowLimiter {
    rules: Mutex<Vec<Rule>>,
}

impl SlidingWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let rules = vec![
            Rule {
                limit: config.per_second,
                window: Duration::from_secs(1),
                events: VecDeque::new(),
            },
            Rule {
                limit: config.per_minute,
                window: Duration::from_secs(60),
                events: VecDeque::new(),
            },
            Rule {
                limit: config.per_hour,
                window: Duration::from_secs(3600),
                events: VecDeque::new(),
            },
        ];
        Self {
            rules: Mutex::new(rules),
        }
    }

    /// Blocks (cooperatively) until the call fits inside every window,
    /// then records it.
    pub async fn admit(&self) {
        loop {
            let wait = {
                let mut rules = self.rules.lock();
                let now = Instant::now();
                let mut wait: Option<Duration> = None;

                for rule in rules.iter_mut() {
                    rule.prune(now);
                    if rule.events.len() >= rule.limit {
                        // oldest event leaves the window at front + window
                        let ready_at = *rule.events.front().expect("limit > 0 implies non-empty")
                            + rule.window;
                        let pending = ready_at.saturating_duration_since(now);
                        wait = Some(wait.map_or(pending, |w| w.max(pending)));
                    }
                }

                match wait {
                    None => {
                        for rule in rules.iter_mut() {
                            rule.events.push_back(now);
                        }
                        return;
                    }
                    Some(wait) => wait,
                }
            };

            tracing::debug!("rate limit reached, sleeping {wait:?}");
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_per_second_without_waiting() {
        let limiter = SlidingWindowLimiter::new(RateLimitConfig {
            per_second: 3,
            per_minute: 100,
            per_hour: 100,
        });

        let start = Instant::now();
        for _ in 0..3 {
            limiter.admit().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn fourth_call_waits_for_the_window() {
        let limiter = SlidingWindowLimiter::new(RateLimitConfig {
            per_second: 3,
            per_minute: 100,
            per_hour: 100,
        });

        let start = Instant::now();
        for _ in 0..4 {
            limiter.admit().await;
        }
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn minute_window_applies_independently() {
        let limiter = SlidingWindowLimiter::new(RateLimitConfig {
            per_second: 10,
            per_minute: 2,
            per_hour: 100,
        });

        let start = Instant::now();
        for _ in 0..3 {
            limiter.admit().await;
        }
        assert!(start.elapsed() >= Duration::from_secs(60));
    }
}
