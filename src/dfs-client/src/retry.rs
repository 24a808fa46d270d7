use dfs_lib::{DfsError, DfsResult, ErrorKind, HttpClientConfig, RetryConfig};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

/// One window of a multiple-linear policy: up to `retries` retries spread
/// evenly over `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryWindow {
    pub window: Duration,
    pub retries: u32,
}

impl RetryWindow {
    /// Sleep between retries in this window, in whole milliseconds.
    pub fn delay(&self) -> Duration {
        let window_ms = self.window.as_millis() as u64;
        Duration::from_millis(window_ms / self.retries.max(1) as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryPolicy {
    TryOnce,
    MultipleLinear {
        windows: Vec<RetryWindow>,
        max_attempts: u32,
    },
    Exponential {
        base: Duration,
        max: Duration,
        max_attempts: u32,
    },
}

impl RetryPolicy {
    /// Parse "t1,n1,t2,n2,..." where every t is a window in millis and every
    /// n the number of retries allowed in it.
    pub fn multiple_linear(spec: &str, max_attempts: u32) -> DfsResult<Self> {
        let values = spec
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<u64>().map_err(|e| {
                    DfsError::InvalidConfig(format!("invalid retry policy spec {:?}: {}", spec, e))
                })
            })
            .collect::<DfsResult<Vec<u64>>>()?;

        if values.is_empty() || values.len() % 2 != 0 {
            return Err(DfsError::InvalidConfig(format!(
                "retry policy spec {:?} must be non-empty pairs of window,retries",
                spec
            )));
        }
        if values.iter().any(|v| *v == 0) {
            return Err(DfsError::InvalidConfig(format!(
                "retry policy spec {:?} contains a zero entry",
                spec
            )));
        }

        let windows = values
            .chunks_exact(2)
            .map(|pair| {
                let retries = u32::try_from(pair[1]).map_err(|_| {
                    DfsError::InvalidConfig(format!("retry count {} out of range", pair[1]))
                })?;
                Ok(RetryWindow {
                    window: Duration::from_millis(pair[0]),
                    retries,
                })
            })
            .collect::<DfsResult<Vec<_>>>()?;

        Ok(RetryPolicy::MultipleLinear {
            windows,
            max_attempts,
        })
    }

    pub fn exponential(base: Duration, max: Duration, max_attempts: u32) -> Self {
        RetryPolicy::Exponential {
            base,
            max,
            max_attempts,
        }
    }

    pub fn from_config(config: &RetryConfig) -> DfsResult<Self> {
        if !config.policy_enabled {
            return Ok(RetryPolicy::TryOnce);
        }
        Self::multiple_linear(&config.policy_spec, config.max_attempts)
    }

    /// Same shape as the generic policy, configured independently.
    pub fn from_http_config(config: &HttpClientConfig) -> DfsResult<Self> {
        if !config.retry_policy_enabled {
            return Ok(RetryPolicy::TryOnce);
        }
        Self::multiple_linear(&config.retry_policy_spec, config.retry_max_attempts)
    }

    /// `attempt` counts failures so far (1 after the first failure).
    pub fn should_retry(&self, attempt: u32, elapsed: Duration, kind: ErrorKind) -> RetryDecision {
        if !kind.is_retryable() {
            return RetryDecision::GiveUp;
        }

        match self {
            RetryPolicy::TryOnce => RetryDecision::GiveUp,
            RetryPolicy::MultipleLinear {
                windows,
                max_attempts,
            } => {
                if *max_attempts > 0 && attempt >= *max_attempts {
                    return RetryDecision::GiveUp;
                }
                let mut window_end = Duration::ZERO;
                let mut budget = 0u32;
                for w in windows.iter() {
                    window_end += w.window;
                    budget = budget.saturating_add(w.retries);
                    if elapsed < window_end {
                        if attempt > budget {
                            return RetryDecision::GiveUp;
                        }
                        return RetryDecision::Retry {
                            delay: w.delay(),
                        };
                    }
                }
                RetryDecision::GiveUp
            }
            RetryPolicy::Exponential {
                base,
                max,
                max_attempts,
            } => {
                if attempt >= *max_attempts {
                    return RetryDecision::GiveUp;
                }
                RetryDecision::Retry {
                    delay: exponential_delay(*base, *max, attempt),
                }
            }
        }
    }
}

/// `min(max, base * 2^exp)` without overflowing.
pub fn exponential_delay(base: Duration, max: Duration, exp: u32) -> Duration {
    let factor = 1u32.checked_shl(exp.min(31)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Bookkeeping for one logical operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryState {
    pub attempt: u32,
    pub first_attempt: Instant,
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            first_attempt: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.first_attempt.elapsed()
    }

    pub fn record_failure(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}
