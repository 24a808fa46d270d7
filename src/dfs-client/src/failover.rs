use dfs_lib::{DfsError, DfsResult, Endpoint, ErrorKind, FailoverConfig, HttpClientConfig};
use log::{info, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::retry::exponential_delay;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverAction {
    RetrySame { delay: Duration },
    SwitchTo { endpoint: Endpoint, delay: Duration },
    GiveUp,
}

/// Per-operation failover bookkeeping, created by [`FailoverController::begin`].
#[derive(Debug, Clone)]
pub struct FailoverState {
    index: usize,
    attempts: u32,
    failovers: u32,
    connection_failures: u32,
    timeout_failures: u32,
}

impl FailoverState {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn failovers(&self) -> u32 {
        self.failovers
    }
}

/// Decides which metadata endpoint to contact next. The current index is
/// shared by every caller of one client.
pub struct FailoverController {
    endpoints: Vec<Endpoint>,
    current: AtomicUsize,
    max_attempts: u32,
    sleep_base: Duration,
    sleep_max: Duration,
    connection_retries: u32,
    connection_retries_on_timeouts: u32,
}

impl FailoverController {
    pub fn new(endpoints: Vec<Endpoint>, config: &FailoverConfig) -> DfsResult<Self> {
        if endpoints.is_empty() {
            return Err(DfsError::InvalidConfig(
                "no metadata endpoints configured".to_string(),
            ));
        }
        Ok(Self {
            endpoints,
            current: AtomicUsize::new(0),
            max_attempts: config.max_attempts.max(1),
            sleep_base: Duration::from_millis(config.sleep_base_ms),
            sleep_max: Duration::from_millis(config.sleep_max_ms),
            connection_retries: config.connection_retries,
            connection_retries_on_timeouts: config.connection_retries_on_timeouts,
        })
    }

    pub fn from_http_config(endpoints: Vec<Endpoint>, config: &HttpClientConfig) -> DfsResult<Self> {
        let failover = FailoverConfig {
            max_attempts: config.failover_max_attempts,
            sleep_base_ms: config.failover_sleep_base_ms,
            sleep_max_ms: config.failover_sleep_max_ms,
            ..Default::default()
        };
        Self::new(endpoints, &failover)
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn current_endpoint(&self) -> Endpoint {
        self.endpoint_at(self.current.load(Ordering::Acquire))
    }

    fn endpoint_at(&self, index: usize) -> Endpoint {
        self.endpoints[index % self.endpoints.len()].clone()
    }

    pub fn begin(&self) -> FailoverState {
        FailoverState {
            index: self.current.load(Ordering::Acquire),
            attempts: 0,
            failovers: 0,
            connection_failures: 0,
            timeout_failures: 0,
        }
    }

    /// Endpoint the operation should contact now.
    pub fn endpoint_for(&self, state: &FailoverState) -> Endpoint {
        self.endpoint_at(state.index)
    }

    pub fn on_failure(
        &self,
        state: &mut FailoverState,
        endpoint: &Endpoint,
        err: &DfsError,
    ) -> FailoverAction {
        state.attempts += 1;
        let kind = err.kind();
        if !kind.is_retryable() {
            return FailoverAction::GiveUp;
        }
        if state.attempts >= self.max_attempts {
            warn!(
                "giving up on metadata endpoints after {} attempts, last {}: {}",
                state.attempts, endpoint, err
            );
            return FailoverAction::GiveUp;
        }

        if kind == ErrorKind::EndpointUnavailable
            && state.connection_failures < self.connection_retries
        {
            state.connection_failures += 1;
            return FailoverAction::RetrySame {
                delay: self.sleep_base,
            };
        }
        if err.is_timeout() && state.timeout_failures < self.connection_retries_on_timeouts {
            state.timeout_failures += 1;
            return FailoverAction::RetrySame {
                delay: self.sleep_base,
            };
        }
        if kind == ErrorKind::ResourceExhausted {
            return FailoverAction::RetrySame {
                delay: exponential_delay(self.sleep_base, self.sleep_max, state.attempts),
            };
        }

        let delay = if state.failovers == 0 {
            Duration::ZERO
        } else {
            exponential_delay(self.sleep_base, self.sleep_max, state.failovers)
        };
        state.failovers += 1;
        state.connection_failures = 0;
        state.timeout_failures = 0;

        let observed = state.index;
        let next = (observed + 1) % self.endpoints.len();
        state.index = match self.current.compare_exchange(
            observed,
            next,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                info!(
                    "failing over from {} to {} after: {}",
                    endpoint,
                    self.endpoint_at(next),
                    err
                );
                next
            }
            // another caller already moved on
            Err(moved) => moved,
        };

        FailoverAction::SwitchTo {
            endpoint: self.endpoint_at(state.index),
            delay,
        }
    }
}
