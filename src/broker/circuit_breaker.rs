//! Circuit breaker guarding broker publishes.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// The failures must fall within this window.
    pub failure_window: Duration,
    /// Time spent open before a trial call is admitted.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
pub enum CircuitError<E> {
    /// Rejected without running the call.
    Open { retry_after: Duration },
    Inner(E),
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    first_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                first_failure_at: None,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Run `call` if the circuit admits it and record the outcome.
    ///
    /// A call that is dropped before completing counts as a failure.
    pub async fn call<F, T, E>(&self, call: F) -> Result<T, CircuitError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire::<E>()?;
        match call.await {
            Ok(value) => {
                permit.settle(true);
                Ok(value)
            }
            Err(e) => {
                permit.settle(false);
                Err(CircuitError::Inner(e))
            }
        }
    }

    fn acquire<E>(&self) -> Result<Permit<'_>, CircuitError<E>> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {}
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or_else(Instant::now);
                let elapsed = opened_at.elapsed();
                if elapsed < self.config.cooldown {
                    return Err(CircuitError::Open {
                        retry_after: self.config.cooldown - elapsed,
                    });
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                info!("Circuit breaker {} half-open, admitting trial call", self.name);
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(CircuitError::Open {
                        retry_after: Duration::ZERO,
                    });
                }
                inner.trial_in_flight = true;
            }
        }
        Ok(Permit {
            breaker: self,
            settled: false,
        })
    }

    fn record(&self, success: bool) {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if success {
            inner.consecutive_failures = 0;
            inner.first_failure_at = None;
            if inner.state == CircuitState::HalfOpen {
                inner.state = CircuitState::Closed;
                inner.trial_in_flight = false;
                inner.opened_at = None;
                info!("Circuit breaker {} closed", self.name);
            }
            return;
        }

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.trial_in_flight = false;
                warn!("Circuit breaker {} re-opened after failed trial", self.name);
            }
            CircuitState::Closed => {
                let window_expired = inner
                    .first_failure_at
                    .map(|first| now.duration_since(first) > self.config.failure_window)
                    .unwrap_or(true);
                if window_expired {
                    inner.consecutive_failures = 0;
                    inner.first_failure_at = Some(now);
                }
                inner.consecutive_failures += 1;

                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    warn!(
                        "Circuit breaker {} opened after {} consecutive failures",
                        self.name, inner.consecutive_failures
                    );
                }
            }
            // Outcome of a call admitted before the circuit opened
            CircuitState::Open => {}
        }
    }
}

struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Permit<'_> {
    fn settle(mut self, success: bool) {
        self.settled = true;
        self.breaker.record(success);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record(false);
        }
    }
}
