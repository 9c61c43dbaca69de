//! Per-exchange circuit breaker.
//!
//! Fast-fails requests to an exchange whose transport keeps failing:
//! - **Closed**: normal operation, transport failures are counted
//! - **Open**: `failure_threshold` failures landed inside `failure_window`;
//!   requests are rejected without touching the network until `cooldown` passes
//! - **Half-open**: a probe request is let through; success closes the
//!   circuit, failure re-opens it
//!
//! Only transport failures count. Any HTTP response, including 4xx/5xx and
//! error bodies, proves the exchange is reachable and counts as a success.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};

/// Circuit breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Configuration for circuit breaker behavior
#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    /// Failures within `failure_window` that open the circuit
    pub failure_threshold: u32,
    pub failure_window: Duration,
    /// Time spent open before a probe is allowed
    pub cooldown: Duration,
    /// Concurrent probes allowed while half-open
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(10),
            cooldown: Duration::from_secs(30),
            half_open_max_probes: 1,
        }
    }
}

/// Returned by [`CircuitBreaker::check`] while the circuit rejects requests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("circuit open for {exchange}")]
pub struct CircuitOpen {
    pub exchange: String,
    /// Time until the next probe is allowed
    pub retry_in_ms: Option<u64>,
}

/// Whether a transport call reached the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportOutcome {
    /// A response came back, whatever its status.
    Completed,
    /// Connection, TLS or timeout failure.
    Failed,
}

impl TransportOutcome {
    pub fn from_result<T, E>(result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => Self::Completed,
            Err(_) => Self::Failed,
        }
    }
}

/// Point-in-time view of one exchange's circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    /// Failures currently inside the window
    pub failure_count: u32,
    pub opened_at_ms: Option<u64>,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    failures: VecDeque<u64>,
    opened_at_ms: Option<u64>,
    probes: u32,
    probe_started_ms: u64,
}

impl Default for Circuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at_ms: None,
            probes: 0,
            probe_started_ms: 0,
        }
    }
}

impl Circuit {
    fn prune(&mut self, now_ms: u64, window_ms: u64) {
        while self
            .failures
            .front()
            .is_some_and(|ts| now_ms.saturating_sub(*ts) > window_ms)
        {
            self.failures.pop_front();
        }
    }

    fn open(&mut self, now_ms: u64) {
        self.state = CircuitState::Open;
        self.opened_at_ms = Some(now_ms);
        self.probes = 0;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failures.clear();
        self.opened_at_ms = None;
        self.probes = 0;
    }
}

/// Circuit breakers for every exchange, created lazily on first use.
pub struct CircuitBreaker {
    circuits: DashMap<String, Circuit>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            circuits: DashMap::new(),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether a request to `exchange` may proceed. Call before rate limiting.
    pub fn check(&self, exchange: &str) -> Result<(), CircuitOpen> {
        let now = self.clock.now_ms();
        let cooldown_ms = self.config.cooldown.as_millis() as u64;
        let mut circuit = self.circuits.entry(exchange.to_string()).or_default();

        match circuit.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let opened_at = circuit.opened_at_ms.unwrap_or(now);
                let elapsed = now.saturating_sub(opened_at);
                if elapsed >= cooldown_ms {
                    info!(exchange, "Circuit breaker transitioning to half-open");
                    circuit.state = CircuitState::HalfOpen;
                    circuit.probes = 1;
                    circuit.probe_started_ms = now;
                    Ok(())
                } else {
                    debug!(exchange, "Circuit breaker is open - request rejected");
                    Err(CircuitOpen {
                        exchange: exchange.to_string(),
                        retry_in_ms: Some(cooldown_ms - elapsed),
                    })
                }
            }
            CircuitState::HalfOpen => {
                let probe_age = now.saturating_sub(circuit.probe_started_ms);
                if circuit.probes < self.config.half_open_max_probes {
                    circuit.probes += 1;
                    Ok(())
                } else if probe_age >= cooldown_ms {
                    // The outstanding probe never reported back.
                    debug!(exchange, "Circuit breaker replacing stale probe");
                    circuit.probe_started_ms = now;
                    Ok(())
                } else {
                    Err(CircuitOpen {
                        exchange: exchange.to_string(),
                        retry_in_ms: Some(cooldown_ms - probe_age),
                    })
                }
            }
        }
    }

    /// Record the outcome of a completed call.
    pub fn record_result(&self, exchange: &str, outcome: TransportOutcome) {
        match outcome {
            TransportOutcome::Completed => self.record_success(exchange),
            TransportOutcome::Failed => self.record_failure(exchange),
        }
    }

    pub fn record_success(&self, exchange: &str) {
        let Some(mut circuit) = self.circuits.get_mut(exchange) else {
            return;
        };
        match circuit.state {
            CircuitState::HalfOpen => {
                info!(exchange, "Circuit breaker closing - exchange recovered");
                circuit.close();
            }
            CircuitState::Closed => circuit.failures.clear(),
            // A straggler from before the circuit opened; the cooldown still applies.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, exchange: &str) {
        let now = self.clock.now_ms();
        let window_ms = self.config.failure_window.as_millis() as u64;
        let mut circuit = self.circuits.entry(exchange.to_string()).or_default();

        match circuit.state {
            CircuitState::Closed => {
                circuit.failures.push_back(now);
                circuit.prune(now, window_ms);
                let count = circuit.failures.len() as u32;
                if count >= self.config.failure_threshold {
                    warn!(
                        exchange,
                        failures = count,
                        "Circuit breaker opening - failure threshold reached"
                    );
                    circuit.open(now);
                } else {
                    debug!(
                        exchange,
                        failures = count,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker recorded failure"
                    );
                }
            }
            CircuitState::HalfOpen => {
                warn!(exchange, "Circuit breaker re-opening - probe failed");
                circuit.open(now);
            }
            CircuitState::Open => {}
        }
    }

    /// Current state of `exchange`'s circuit. Does not transition.
    pub fn state(&self, exchange: &str) -> CircuitSnapshot {
        let now = self.clock.now_ms();
        let window_ms = self.config.failure_window.as_millis() as u64;
        match self.circuits.get(exchange) {
            Some(circuit) => CircuitSnapshot {
                state: circuit.state,
                failure_count: circuit
                    .failures
                    .iter()
                    .filter(|ts| now.saturating_sub(**ts) <= window_ms)
                    .count() as u32,
                opened_at_ms: circuit.opened_at_ms,
            },
            None => CircuitSnapshot {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at_ms: None,
            },
        }
    }

    /// Force `exchange` back to closed.
    pub fn reset(&self, exchange: &str) {
        if let Some(mut circuit) = self.circuits.get_mut(exchange) {
            info!(exchange, "Circuit breaker manually reset");
            circuit.close();
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("exchanges", &self.circuits.len())
            .finish()
    }
}
