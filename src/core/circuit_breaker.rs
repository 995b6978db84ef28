//! Circuit breakers for the primitive execution service.
//!
//! One breaker per key (`"{provider}/{primitive_type}"`), held in an
//! explicit registry that is shared by every conversation calling the same
//! provider. All state transitions happen under the registry lock, so
//! concurrent callers never lose updates.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::errors::ExecutionError;

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive half-open successes needed to close the circuit
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Time since the last failure before a probe is allowed
    #[serde(default = "default_open_timeout", with = "duration_secs")]
    #[serde(rename = "open_timeout_seconds")]
    pub open_timeout: Duration,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_open_timeout() -> Duration {
    Duration::from_secs(30)
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_timeout: default_open_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing fast
    Open,
    /// Probing whether the provider recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

/// Snapshot of one breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    pub state: CircuitState,

    /// Consecutive failures while closed
    pub failure_count: u32,

    /// Consecutive successes while half-open
    pub success_count: u32,

    pub last_failure_at: Option<Instant>,

    probe_in_flight: bool,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            probe_in_flight: false,
        }
    }
}

/// Breaker key for a provider and primitive type
pub fn breaker_key(provider: &str, primitive_type: impl fmt::Display) -> String {
    format!("{}/{}", provider, primitive_type)
}

/// Registry of breakers keyed by provider/primitive type.
///
/// Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Arc<Mutex<HashMap<String, CircuitBreakerState>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CircuitBreakerState>> {
        // State stays consistent across a panicking holder: every mutation is
        // a handful of field writes with no await in between
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask to place a call. Fails fast with `CircuitOpen` while the breaker
    /// is open (or while a half-open probe is already outstanding).
    pub fn acquire(&self, key: &str) -> Result<BreakerPermit, ExecutionError> {
        let mut breakers = self.lock();
        let breaker = breakers.entry(key.to_string()).or_default();

        let probe = match breaker.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = breaker.last_failure_at.map(|t| t.elapsed());
                match elapsed {
                    Some(elapsed) if elapsed < self.config.open_timeout => {
                        let retry_in = self.config.open_timeout - elapsed;
                        return Err(ExecutionError::CircuitOpen {
                            key: key.to_string(),
                            retry_in_ms: retry_in.as_millis() as u64,
                        });
                    }
                    _ => {
                        info!(%key, "Circuit breaker transitioning to half-open");
                        breaker.state = CircuitState::HalfOpen;
                        breaker.success_count = 0;
                        true
                    }
                }
            }
            CircuitState::HalfOpen => {
                if breaker.probe_in_flight {
                    return Err(ExecutionError::CircuitOpen {
                        key: key.to_string(),
                        retry_in_ms: 0,
                    });
                }
                true
            }
        };

        if probe {
            breaker.probe_in_flight = true;
        }

        Ok(BreakerPermit {
            registry: self.clone(),
            key: key.to_string(),
            probe,
            admitted_in: breaker.state,
            settled: false,
        })
    }

    /// Current state of a breaker (closed if it has never been used)
    pub fn snapshot(&self, key: &str) -> CircuitBreakerState {
        self.lock().get(key).cloned().unwrap_or_default()
    }

    pub fn state(&self, key: &str) -> CircuitState {
        self.snapshot(key).state
    }

    /// Force a breaker back to closed
    pub fn reset(&self, key: &str) {
        self.lock().remove(key);
        info!(%key, "Circuit breaker manually reset");
    }

    /// Keys of every breaker that has been used
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn on_success(&self, key: &str, probe: bool) -> CircuitState {
        let mut breakers = self.lock();
        let breaker = breakers.entry(key.to_string()).or_default();

        breaker.failure_count = 0;
        if probe {
            breaker.probe_in_flight = false;
        }

        if breaker.state == CircuitState::HalfOpen {
            breaker.success_count += 1;
            if breaker.success_count >= self.config.success_threshold {
                info!(%key, "Circuit breaker closed");
                breaker.state = CircuitState::Closed;
                breaker.failure_count = 0;
                breaker.success_count = 0;
            }
        }

        breaker.state
    }

    fn on_failure(&self, key: &str, probe: bool) -> CircuitState {
        let mut breakers = self.lock();
        let breaker = breakers.entry(key.to_string()).or_default();

        breaker.last_failure_at = Some(Instant::now());
        if probe {
            breaker.probe_in_flight = false;
        }

        match breaker.state {
            CircuitState::Closed => {
                breaker.failure_count += 1;
                if breaker.failure_count >= self.config.failure_threshold {
                    warn!(
                        %key,
                        failures = breaker.failure_count,
                        "Circuit breaker opened"
                    );
                    breaker.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                warn!(%key, "Probe failed, circuit breaker reopened");
                breaker.state = CircuitState::Open;
                breaker.success_count = 0;
            }
            CircuitState::Open => {}
        }

        breaker.state
    }

    fn release_probe(&self, key: &str) {
        if let Some(breaker) = self.lock().get_mut(key) {
            breaker.probe_in_flight = false;
        }
    }
}

/// Admission to call through a breaker. Record the outcome with
/// `record_success` or `record_failure`; dropping it unrecorded (for
/// example when the call is cancelled) frees the half-open probe slot
/// without counting either way.
#[derive(Debug)]
pub struct BreakerPermit {
    registry: CircuitBreakerRegistry,
    key: String,
    probe: bool,
    admitted_in: CircuitState,
    settled: bool,
}

impl BreakerPermit {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Breaker state at the moment the call was admitted
    pub fn admitted_in(&self) -> CircuitState {
        self.admitted_in
    }

    pub fn record_success(mut self) -> CircuitState {
        self.settled = true;
        self.registry.on_success(&self.key, self.probe)
    }

    pub fn record_failure(mut self) -> CircuitState {
        self.settled = true;
        self.registry.on_failure(&self.key, self.probe)
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.registry.release_probe(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(failure_threshold: u32, success_threshold: u32, open_ms: u64) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold,
            success_threshold,
            open_timeout: Duration::from_millis(open_ms),
        })
    }

    #[test]
    fn test_opens_after_threshold() {
        let registry = registry(3, 1, 60_000);
        for _ in 0..3 {
            registry.acquire("p/t").unwrap().record_failure();
        }
        assert_eq!(registry.state("p/t"), CircuitState::Open);
        assert!(matches!(
            registry.acquire("p/t"),
            Err(ExecutionError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let registry = registry(3, 1, 60_000);
        registry.acquire("p/t").unwrap().record_failure();
        registry.acquire("p/t").unwrap().record_failure();
        registry.acquire("p/t").unwrap().record_success();
        assert_eq!(registry.snapshot("p/t").failure_count, 0);

        registry.acquire("p/t").unwrap().record_failure();
        assert_eq!(registry.state("p/t"), CircuitState::Closed);
    }

    #[test]
    fn test_only_one_probe_in_flight() {
        let registry = registry(1, 2, 0);
        registry.acquire("p/t").unwrap().record_failure();

        let probe = registry.acquire("p/t").unwrap();
        assert_eq!(probe.admitted_in(), CircuitState::HalfOpen);
        assert!(registry.acquire("p/t").is_err());

        // Dropping an unrecorded probe frees the slot
        drop(probe);
        assert!(registry.acquire("p/t").is_ok());
    }

    #[test]
    fn test_keys_are_independent() {
        let registry = registry(1, 1, 60_000);
        registry.acquire("x/capture_name").unwrap().record_failure();
        assert_eq!(registry.state("x/capture_name"), CircuitState::Open);
        assert_eq!(registry.state("x/capture_email"), CircuitState::Closed);
        assert_eq!(registry.keys(), vec!["x/capture_name".to_string()]);
    }

    #[test]
    fn test_config_from_yaml() {
        let config: CircuitBreakerConfig =
            serde_yaml::from_str("failure_threshold: 4\nopen_timeout_seconds: 1.5\n").unwrap();
        assert_eq!(config.failure_threshold, 4);
        assert_eq!(config.success_threshold, 2);
        assert_eq!(config.open_timeout, Duration::from_millis(1500));
    }
}
