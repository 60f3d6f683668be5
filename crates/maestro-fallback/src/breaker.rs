// Circuit Breaker
// Three-state guard per component: CLOSED counts failures inside a sliding
// window, OPEN rejects until the cooldown elapses, HALF_OPEN admits exactly
// one probe whose outcome decides the next state.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use maestro_types::{Component, CoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures within `failure_window_ms` that trip the breaker
    pub failure_threshold: u32,
    pub failure_window_ms: u64,
    /// Time OPEN before a probe is admitted
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_ms: 60_000,
            cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
}

#[derive(Debug)]
struct Breaker {
    state: BreakerState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure_at: None,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// One breaker per component, each updated under its own lock.
pub(crate) struct BreakerSet {
    config: BreakerConfig,
    breakers: HashMap<Component, Mutex<Breaker>>,
}

impl BreakerSet {
    pub(crate) fn new(config: BreakerConfig) -> Self {
        let breakers = [
            Component::Llm,
            Component::Memory,
            Component::Tools,
            Component::Planning,
            Component::SubAgents,
            Component::Orchestrator,
        ]
        .into_iter()
        .map(|c| (c, Mutex::new(Breaker::new())))
        .collect();
        Self { config, breakers }
    }

    fn lock(&self, component: Component) -> std::sync::MutexGuard<'_, Breaker> {
        self.breakers
            .get(&component)
            .expect("breaker exists for every component")
            .lock()
            .expect("breaker lock")
    }

    /// Admission check. OPEN rejects until the cooldown elapses, at which
    /// point the rejecting call becomes the half-open probe; while a probe is
    /// in flight every other call is rejected.
    pub(crate) fn before_call(&self, component: Component) -> Result<(), CoreError> {
        let mut breaker = self.lock(component);
        match breaker.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let cooled_down = breaker
                    .opened_at
                    .map(|at| at.elapsed() >= Duration::from_millis(self.config.cooldown_ms))
                    .unwrap_or(true);
                if cooled_down {
                    breaker.state = BreakerState::HalfOpen;
                    breaker.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(CoreError::CircuitOpen(component))
                }
            }
            BreakerState::HalfOpen => {
                if breaker.probe_in_flight {
                    Err(CoreError::CircuitOpen(component))
                } else {
                    breaker.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a terminal success. Returns true when this closed the circuit.
    pub(crate) fn on_success(&self, component: Component) -> bool {
        let mut breaker = self.lock(component);
        let closed_now = breaker.state == BreakerState::HalfOpen;
        breaker.state = BreakerState::Closed;
        breaker.failure_count = 0;
        breaker.last_failure_at = None;
        breaker.opened_at = None;
        breaker.probe_in_flight = false;
        closed_now
    }

    /// Record a terminal failure. Returns true when this opened the circuit.
    pub(crate) fn on_failure(&self, component: Component) -> bool {
        let mut breaker = self.lock(component);
        let now = Instant::now();
        match breaker.state {
            BreakerState::HalfOpen => {
                // Failed probe: back to OPEN with a fresh cooldown.
                breaker.state = BreakerState::Open;
                breaker.opened_at = Some(now);
                breaker.probe_in_flight = false;
                breaker.last_failure_at = Some(now);
                false
            }
            BreakerState::Open => {
                breaker.last_failure_at = Some(now);
                false
            }
            BreakerState::Closed => {
                let window = Duration::from_millis(self.config.failure_window_ms);
                let within_window = breaker
                    .last_failure_at
                    .map(|at| now.duration_since(at) <= window)
                    .unwrap_or(false);
                breaker.failure_count = if within_window {
                    breaker.failure_count + 1
                } else {
                    1
                };
                breaker.last_failure_at = Some(now);
                if breaker.failure_count >= self.config.failure_threshold.max(1) {
                    breaker.state = BreakerState::Open;
                    breaker.opened_at = Some(now);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub(crate) fn snapshot(&self, component: Component) -> BreakerSnapshot {
        let breaker = self.lock(component);
        BreakerSnapshot {
            state: breaker.state,
            failure_count: breaker.failure_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(threshold: u32, cooldown_ms: u64) -> BreakerSet {
        BreakerSet::new(BreakerConfig {
            failure_threshold: threshold,
            failure_window_ms: 10_000,
            cooldown_ms,
        })
    }

    #[test]
    fn closed_until_threshold() {
        let breakers = set(3, 1_000);
        assert!(!breakers.on_failure(Component::Llm));
        assert!(!breakers.on_failure(Component::Llm));
        assert!(breakers.on_failure(Component::Llm));
        assert_eq!(breakers.snapshot(Component::Llm).state, BreakerState::Open);
    }

    #[test]
    fn open_rejects_until_cooldown() {
        let breakers = set(1, 50);
        breakers.on_failure(Component::Llm);
        assert!(breakers.before_call(Component::Llm).is_err());
        std::thread::sleep(Duration::from_millis(60));
        // First admission after cooldown is the probe...
        assert!(breakers.before_call(Component::Llm).is_ok());
        // ...and only one probe is in flight at a time.
        assert!(breakers.before_call(Component::Llm).is_err());
    }

    #[test]
    fn failed_probe_reopens_with_fresh_cooldown() {
        let breakers = set(1, 50);
        breakers.on_failure(Component::Llm);
        std::thread::sleep(Duration::from_millis(60));
        assert!(breakers.before_call(Component::Llm).is_ok());
        breakers.on_failure(Component::Llm);
        assert_eq!(breakers.snapshot(Component::Llm).state, BreakerState::Open);
        assert!(breakers.before_call(Component::Llm).is_err());
    }

    #[test]
    fn successful_probe_closes_and_resets() {
        let breakers = set(1, 10);
        breakers.on_failure(Component::Llm);
        std::thread::sleep(Duration::from_millis(20));
        assert!(breakers.before_call(Component::Llm).is_ok());
        assert!(breakers.on_success(Component::Llm));
        let snapshot = breakers.snapshot(Component::Llm);
        assert_eq!(snapshot.state, BreakerState::Closed);
        assert_eq!(snapshot.failure_count, 0);
    }

    #[test]
    fn stale_failures_fall_out_of_the_window() {
        let breakers = BreakerSet::new(BreakerConfig {
            failure_threshold: 2,
            failure_window_ms: 30,
            cooldown_ms: 1_000,
        });
        assert!(!breakers.on_failure(Component::Memory));
        std::thread::sleep(Duration::from_millis(50));
        // Outside the window the count restarts at 1 instead of tripping.
        assert!(!breakers.on_failure(Component::Memory));
        assert_eq!(
            breakers.snapshot(Component::Memory).state,
            BreakerState::Closed
        );
    }

    #[test]
    fn components_are_independent() {
        let breakers = set(1, 1_000);
        breakers.on_failure(Component::Llm);
        assert!(breakers.before_call(Component::Llm).is_err());
        assert!(breakers.before_call(Component::Memory).is_ok());
    }
}
