//! Target Health
//!
//! Threshold state machine the load balancer applies to probe results, and a
//! simulation of a backend probed with a given check configuration.

use crate::config::HealthCheckConfig;
use serde::Serialize;

/// Health state of a registered target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Registered, not yet passed enough probes
    Initial,
    Healthy,
    Unhealthy,
}

/// Consecutive-threshold tracker for one target
#[derive(Debug, Clone)]
pub struct TargetHealth {
    healthy_threshold: u32,
    unhealthy_threshold: u32,
    state: HealthState,
    consecutive_successes: u32,
    consecutive_failures: u32,
}

impl TargetHealth {
    pub fn new(check: &HealthCheckConfig) -> Self {
        Self {
            healthy_threshold: check.healthy_threshold.max(1),
            unhealthy_threshold: check.unhealthy_threshold.max(1),
            state: HealthState::Initial,
            consecutive_successes: 0,
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    /// Apply one probe outcome
    pub fn record(&mut self, success: bool) -> HealthState {
        if success {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
            if self.consecutive_successes >= self.healthy_threshold {
                self.state = HealthState::Healthy;
            }
        } else {
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
            if self.consecutive_failures >= self.unhealthy_threshold {
                self.state = HealthState::Unhealthy;
            }
        }
        self.state
    }
}

/// Whether a probe of `check_path` reaches the application's liveness
/// handler. Any other path answers 404.
pub fn probe_succeeds(check_path: &str, liveness_path: &str) -> bool {
    check_path == liveness_path
}

/// Outcome of probing one backend slot over time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendSimulation {
    pub intervals: u32,
    pub ever_healthy: bool,
    /// Tasks the orchestrator would stop and replace
    pub replacements: u32,
    pub final_state: HealthState,
}

/// Probe a backend every interval. An unhealthy target is replaced by a
/// fresh one that starts in `Initial`.
pub fn simulate_backend(
    check: &HealthCheckConfig,
    liveness_path: &str,
    intervals: u32,
) -> BackendSimulation {
    let success = probe_succeeds(&check.path, liveness_path);
    let mut target = TargetHealth::new(check);
    let mut ever_healthy = false;
    let mut replacements = 0;

    for _ in 0..intervals {
        match target.record(success) {
            HealthState::Healthy => ever_healthy = true,
            HealthState::Unhealthy => {
                replacements += 1;
                target = TargetHealth::new(check);
            }
            HealthState::Initial => {}
        }
    }

    if replacements > 0 {
        tracing::warn!(
            path = %check.path,
            liveness = liveness_path,
            replacements,
            "backend never passed its health check"
        );
    }

    BackendSimulation {
        intervals,
        ever_healthy,
        replacements,
        final_state: target.state(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(path: &str) -> HealthCheckConfig {
        HealthCheckConfig {
            path: path.into(),
            interval_secs: 30,
            timeout_secs: 5,
            healthy_threshold: 2,
            unhealthy_threshold: 5,
        }
    }

    #[test]
    fn test_thresholds() {
        let mut target = TargetHealth::new(&check("/api/healthcheck"));
        assert_eq!(target.record(true), HealthState::Initial);
        assert_eq!(target.record(true), HealthState::Healthy);

        for _ in 0..4 {
            assert_eq!(target.record(false), HealthState::Healthy);
        }
        assert_eq!(target.record(false), HealthState::Unhealthy);

        // a single success does not reset the state
        assert_eq!(target.record(true), HealthState::Unhealthy);
        assert_eq!(target.record(true), HealthState::Healthy);
    }

    #[test]
    fn test_matching_path_becomes_healthy() {
        let sim = simulate_backend(&check("/api/healthcheck"), "/api/healthcheck", 20);
        assert!(sim.ever_healthy);
        assert_eq!(sim.replacements, 0);
        assert_eq!(sim.final_state, HealthState::Healthy);
    }

    #[test]
    fn test_mismatched_path_replaces_forever() {
        let sim = simulate_backend(&check("/"), "/api/healthcheck", 20);
        assert!(!sim.ever_healthy);
        // every fifth probe crosses the unhealthy threshold
        assert_eq!(sim.replacements, 4);
    }
}
