//! Per-device health tracking and circuit gating
//!
//! Driven purely by classified failures plus an explicit success reset.
//! Records are created lazily and never destroyed; cardinality is bounded by
//! the fleet size.

use crate::metrics::Metrics;
use dashmap::DashMap;
use fleetrelay_common::{now_ms, Classification, ErrorClass};

const DEFAULT_SETUP_CIRCUIT_MS: i64 = 10 * 60 * 1000;
const DEFAULT_AUTH_CIRCUIT_MS: i64 = 15 * 60 * 1000;
const TRANSIENT_DOWN_THRESHOLD: u32 = 3;

/// Health state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    DownTransient,
    AuthFailed,
    Misconfigured,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthState::Healthy => "HEALTHY",
            HealthState::Degraded => "DEGRADED",
            HealthState::DownTransient => "DOWN_TRANSIENT",
            HealthState::AuthFailed => "AUTH_FAILED",
            HealthState::Misconfigured => "MISCONFIGURED",
        };
        write!(f, "{}", s)
    }
}

/// Health record for one device
#[derive(Debug, Clone)]
pub struct HealthRecord {
    pub state: HealthState,
    pub consecutive_fails: u32,
    /// Circuit-open deadline in epoch ms; 0 means closed
    pub open_until: i64,
    pub last_err_code: Option<String>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_fails: 0,
            open_until: 0,
            last_err_code: None,
        }
    }
}

/// Circuit-breaker state machine per device, keyed by business id
#[derive(Clone, Default)]
pub struct HealthTracker {
    records: std::sync::Arc<DashMap<String, HealthRecord>>,
    metrics: Metrics,
}

impl HealthTracker {
    pub fn new(metrics: Metrics) -> Self {
        Self {
            records: Default::default(),
            metrics,
        }
    }

    /// Current record, defaulting to healthy when none exists
    pub fn health(&self, bus_id: &str) -> HealthRecord {
        self.records
            .get(bus_id)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// May the caller contact this device now?
    pub fn can_attempt(&self, bus_id: &str) -> bool {
        self.can_attempt_at(bus_id, now_ms())
    }

    pub fn can_attempt_at(&self, bus_id: &str, now: i64) -> bool {
        let h = self.health(bus_id);
        h.open_until == 0 || h.open_until <= now
    }

    /// Apply a classified failure
    pub fn record_failure(&self, bus_id: &str, cls: &Classification) -> HealthRecord {
        self.record_failure_at(bus_id, cls, now_ms())
    }

    pub fn record_failure_at(
        &self,
        bus_id: &str,
        cls: &Classification,
        now: i64,
    ) -> HealthRecord {
        let mut entry = self.records.entry(bus_id.to_string()).or_default();
        entry.last_err_code = Some(cls.code.clone());

        match cls.class {
            ErrorClass::Setup => {
                entry.state = HealthState::Misconfigured;
                entry.open_until = now + cls.open_circuit_ms.unwrap_or(DEFAULT_SETUP_CIRCUIT_MS);
                entry.consecutive_fails += 1;
            }
            ErrorClass::Auth => {
                entry.state = HealthState::AuthFailed;
                entry.open_until = now + cls.open_circuit_ms.unwrap_or(DEFAULT_AUTH_CIRCUIT_MS);
                entry.consecutive_fails += 1;
            }
            ErrorClass::Transient => {
                entry.consecutive_fails += 1;
                entry.state = if entry.consecutive_fails >= TRANSIENT_DOWN_THRESHOLD {
                    HealthState::DownTransient
                } else {
                    HealthState::Degraded
                };
                // backoff handles pacing; the circuit stays closed
                entry.open_until = 0;
            }
            ErrorClass::Inconsistent | ErrorClass::Unknown => {}
        }

        self.metrics
            .inc(&format!("relay.device_health_state_{}", entry.state));
        entry.clone()
    }

    /// A successful command resets the failure counter and state. An open
    /// circuit window is left to run out; success cannot shorten it.
    pub fn record_success(&self, bus_id: &str) {
        if let Some(mut entry) = self.records.get_mut(bus_id) {
            entry.consecutive_fails = 0;
            entry.state = HealthState::Healthy;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetrelay_common::error::codes;
    use fleetrelay_common::{classify, Error};

    fn tracker() -> HealthTracker {
        HealthTracker::new(Metrics::new())
    }

    #[test]
    fn test_unknown_device_is_healthy_and_attemptable() {
        let t = tracker();
        assert!(t.can_attempt_at("hs-01", 0));
        assert_eq!(t.health("hs-01").state, HealthState::Healthy);
    }

    #[test]
    fn test_setup_failure_opens_circuit_for_ten_minutes() {
        let t = tracker();
        let now = 1_000_000;
        let cls = classify(&Error::NodeNotFound {
            bus_id: "hs-01".to_string(),
        });
        let rec = t.record_failure_at("hs-01", &cls, now);
        assert_eq!(rec.state, HealthState::Misconfigured);
        assert!(!t.can_attempt_at("hs-01", now));
        assert!(!t.can_attempt_at("hs-01", now + 10 * 60 * 1000 - 1));
        assert!(t.can_attempt_at("hs-01", now + 10 * 60 * 1000));
    }

    #[test]
    fn test_auth_failure_opens_circuit_for_fifteen_minutes() {
        let t = tracker();
        let now = 1_000_000;
        let cls = classify(&Error::device(codes::DEVICE_AUTH_FAILED, "invalid user"));
        let rec = t.record_failure_at("hs-01", &cls, now);
        assert_eq!(rec.state, HealthState::AuthFailed);
        assert!(!t.can_attempt_at("hs-01", now + 14 * 60 * 1000));
        assert!(t.can_attempt_at("hs-01", now + 15 * 60 * 1000));
    }

    #[test]
    fn test_transient_failures_degrade_then_down() {
        let t = tracker();
        let now = 1_000_000;
        let cls = classify(&Error::device(codes::DEVICE_TIMEOUT, "timed out"));

        let rec = t.record_failure_at("hs-01", &cls, now);
        assert_eq!(rec.state, HealthState::Degraded);
        let rec = t.record_failure_at("hs-01", &cls, now);
        assert_eq!(rec.state, HealthState::Degraded);
        let rec = t.record_failure_at("hs-01", &cls, now);
        assert_eq!(rec.state, HealthState::DownTransient);
        assert_eq!(rec.consecutive_fails, 3);

        // transient failures never open the circuit
        assert!(t.can_attempt_at("hs-01", now));
    }

    #[test]
    fn test_inconsistent_and_unknown_leave_state_alone() {
        let t = tracker();
        let now = 1_000_000;
        let cls = classify(&Error::event(codes::EVENT_INCONSISTENT, "contradiction"));
        let rec = t.record_failure_at("hs-01", &cls, now);
        assert_eq!(rec.state, HealthState::Healthy);
        assert_eq!(rec.consecutive_fails, 0);
        assert_eq!(rec.last_err_code.as_deref(), Some(codes::EVENT_INCONSISTENT));
    }

    #[test]
    fn test_success_resets_fails_but_not_open_circuit() {
        let t = tracker();
        let now = 1_000_000;
        let transient = classify(&Error::device(codes::DEVICE_TIMEOUT, "timed out"));
        t.record_failure_at("hs-01", &transient, now);
        t.record_failure_at("hs-01", &transient, now);
        t.record_success("hs-01");
        let rec = t.health("hs-01");
        assert_eq!(rec.state, HealthState::Healthy);
        assert_eq!(rec.consecutive_fails, 0);

        let auth = classify(&Error::device(codes::DEVICE_AUTH_FAILED, "invalid user"));
        t.record_failure_at("hs-01", &auth, now);
        t.record_success("hs-01");
        // the open window still gates attempts
        assert!(!t.can_attempt_at("hs-01", now + 60_000));
    }
}
