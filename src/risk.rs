//! Per-device risk scoring: a rolling scalar in `[0, 100]` derived from a
//! device's incident history with exponential time decay.
//!
//! The score is never cached as a single stale number: each device keeps a
//! bounded history of `(created_ns, weight)` contributions and the score is
//! recomputed from that history on every read, so it strictly decays
//! between inserts even if nothing else happens.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::incident::Severity;

const MAX_CONTRIBUTIONS_PER_DEVICE: usize = 256;

#[derive(Debug, Clone, Copy)]
struct Contribution {
    created_ns: u64,
    weight: f64,
}

struct DeviceHistory {
    contributions: Vec<Contribution>,
}

/// Per-device rolling risk ledger, updated under a fine-grained per-device
/// lock; reads are lock-free snapshots once the per-device guard is
/// released, so one device's write never blocks another device's read.
pub struct RiskLedger {
    half_life_ns: f64,
    devices: Arc<RwLock<HashMap<String, Arc<RwLock<DeviceHistory>>>>>,
}

impl RiskLedger {
    pub fn new(half_life_secs: u64) -> Self {
        Self {
            half_life_ns: (half_life_secs as f64) * 1e9,
            devices: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn decay_factor(&self, age_ns: f64) -> f64 {
        0.5_f64.powf(age_ns / self.half_life_ns)
    }

    fn device_handle(&self, device_id: &str) -> Arc<RwLock<DeviceHistory>> {
        if let Some(existing) = self.devices.read().get(device_id) {
            return existing.clone();
        }
        let mut devices = self.devices.write();
        devices
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(DeviceHistory { contributions: Vec::new() })))
            .clone()
    }

    /// Records an incident's contribution to a device's risk:
    /// `severity_weight × time_decay(age)`, capped at 100 on read.
    pub fn record_incident(&self, device_id: &str, severity: Severity, created_ns: u64) {
        let handle = self.device_handle(device_id);
        let mut history = handle.write();
        history.contributions.push(Contribution {
            created_ns,
            weight: severity.weight(),
        });
        if history.contributions.len() > MAX_CONTRIBUTIONS_PER_DEVICE {
            let excess = history.contributions.len() - MAX_CONTRIBUTIONS_PER_DEVICE;
            history.contributions.drain(0..excess);
        }
    }

    /// Current decayed score for a device, `[0, 100]`. Devices with no
    /// history score 0.
    pub fn score(&self, device_id: &str, now_ns: u64) -> f64 {
        let Some(handle) = self.devices.read().get(device_id).cloned() else {
            return 0.0;
        };
        let history = handle.read();
        let total: f64 = history
            .contributions
            .iter()
            .map(|c| {
                let age = (now_ns.saturating_sub(c.created_ns)) as f64;
                c.weight * self.decay_factor(age)
            })
            .sum();
        total.min(100.0)
    }

    pub fn known_devices(&self) -> Vec<String> {
        self.devices.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_is_monotonic_on_insert_at_fixed_time() {
        let ledger = RiskLedger::new(24 * 3600);
        let before = ledger.score("H", 1_000);
        ledger.record_incident("H", Severity::Critical, 1_000);
        let after = ledger.score("H", 1_000);
        assert!(after > before);
    }

    #[test]
    fn risk_decays_strictly_between_inserts() {
        let ledger = RiskLedger::new(24 * 3600);
        ledger.record_incident("H", Severity::Critical, 0);
        let at_zero = ledger.score("H", 0);
        let later = ledger.score("H", 12 * 3600 * 1_000_000_000);
        assert!(later < at_zero);
    }

    #[test]
    fn risk_never_exceeds_100() {
        let ledger = RiskLedger::new(24 * 3600);
        for _ in 0..50 {
            ledger.record_incident("H", Severity::Critical, 0);
        }
        assert!(ledger.score("H", 0) <= 100.0);
    }

    #[test]
    fn persistence_after_auth_scenario_crosses_60() {
        let ledger = RiskLedger::new(24 * 3600);
        ledger.record_incident("H", Severity::Critical, 120_000_000_000);
        assert!(ledger.score("H", 120_000_000_000) >= 60.0);
    }
}
