//! Rule descriptors: declarative data evaluated by the engine in
//! [`super::FusionEngine`], never code. Keeping rules as data makes them
//! testable in isolation from the engine's ring/eviction machinery.

use serde::{Deserialize, Serialize};

use crate::envelope::{Envelope, EventClass};
use crate::incident::Severity;

/// A single predicate: an event class plus an optional payload-subtype
/// match. Subtype matching is a simple prefix-free string compare against a
/// field the probe embeds in its JSON payload under `"subtype"`; payload
/// parsing failures make a predicate simply not match rather than error,
/// since schema drift in one probe shouldn't poison unrelated rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Predicate {
    pub class: EventClass,
    pub subtypes: Vec<String>,
}

impl Predicate {
    pub fn new(class: EventClass, subtypes: Vec<&str>) -> Self {
        Self {
            class,
            subtypes: subtypes.into_iter().map(String::from).collect(),
        }
    }

    fn matches(&self, envelope: &Envelope) -> bool {
        if envelope.class != self.class {
            return false;
        }
        if self.subtypes.is_empty() {
            return true;
        }
        let Ok(value) = serde_json::from_slice::<serde_json::Value>(&envelope.payload) else {
            return false;
        };
        let Some(subtype) = value.get("subtype").and_then(|v| v.as_str()) else {
            return false;
        };
        self.subtypes.iter().any(|s| s == subtype)
    }
}

/// An ordered or unordered set of predicates over a window. Ordered
/// patterns additionally require `timestamp_ns` monotonicity among the
/// matched events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub predicates: Vec<Predicate>,
    pub window_ns: u64,
    pub ordered: bool,
}

impl Pattern {
    /// Whether this envelope could plausibly be the trigger for this
    /// pattern: matches at least one of its predicates.
    pub fn triggered_by(&self, envelope: &Envelope) -> bool {
        self.predicates.iter().any(|p| p.matches(envelope))
    }

    /// Finds the most recent window of events in `ring` (oldest-first) that
    /// conjunctively satisfies every predicate, honoring ordering if
    /// required. Returns the contributing events on a match.
    pub fn evaluate(&self, ring: &[Envelope]) -> Option<Vec<Envelope>> {
        if ring.is_empty() {
            return None;
        }
        let latest_ts = ring.last().map(|e| e.timestamp_ns).unwrap_or(0);
        let window_floor = latest_ts.saturating_sub(self.window_ns);

        let mut contributing: Vec<Envelope> = Vec::with_capacity(self.predicates.len());
        for predicate in &self.predicates {
            let candidate = ring
                .iter()
                .rev()
                .filter(|e| e.timestamp_ns >= window_floor)
                .find(|e| predicate.matches(e) && !contributing.iter().any(|c| c.event_id == e.event_id));
            match candidate {
                Some(e) => contributing.push(e.clone()),
                None => return None,
            }
        }

        if self.ordered {
            // contributing is in predicate order; an ordered pattern requires
            // timestamps to be non-decreasing in that same order.
            let monotonic = contributing
                .windows(2)
                .all(|pair| pair[0].timestamp_ns <= pair[1].timestamp_ns);
            if !monotonic {
                return None;
            }
        }

        Some(contributing)
    }
}

/// A named, metadata-bearing pattern: what the engine actually interprets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: String,
    pub severity: Severity,
    pub summary_template: String,
    pub tactics: Vec<String>,
    pub techniques: Vec<String>,
    pub pattern: Pattern,
}

#[derive(Deserialize)]
struct RulesFile {
    rule: Vec<Rule>,
}

/// Loads a rule set from a TOML file of `[[rule]]` entries, falling back to
/// [`default_rules`] when `path` is `None`.
pub fn load_rules(path: Option<&std::path::Path>) -> crate::Result<Vec<Rule>> {
    let Some(path) = path else {
        return Ok(default_rules());
    };
    let raw = std::fs::read_to_string(path)?;
    let parsed: RulesFile = toml::from_str(&raw).map_err(|e| crate::AmoskysError::Config(e.to_string()))?;
    Ok(parsed.rule)
}

/// The built-in default rule set, used when no rules file is configured.
pub fn default_rules() -> Vec<Rule> {
    vec![Rule {
        rule_id: "persistence_after_auth".to_string(),
        severity: Severity::Critical,
        summary_template: "privileged auth followed by persistence artifact creation".to_string(),
        tactics: vec!["TA0003".to_string()],
        techniques: vec!["T1543.001".to_string()],
        pattern: Pattern {
            predicates: vec![
                Predicate::new(EventClass::Auth, vec!["sudo", "ssh_login"]),
                Predicate::new(EventClass::Persistence, vec!["launch_agent_created"]),
            ],
            window_ns: 600 * 1_000_000_000,
            ordered: true,
        },
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{seal, EventClass};
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn auth_event(device: &str, ts: u64, subtype: &str) -> Envelope {
        let mut csprng = OsRng;
        let key = SigningKey::generate(&mut csprng);
        let payload = serde_json::json!({ "subtype": subtype }).to_string().into_bytes();
        seal(&key, device.into(), EventClass::Auth, ts, 1, payload)
    }

    fn persistence_event(device: &str, ts: u64, subtype: &str) -> Envelope {
        let mut csprng = OsRng;
        let key = SigningKey::generate(&mut csprng);
        let payload = serde_json::json!({ "subtype": subtype }).to_string().into_bytes();
        seal(&key, device.into(), EventClass::Persistence, ts, 1, payload)
    }

    #[test]
    fn persistence_after_auth_matches_within_window() {
        let rule = &default_rules()[0];
        let ring = vec![
            auth_event("H", 0, "sudo"),
            persistence_event("H", 120 * 1_000_000_000, "launch_agent_created"),
        ];
        let matched = rule.pattern.evaluate(&ring);
        assert!(matched.is_some());
        assert_eq!(matched.unwrap().len(), 2);
    }

    #[test]
    fn persistence_after_auth_rejects_out_of_order_events() {
        let rule = &default_rules()[0];
        let ring = vec![
            persistence_event("H", 0, "launch_agent_created"),
            auth_event("H", 10 * 1_000_000_000, "sudo"),
        ];
        let matched = rule.pattern.evaluate(&ring);
        assert!(matched.is_none());
    }

    #[test]
    fn persistence_after_auth_rejects_outside_window() {
        let rule = &default_rules()[0];
        let ring = vec![
            auth_event("H", 0, "sudo"),
            persistence_event("H", 700 * 1_000_000_000, "launch_agent_created"),
        ];
        let matched = rule.pattern.evaluate(&ring);
        assert!(matched.is_none());
    }

    #[test]
    fn unrelated_subtype_does_not_match() {
        let rule = &default_rules()[0];
        let ring = vec![
            auth_event("H", 0, "password_reset"),
            persistence_event("H", 10 * 1_000_000_000, "launch_agent_created"),
        ];
        let matched = rule.pattern.evaluate(&ring);
        assert!(matched.is_none());
    }
}
