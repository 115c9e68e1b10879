//! Streaming correlator: rules are data (pattern descriptors plus
//! metadata), the engine is an interpreter over them, matching is evaluated
//! per grouping key against a bounded sliding-window ring.

mod rules;

pub use rules::{default_rules, load_rules, Pattern, Predicate, Rule};

use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use metrics::{counter, histogram};

use crate::envelope::Envelope;
use crate::incident::{compute_incident_id, Incident, IncidentStore};
use crate::queue::DurableQueue;
use crate::risk::RiskLedger;

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Window slack added on top of the widest rule window before a grouping
/// key's ring evicts an event.
const RING_SLACK_NS: u64 = 60 * 1_000_000_000;

struct GroupingKeyState {
    ring: VecDeque<Envelope>,
}

impl GroupingKeyState {
    fn new() -> Self {
        Self { ring: VecDeque::new() }
    }

    fn insert_and_trim(&mut self, envelope: Envelope, horizon_ns: u64, capacity: usize) {
        let now = envelope.timestamp_ns;
        self.ring.push_back(envelope);
        while let Some(front) = self.ring.front() {
            if now.saturating_sub(front.timestamp_ns) > horizon_ns {
                self.ring.pop_front();
            } else {
                break;
            }
        }
        while self.ring.len() > capacity {
            self.ring.pop_front();
        }
    }
}

/// The interpreter over rule descriptors, owning per-grouping-key ring
/// state and the stores it emits into.
pub struct FusionEngine {
    rules: Vec<Rule>,
    groups: HashMap<String, GroupingKeyState>,
    ring_capacity: usize,
    widest_window_ns: u64,
    incidents: IncidentStore,
    risk: RiskLedger,
}

impl FusionEngine {
    pub fn new(rules: Vec<Rule>, ring_capacity: usize, incidents: IncidentStore, risk: RiskLedger) -> Self {
        let widest_window_ns = rules
            .iter()
            .map(|r| r.pattern.window_ns)
            .max()
            .unwrap_or(600 * 1_000_000_000);
        Self {
            rules,
            groups: HashMap::new(),
            ring_capacity,
            widest_window_ns,
            incidents,
            risk,
        }
    }

    fn grouping_key(envelope: &Envelope) -> String {
        envelope.source_id.clone()
    }

    /// Marks the engine ready to consume. Kept as an explicit lifecycle step
    /// (distinct from `new`) so the consumer loop that owns `self` has one
    /// place to log "serving" from, symmetric with `stop`.
    pub fn start(&self) {
        tracing::info!(rules = self.rules.len(), "fusion engine started");
    }

    /// Graceful shutdown: the caller has already stopped feeding new batches
    /// into `drain` (so there's no in-flight batch left to finish), and this
    /// only needs to fsync the incident store before the process exits.
    pub fn stop(self) -> crate::Result<()> {
        self.incidents.flush()?;
        tracing::info!("fusion engine stopped");
        Ok(())
    }

    /// Drains one envelope through the engine: insert into its grouping
    /// key's ring, then evaluate every rule whose latest predicate matches
    /// this event. A rule whose incident-store write fails is isolated:
    /// counted and skipped, never propagated to the caller.
    pub fn process(&mut self, envelope: Envelope) {
        let key = Self::grouping_key(&envelope);
        let horizon = self.widest_window_ns + RING_SLACK_NS;
        let capacity = self.ring_capacity;

        let entry = self.groups.entry(key.clone()).or_insert_with(GroupingKeyState::new);
        entry.insert_and_trim(envelope.clone(), horizon, capacity);

        for rule in self.rules.clone() {
            if !rule.pattern.triggered_by(&envelope) {
                continue;
            }
            let ring: Vec<Envelope> = self.groups.get(&key).unwrap().ring.iter().cloned().collect();
            if let Some(matched) = rule.pattern.evaluate(&ring) {
                self.emit(&rule, &key, &matched);
            }
        }
    }

    fn emit(&mut self, rule: &Rule, device_id: &str, matched: &[Envelope]) {
        let mut contributing_event_ids: Vec<[u8; 16]> = matched.iter().map(|e| e.event_id).collect();
        contributing_event_ids.sort_unstable();
        let window_start_ns = matched.iter().map(|e| e.timestamp_ns).min().unwrap_or(0);

        let incident_id = compute_incident_id(&rule.rule_id, device_id, window_start_ns, &contributing_event_ids);
        let incident = Incident {
            incident_id,
            rule_id: rule.rule_id.clone(),
            severity: rule.severity,
            device_id: device_id.to_string(),
            summary: rule.summary_template.clone(),
            tactics: rule.tactics.clone(),
            techniques: rule.techniques.clone(),
            created_ns: now_ns(),
            contributing_event_ids,
        };

        match self.incidents.insert(&incident) {
            Ok(true) => {
                self.risk.record_incident(device_id, rule.severity, incident.created_ns);
                counter!("fusion_incidents_total", "rule_id" => rule.rule_id.clone(), "severity" => format!("{:?}", rule.severity)).increment(1);
                histogram!("fusion_incident_contributing_events").record(matched.len() as f64);
                tracing::info!(
                    rule_id = %rule.rule_id,
                    device_id,
                    incident_id = %hex_id(&incident.incident_id),
                    "incident emitted"
                );
            }
            Ok(false) => {
                // already emitted under this incident_id: idempotent replay, not an error.
            }
            Err(e) => {
                counter!("fusion_rule_errors", "rule_id" => rule.rule_id.clone()).increment(1);
                tracing::warn!(rule_id = %rule.rule_id, error = %e, "incident store insert failed");
            }
        }
    }

    /// Drains up to `n` envelopes from a durable queue, processing each in
    /// arrival order. Consumed records are marked `DONE` rather than removed
    /// outright: the bus server's dedupe check depends on a processed
    /// `event_id` staying resolvable as `DONE` for the configured dedupe
    /// window.
    pub fn drain(&mut self, queue: &DurableQueue, n: usize) -> crate::Result<usize> {
        let batch = queue.peek_batch(n)?;
        let mut processed = 0;
        for record in batch {
            self.process(record.envelope.clone());
            queue.mark_done(&record.envelope.event_id)?;
            processed += 1;
        }
        Ok(processed)
    }
}

fn hex_id(id: &[u8; 16]) -> String {
    id.iter().map(|b| format!("{b:02x}")).collect()
}
