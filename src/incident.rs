//! Fusion output: the `Incident` type and the transactional store keyed by
//! its content-derived `incident_id`.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{AmoskysError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Contribution weight toward device risk.
    pub fn weight(self) -> f64 {
        match self {
            Severity::Info => 1.0,
            Severity::Low => 3.0,
            Severity::Medium => 10.0,
            Severity::High => 30.0,
            Severity::Critical => 60.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub incident_id: [u8; 16],
    pub rule_id: String,
    pub severity: Severity,
    pub device_id: String,
    pub summary: String,
    pub tactics: Vec<String>,
    pub techniques: Vec<String>,
    pub created_ns: u64,
    pub contributing_event_ids: Vec<[u8; 16]>,
}

/// `incident_id`: content-derived from `(rule_id, device_id, window_start_ns,
/// contributing_event_ids_sorted)`, guaranteeing idempotent re-emission
/// across replays of the same input.
pub fn compute_incident_id(
    rule_id: &str,
    device_id: &str,
    window_start_ns: u64,
    contributing_event_ids: &[[u8; 16]],
) -> [u8; 16] {
    let mut sorted = contributing_event_ids.to_vec();
    sorted.sort_unstable();

    let mut buf = Vec::new();
    buf.extend_from_slice(&(rule_id.len() as u32).to_be_bytes());
    buf.extend_from_slice(rule_id.as_bytes());
    buf.extend_from_slice(&(device_id.len() as u32).to_be_bytes());
    buf.extend_from_slice(device_id.as_bytes());
    buf.extend_from_slice(&window_start_ns.to_be_bytes());
    for id in &sorted {
        buf.extend_from_slice(id);
    }

    let digest = blake3::hash(&buf);
    let mut id = [0u8; 16];
    id.copy_from_slice(&digest.as_bytes()[..16]);
    id
}

/// Transactional embedded store enforcing uniqueness on `incident_id`; a
/// collision on insert is a silent no-op, giving idempotent re-emission
/// under replay.
pub struct IncidentStore {
    tree: sled::Tree,
}

impl IncidentStore {
    pub fn open(dir: &Path) -> Result<Self> {
        let db = sled::open(dir)?;
        let tree = db.open_tree("incidents")?;
        Ok(Self { tree })
    }

    /// Returns `true` if this call inserted a new incident, `false` if one
    /// with the same `incident_id` already existed.
    pub fn insert(&self, incident: &Incident) -> Result<bool> {
        let bytes =
            bincode::serialize(incident).map_err(|e| AmoskysError::Storage(e.to_string()))?;
        let existing = self
            .tree
            .compare_and_swap(incident.incident_id, None::<&[u8]>, Some(bytes))
            .map_err(|e| AmoskysError::Storage(e.to_string()))?;
        self.tree.flush()?;
        Ok(existing.is_ok())
    }

    /// Explicit fsync point, used by `FusionEngine::stop` to guarantee the
    /// last batch's writes are durable before the process exits.
    pub fn flush(&self) -> Result<()> {
        self.tree.flush()?;
        Ok(())
    }

    pub fn get(&self, incident_id: &[u8; 16]) -> Result<Option<Incident>> {
        match self.tree.get(incident_id)? {
            Some(raw) => Ok(Some(
                bincode::deserialize(&raw).map_err(|e| AmoskysError::Storage(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    /// Most recent `limit` incidents, newest first, for the CLI's
    /// `--list-incidents` surface.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<Incident>> {
        let mut all = Vec::new();
        for item in self.tree.iter() {
            let (_, v) = item?;
            let incident: Incident =
                bincode::deserialize(&v).map_err(|e| AmoskysError::Storage(e.to_string()))?;
            all.push(incident);
        }
        all.sort_by(|a, b| b.created_ns.cmp(&a.created_ns));
        all.truncate(limit);
        Ok(all)
    }

    pub fn for_device(&self, device_id: &str) -> Result<Vec<Incident>> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (_, v) = item?;
            let incident: Incident =
                bincode::deserialize(&v).map_err(|e| AmoskysError::Storage(e.to_string()))?;
            if incident.device_id == device_id {
                out.push(incident);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: [u8; 16]) -> Incident {
        Incident {
            incident_id: id,
            rule_id: "persistence_after_auth".into(),
            severity: Severity::Critical,
            device_id: "H".into(),
            summary: "sudo followed by launch agent creation".into(),
            tactics: vec!["TA0003".into()],
            techniques: vec!["T1543.001".into()],
            created_ns: 1,
            contributing_event_ids: vec![[1; 16], [2; 16]],
        }
    }

    #[test]
    fn incident_id_is_order_independent_over_contributing_events() {
        let a = compute_incident_id("r", "H", 0, &[[1; 16], [2; 16]]);
        let b = compute_incident_id("r", "H", 0, &[[2; 16], [1; 16]]);
        assert_eq!(a, b);
    }

    #[test]
    fn duplicate_insert_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = IncidentStore::open(dir.path()).unwrap();
        let incident = sample([9; 16]);
        assert!(store.insert(&incident).unwrap());
        assert!(!store.insert(&incident).unwrap());
        assert_eq!(store.list_recent(10).unwrap().len(), 1);
    }
}
