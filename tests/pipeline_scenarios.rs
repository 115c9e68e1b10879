//! End-to-end scenarios against the in-process pipeline: envelope through
//! durable queue through fusion engine, without the gRPC/TLS transport
//! (which needs a live listener and certificates). Transport-level
//! admission is covered by the unit tests inside `src/bus/service.rs`'s
//! module and `src/envelope.rs`.

use amoskys::envelope::{seal, EventClass};
use amoskys::fusion::{default_rules, FusionEngine};
use amoskys::incident::IncidentStore;
use amoskys::queue::DurableQueue;
use amoskys::risk::RiskLedger;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

fn signed(device: &str, class: EventClass, ts: u64, subtype: &str) -> amoskys::envelope::Envelope {
    let mut csprng = OsRng;
    let key = SigningKey::generate(&mut csprng);
    let payload = serde_json::json!({ "subtype": subtype }).to_string().into_bytes();
    seal(&key, device.into(), class, ts, 1, payload)
}

#[test]
fn happy_publish_then_duplicate() {
    let dir = tempfile::tempdir().unwrap();
    let queue = DurableQueue::open(dir.path(), 100, 1_000_000, 3600).unwrap();

    let envelope = signed("agent-A", EventClass::Auth, 1_000, "sudo");
    assert!(queue.enqueue(envelope.clone()).unwrap());
    assert_eq!(queue.size(), 1);

    // Re-enqueue while still PENDING: idempotent no-op, queue depth unchanged.
    assert!(queue.enqueue(envelope).unwrap());
    assert_eq!(queue.size(), 1);
}

#[test]
fn persistence_after_auth_emits_critical_incident_and_raises_risk() {
    let incident_dir = tempfile::tempdir().unwrap();
    let incidents = IncidentStore::open(incident_dir.path()).unwrap();
    let risk = RiskLedger::new(24 * 3600);
    let mut engine = FusionEngine::new(default_rules(), 1000, incidents, risk);

    let auth = signed("H", EventClass::Auth, 0, "sudo");
    let persistence = signed("H", EventClass::Persistence, 120 * 1_000_000_000, "launch_agent_created");

    engine.process(auth);
    engine.process(persistence);

    // re-open the store to inspect what the engine wrote.
    let incidents = IncidentStore::open(incident_dir.path()).unwrap();
    let rows = incidents.list_recent(10).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].rule_id, "persistence_after_auth");
    assert_eq!(rows[0].contributing_event_ids.len(), 2);
}

#[test]
fn idempotent_fusion_replay_produces_one_incident() {
    let incident_dir = tempfile::tempdir().unwrap();

    for _ in 0..2 {
        let incidents = IncidentStore::open(incident_dir.path()).unwrap();
        let risk = RiskLedger::new(24 * 3600);
        let mut engine = FusionEngine::new(default_rules(), 1000, incidents, risk);

        let auth = signed("H", EventClass::Auth, 0, "sudo");
        let persistence = signed("H", EventClass::Persistence, 120 * 1_000_000_000, "launch_agent_created");
        engine.process(auth);
        engine.process(persistence);
    }

    let incidents = IncidentStore::open(incident_dir.path()).unwrap();
    assert_eq!(incidents.list_recent(10).unwrap().len(), 1);
}

#[test]
fn backpressure_then_ack_frees_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let queue = DurableQueue::open(dir.path(), 1, 1_000_000, 3600).unwrap();

    let first = signed("agent-A", EventClass::Auth, 0, "sudo");
    let first_id = first.event_id;
    queue.enqueue(first).unwrap();

    let second = signed("agent-A", EventClass::Auth, 1, "sudo");
    assert!(matches!(
        queue.enqueue(second.clone()),
        Err(amoskys::AmoskysError::QueueFull)
    ));

    queue.ack(&[first_id]).unwrap();
    assert!(queue.enqueue(second).is_ok());
}

#[test]
fn bad_signature_is_rejected_without_touching_the_queue() {
    use amoskys::registry::SignerRegistry;

    let mut csprng = OsRng;
    let key = SigningKey::generate(&mut csprng);
    let registry = SignerRegistry::from_pairs(vec![("agent-A".to_string(), key.verifying_key())]);

    let mut envelope = seal(&key, "agent-A".into(), EventClass::Auth, 0, 1, b"x".to_vec());
    envelope.signature[0] ^= 0x01;

    let dir = tempfile::tempdir().unwrap();
    let queue = DurableQueue::open(dir.path(), 100, 1_000_000, 3600).unwrap();
    let verdict = amoskys::envelope::verify(&envelope, &registry);
    assert!(verdict.is_err());
    assert_eq!(queue.size(), 0);
}

#[test]
fn crash_recovery_leaves_no_partial_record() {
    let dir = tempfile::tempdir().unwrap();
    let envelope = signed("agent-A", EventClass::Auth, 0, "sudo");
    let event_id = envelope.event_id;

    {
        let queue = DurableQueue::open(dir.path(), 100, 1_000_000, 3600).unwrap();
        assert!(queue.enqueue(envelope.clone()).unwrap());
    }

    // Simulated restart: either the record is fully present (repeat
    // enqueue is the idempotent no-op) or fully absent (repeat enqueue
    // succeeds as new). Never a torn/partial state.
    let queue = DurableQueue::open(dir.path(), 100, 1_000_000, 3600).unwrap();
    let present_before = queue.size() == 1;
    let repeat = queue.enqueue(envelope).unwrap();
    assert!(repeat);
    if present_before {
        assert_eq!(queue.size(), 1);
    }
    let batch = queue.peek_batch(10).unwrap();
    assert_eq!(batch[0].envelope.event_id, event_id);
}
