//! Property-based tests for the quantified invariants named in the system
//! specification: event-id stability under roundtrip, queue FIFO
//! preservation under arbitrary ack/nack sequences, and device-risk
//! boundedness.

use amoskys::envelope::{compute_event_id, seal, EventClass};
use amoskys::incident::Severity;
use amoskys::queue::DurableQueue;
use amoskys::risk::RiskLedger;
use ed25519_dalek::SigningKey;
use proptest::prelude::*;
use rand::rngs::OsRng;

fn arbitrary_class() -> impl Strategy<Value = EventClass> {
    prop_oneof![
        Just(EventClass::Auth),
        Just(EventClass::Persistence),
        Just(EventClass::Flow),
        Just(EventClass::Process),
        Just(EventClass::Other),
    ]
}

proptest! {
    #[test]
    fn event_id_stable_under_roundtrip(
        source_id in "[a-z]{1,16}",
        class in arbitrary_class(),
        ts in 0u64..1_000_000_000_000,
        schema_version in 0u32..10,
        payload in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        let mut csprng = OsRng;
        let key = SigningKey::generate(&mut csprng);
        let envelope = seal(&key, source_id, class, ts, schema_version, payload);

        let json = serde_json::to_vec(&envelope).unwrap();
        let roundtripped: amoskys::envelope::Envelope = serde_json::from_slice(&json).unwrap();

        prop_assert_eq!(compute_event_id(&envelope), compute_event_id(&roundtripped));
    }

    #[test]
    fn device_risk_never_exceeds_cap(
        severities in proptest::collection::vec(0u8..5, 1..60),
    ) {
        let ledger = RiskLedger::new(24 * 3600);
        for (i, s) in severities.iter().enumerate() {
            let severity = match s {
                0 => Severity::Info,
                1 => Severity::Low,
                2 => Severity::Medium,
                3 => Severity::High,
                _ => Severity::Critical,
            };
            ledger.record_incident("H", severity, i as u64);
        }
        let score = ledger.score("H", severities.len() as u64);
        prop_assert!(score <= 100.0);
        prop_assert!(score >= 0.0);
    }

    #[test]
    fn fifo_order_preserved_across_ack_nack(
        ops in proptest::collection::vec(0u8..3, 0..20),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let queue = DurableQueue::open(dir.path(), 1000, 10_000_000, 3600).unwrap();

        let mut enqueued = Vec::new();
        for (i, op) in ops.iter().enumerate() {
            let mut csprng = OsRng;
            let key = SigningKey::generate(&mut csprng);
            match op {
                0 => {
                    let envelope = seal(&key, format!("agent-{i}"), EventClass::Other, i as u64, 1, vec![]);
                    if queue.enqueue(envelope.clone()).is_ok() {
                        enqueued.push(envelope.event_id);
                    }
                }
                1 => {
                    if let Some(id) = enqueued.first().copied() {
                        let _ = queue.nack(&[id], 0);
                    }
                }
                _ => {
                    let batch = queue.peek_batch(1).unwrap();
                    if let Some(record) = batch.first() {
                        let _ = queue.ack(&[record.envelope.event_id]);
                        enqueued.retain(|id| *id != record.envelope.event_id);
                    }
                }
            }
        }

        // Whatever remains pending is returned oldest-sequence-first.
        let remaining = queue.peek_batch(1000).unwrap();
        let sequences: Vec<u64> = remaining.iter().map(|r| r.sequence).collect();
        let mut sorted = sequences.clone();
        sorted.sort_unstable();
        prop_assert_eq!(sequences, sorted);
    }
}
