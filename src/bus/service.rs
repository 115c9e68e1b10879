//! `Publish` RPC handler: the envelope admission pipeline (verify, skew
//! check, inflight admission, dedupe, enqueue). Transport auth is handled
//! by the TLS layer in [`super::tls`] before a request ever reaches this
//! service.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use metrics::{counter, gauge};
use tonic::{Request, Response, Status};

use crate::envelope::{self, Envelope};
use crate::pb::{
    event_bus_server::EventBus, EventClass as PbEventClass, PublishAck, PublishStatus, WireEnvelope,
};
use crate::queue::DurableQueue;
use crate::registry::SignerRegistry;

fn from_wire(wire: WireEnvelope) -> Result<Envelope, Status> {
    let event_id: [u8; 16] = wire
        .event_id
        .as_slice()
        .try_into()
        .map_err(|_| Status::invalid_argument("event_id must be 16 bytes"))?;
    let signature: [u8; 64] = wire
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| Status::invalid_argument("signature must be 64 bytes"))?;
    let class = PbEventClass::try_from(wire.class)
        .map_err(|_| Status::invalid_argument("unknown event class"))?;
    Ok(Envelope {
        event_id,
        source_id: wire.source_id,
        class: class.into(),
        timestamp_ns: wire.timestamp_ns,
        schema_version: wire.schema_version,
        payload: wire.payload,
        signature,
    })
}

/// Implements the `EventBus` RPC service. One instance is shared across all
/// connections; the durable queue inside enforces the single-writer
/// invariant, so this type only ever needs shared (`Arc`) access to it.
pub struct EventBusService {
    registry: SignerRegistry,
    queue: Arc<DurableQueue>,
    soft_limit: i64,
    hard_limit: i64,
    inflight: Arc<AtomicI64>,
    publish_deadline_ms: u64,
}

impl EventBusService {
    pub fn new(
        registry: SignerRegistry,
        queue: Arc<DurableQueue>,
        max_inflight: usize,
        soft_limit_fraction: f64,
        publish_deadline_ms: u64,
    ) -> Self {
        let hard_limit = max_inflight as i64;
        let soft_limit = ((max_inflight as f64) * soft_limit_fraction) as i64;
        Self {
            registry,
            queue,
            soft_limit,
            hard_limit,
            inflight: Arc::new(AtomicI64::new(0)),
            publish_deadline_ms,
        }
    }

    pub fn publish_deadline_ms(&self) -> u64 {
        self.publish_deadline_ms
    }

    fn class_label(envelope: &Envelope) -> &'static str {
        match envelope.class {
            envelope::EventClass::Auth => "auth",
            envelope::EventClass::Persistence => "persistence",
            envelope::EventClass::Flow => "flow",
            envelope::EventClass::Process => "process",
            envelope::EventClass::Other => "other",
        }
    }
}

#[tonic::async_trait]
impl EventBus for EventBusService {
    async fn publish(&self, request: Request<WireEnvelope>) -> Result<Response<PublishAck>, Status> {
        let wire = request.into_inner();
        let envelope = from_wire(wire)?;
        let class_label = Self::class_label(&envelope).to_string();
        let source_label = envelope.source_id.clone();

        if let Err(verify_err) = envelope::verify(&envelope, &self.registry) {
            counter!("bus_publish_total", "status" => "rejected", "class" => class_label, "source" => source_label).increment(1);
            crate::logging::log_envelope_rejected(
                crate::logging::LogCategory::Bus,
                &envelope.source_id,
                &hex_id(&envelope.event_id),
                &verify_err.to_string(),
            );
            return Ok(Response::new(PublishAck {
                status: PublishStatus::Rejected as i32,
                retry_after_ms: 0,
            }));
        }

        let current = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("bus_inflight").set(current as f64);
        if current > self.hard_limit {
            self.inflight.fetch_sub(1, Ordering::SeqCst);
            return Err(Status::resource_exhausted("bus at hard inflight limit"));
        }
        if current >= self.soft_limit {
            self.inflight.fetch_sub(1, Ordering::SeqCst);
            counter!("bus_publish_total", "status" => "retry", "class" => class_label, "source" => source_label).increment(1);
            return Ok(Response::new(PublishAck {
                status: PublishStatus::Retry as i32,
                retry_after_ms: 250,
            }));
        }

        let result = self.queue.enqueue(envelope.clone());
        self.inflight.fetch_sub(1, Ordering::SeqCst);
        gauge!("bus_queue_depth").set(self.queue.size() as f64);

        match result {
            Ok(true) => {
                counter!("bus_publish_total", "status" => "accepted", "class" => class_label, "source" => source_label).increment(1);
                Ok(Response::new(PublishAck {
                    status: PublishStatus::Accepted as i32,
                    retry_after_ms: 0,
                }))
            }
            Ok(false) => {
                counter!("bus_publish_total", "status" => "duplicate", "class" => class_label, "source" => source_label).increment(1);
                Ok(Response::new(PublishAck {
                    status: PublishStatus::Duplicate as i32,
                    retry_after_ms: 0,
                }))
            }
            Err(crate::AmoskysError::QueueFull) => {
                counter!("bus_publish_total", "status" => "retry", "class" => class_label, "source" => source_label).increment(1);
                Ok(Response::new(PublishAck {
                    status: PublishStatus::Retry as i32,
                    retry_after_ms: 500,
                }))
            }
            Err(e) => {
                tracing::warn!(error = %e, "durable queue write failed");
                counter!("bus_publish_total", "status" => "retry", "class" => class_label, "source" => source_label).increment(1);
                Ok(Response::new(PublishAck {
                    status: PublishStatus::Retry as i32,
                    retry_after_ms: 1000,
                }))
            }
        }
    }
}

fn hex_id(id: &[u8; 16]) -> String {
    id.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{seal, EventClass};
    use crate::registry::SignerRegistry;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn wire_from(key: &SigningKey, source: &str, ts: u64) -> WireEnvelope {
        let envelope = seal(key, source.into(), EventClass::Auth, ts, 1, vec![]);
        WireEnvelope {
            event_id: envelope.event_id.to_vec(),
            source_id: envelope.source_id,
            class: PbEventClass::from(envelope.class) as i32,
            timestamp_ns: envelope.timestamp_ns,
            schema_version: envelope.schema_version,
            payload: envelope.payload,
            signature: envelope.signature.to_vec(),
        }
    }

    fn service_with(key: &SigningKey, max_inflight: usize, soft_fraction: f64) -> (EventBusService, tempfile::TempDir) {
        let registry = SignerRegistry::from_pairs(vec![("agent-A".to_string(), key.verifying_key())]);
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(DurableQueue::open(dir.path(), 100, 1_000_000, 3600).unwrap());
        (EventBusService::new(registry, queue, max_inflight, soft_fraction, 5000), dir)
    }

    #[tokio::test]
    async fn accepts_then_dedupes_same_envelope() {
        let mut csprng = OsRng;
        let key = SigningKey::generate(&mut csprng);
        let (service, _dir) = service_with(&key, 64, 0.8);
        let wire = wire_from(&key, "agent-A", 1_000);

        let first = service.publish(Request::new(wire.clone())).await.unwrap();
        assert_eq!(first.into_inner().status, PublishStatus::Accepted as i32);

        let second = service.publish(Request::new(wire)).await.unwrap();
        assert_eq!(second.into_inner().status, PublishStatus::Duplicate as i32);
    }

    #[tokio::test]
    async fn unverifiable_signature_is_rejected_not_queued() {
        let mut csprng = OsRng;
        let key = SigningKey::generate(&mut csprng);
        let (service, _dir) = service_with(&key, 64, 0.8);
        let mut wire = wire_from(&key, "agent-A", 1_000);
        wire.signature[0] ^= 0x01;

        let ack = service.publish(Request::new(wire)).await.unwrap();
        assert_eq!(ack.into_inner().status, PublishStatus::Rejected as i32);
        assert_eq!(service.queue.size(), 0);
    }

    #[tokio::test]
    async fn hard_inflight_limit_refuses_at_rpc_level() {
        let mut csprng = OsRng;
        let key = SigningKey::generate(&mut csprng);
        let (service, _dir) = service_with(&key, 1, 1.0);
        service.inflight.fetch_add(1, Ordering::SeqCst);

        let wire = wire_from(&key, "agent-A", 1_000);
        let result = service.publish(Request::new(wire)).await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().code(), tonic::Code::ResourceExhausted);
    }
}
