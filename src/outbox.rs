//! Agent Outbox: the durable, at-least-once, exponentially-backing-off
//! publisher embedded in each agent. This module is a library component —
//! the OS-specific probes and process wiring that feed it live outside this
//! crate.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use metrics::gauge;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};

use crate::config::{AgentConfig, BackoffConfig};
use crate::envelope::Envelope;
use crate::error_handling::{Backoff, CircuitBreaker};
use crate::pb::event_bus_client::EventBusClient;
use crate::pb::{PublishStatus, WireEnvelope};
use crate::queue::DurableQueue;
use crate::{AmoskysError, Result};

/// The single queue-writer side of the outbox: every probe thread holds a
/// clone of the `mpsc::Sender` this loop reads from, so all concurrent
/// producers serialize through one writer, preserving the durable queue's
/// single-writer invariant.
pub struct QueueWriter {
    queue: Arc<DurableQueue>,
}

impl QueueWriter {
    pub fn new(queue: Arc<DurableQueue>) -> Self {
        Self { queue }
    }

    /// Drains `rx` until every sender clone is dropped or `token` is
    /// cancelled, enqueueing each envelope as it arrives.
    pub async fn run(self, mut rx: mpsc::Receiver<Envelope>, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                envelope = rx.recv() => {
                    match envelope {
                        Some(envelope) => {
                            if let Err(e) = self.queue.enqueue(envelope) {
                                tracing::warn!(error = %e, "outbox queue-writer enqueue failed");
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    }
}

fn to_wire(envelope: &Envelope) -> WireEnvelope {
    WireEnvelope {
        event_id: envelope.event_id.to_vec(),
        source_id: envelope.source_id.clone(),
        class: crate::pb::EventClass::from(envelope.class) as i32,
        timestamp_ns: envelope.timestamp_ns,
        schema_version: envelope.schema_version,
        payload: envelope.payload.clone(),
        signature: envelope.signature.to_vec(),
    }
}

/// Builds a mutually-authenticated TLS channel to the bus, using the
/// agent's TLS identity (distinct from its Ed25519 envelope-signing key).
pub async fn connect(bus_addr: &str, tls_dir: &Path) -> Result<Channel> {
    let cert = std::fs::read(tls_dir.join("client.crt"))?;
    let key = std::fs::read(tls_dir.join("client.key"))?;
    let ca = std::fs::read(tls_dir.join("ca.crt"))?;

    let tls = ClientTlsConfig::new()
        .identity(Identity::from_pem(cert, key))
        .ca_certificate(Certificate::from_pem(ca));

    Channel::from_shared(format!("https://{bus_addr}"))
        .map_err(|e| AmoskysError::Transport(e.to_string()))?
        .tls_config(tls)
        .map_err(|e| AmoskysError::Transport(e.to_string()))?
        .connect()
        .await
        .map_err(|e| AmoskysError::Transport(e.to_string()))
}

/// Drives the sender state machine for one queue against one bus
/// connection: `PENDING → INFLIGHT (on send) → DONE (on ACCEPTED|DUPLICATE)
/// | PENDING (on RETRY or transport error, with backoff)`. Non-retryable
/// `REJECTED` verdicts also move to `DONE`, counted as `dropped_rejected`,
/// so a poison record cannot stall the queue.
pub struct Sender {
    queue: Arc<DurableQueue>,
    client: EventBusClient<Channel>,
    backoff: Backoff,
    breaker: CircuitBreaker,
    batch_size: usize,
    max_batch_bytes: usize,
    dropped_rejected: std::sync::atomic::AtomicU64,
}

impl Sender {
    pub fn new(queue: Arc<DurableQueue>, channel: Channel, cfg: &BackoffConfig, batch_size: usize, max_batch_bytes: usize) -> Self {
        Self {
            queue,
            client: EventBusClient::new(channel),
            backoff: Backoff::new(cfg.base(), cfg.cap()),
            breaker: CircuitBreaker::new(cfg.breaker_threshold, cfg.cooldown()),
            batch_size,
            max_batch_bytes,
            dropped_rejected: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn dropped_rejected(&self) -> u64 {
        self.dropped_rejected.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Drains and sends one batch, respecting the byte ceiling on top of
    /// the record-count ceiling: up to the configured batch size, stopping
    /// early if adding the next record would exceed the byte cap. Returns
    /// the number of records acknowledged DONE (accepted, duplicate, or
    /// rejected).
    pub async fn send_batch(&mut self) -> Result<usize> {
        if !self.breaker.allow() {
            return Ok(0);
        }

        let records = self.queue.peek_batch(self.batch_size)?;
        if records.is_empty() {
            return Ok(0);
        }

        let mut batch = Vec::with_capacity(records.len());
        let mut bytes = 0usize;
        for record in &records {
            let size = record.envelope.payload.len() + 96;
            if bytes + size > self.max_batch_bytes && !batch.is_empty() {
                break;
            }
            bytes += size;
            batch.push(record.clone());
        }

        let mut acked = Vec::new();
        let mut nacked: Vec<([u8; 16], u32)> = Vec::new();
        let mut done = 0usize;

        for record in &batch {
            let wire = to_wire(&record.envelope);
            match self.client.publish(wire).await {
                Ok(response) => {
                    self.breaker.record_success();
                    let status = PublishStatus::try_from(response.into_inner().status)
                        .unwrap_or(PublishStatus::Unspecified);
                    match status {
                        PublishStatus::Accepted | PublishStatus::Duplicate => {
                            acked.push(record.envelope.event_id);
                            done += 1;
                        }
                        PublishStatus::Rejected => {
                            acked.push(record.envelope.event_id);
                            self.dropped_rejected.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            done += 1;
                        }
                        PublishStatus::Retry | PublishStatus::Unspecified => {
                            nacked.push((record.envelope.event_id, record.attempts));
                        }
                    }
                }
                Err(_) => {
                    self.breaker.record_failure();
                    nacked.push((record.envelope.event_id, record.attempts));
                }
            }
        }

        if !acked.is_empty() {
            self.queue.ack(&acked)?;
        }
        if !nacked.is_empty() {
            // each record backs off from its own attempt count, not the
            // batch's first record, so a record deep into retries doesn't
            // borrow a fresher record's short delay.
            let mut by_attempts: std::collections::BTreeMap<u32, Vec<[u8; 16]>> =
                std::collections::BTreeMap::new();
            for (event_id, attempts) in &nacked {
                by_attempts.entry(*attempts).or_default().push(*event_id);
            }
            let mut last_delay = Duration::ZERO;
            for (attempts, event_ids) in by_attempts {
                let delay = self.backoff.delay_for_attempt(attempts);
                self.queue.nack(&event_ids, delay.as_nanos() as u64)?;
                last_delay = delay;
            }
            gauge!("agent_outbox_backoff_ms").set(last_delay.as_millis() as f64);
        }

        gauge!("agent_outbox_depth").set(self.queue.size() as f64);
        Ok(done)
    }

    /// Runs the sender loop until `token` is cancelled, pausing `idle_delay`
    /// between empty drains.
    pub async fn run(&mut self, idle_delay: Duration, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                sent = self.send_batch() => {
                    match sent {
                        Ok(0) => tokio::time::sleep(idle_delay).await,
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "outbox send_batch failed");
                            tokio::time::sleep(idle_delay).await;
                        }
                    }
                }
            }
        }
    }
}

/// Opens the durable queue and wires both sides of the outbox: the
/// producer-facing `mpsc::Sender<Envelope>` that probe threads clone and
/// feed, the `QueueWriter`/`Receiver` pair the caller spawns as the single
/// writer task, and the RPC-facing `Sender` that drains the queue toward
/// the bus.
pub async fn open_outbox(
    config: &AgentConfig,
) -> Result<(mpsc::Sender<Envelope>, mpsc::Receiver<Envelope>, QueueWriter, Sender)> {
    let queue = Arc::new(DurableQueue::open(
        &config.queue_dir,
        config.queue.max_records,
        config.queue.max_bytes,
        24 * 3600,
    )?);
    let channel = connect(&config.bus_addr, &config.tls_dir).await?;
    let sender = Sender::new(
        queue.clone(),
        channel,
        &config.backoff,
        config.batch_size,
        config.max_batch_bytes,
    );
    let (tx, rx) = mpsc::channel(config.batch_size * 4);
    let writer = QueueWriter::new(queue);
    Ok((tx, rx, writer, sender))
}
