//! Durable queue: a bounded, crash-safe, single-writer FIFO persisted to
//! `sled`, backing both the Event Bus Server's inbound persistence and the
//! Agent Outbox's on-disk retry buffer.
//!
//! Two trees back one logical queue: `log`, keyed by a monotonic sequence
//! number, carries FIFO order; `index`, keyed by `event_id`, gives O(1)
//! dedupe/ack/nack lookup without a scan. `ack` removes a record from both
//! trees; `nack` rewrites it in place at its original sequence position so
//! retried records keep their place in line rather than going to the back.

use serde::{Deserialize, Serialize};
use sled::transaction::ConflictableTransactionError;
use sled::Transactional;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::envelope::Envelope;
use crate::{AmoskysError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordState {
    Pending,
    Inflight,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRecord {
    pub envelope: Envelope,
    pub attempts: u32,
    pub next_due_ns: u64,
    pub state: RecordState,
    /// Monotonic position assigned at enqueue; preserved across `nack` so
    /// FIFO order reflects original arrival, not retry order.
    pub sequence: u64,
    pub enqueued_ns: u64,
}

/// Lookup entry in the `index` tree: maps an `event_id` to its `log`
/// sequence number plus the minimal state needed for dedupe decisions
/// without deserializing the full record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    sequence: u64,
    state: RecordState,
    done_ns: Option<u64>,
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

fn seq_key(seq: u64) -> [u8; 8] {
    seq.to_be_bytes()
}

pub struct DurableQueue {
    log: sled::Tree,
    index: sled::Tree,
    next_sequence: AtomicU64,
    record_count: AtomicU64,
    byte_count: AtomicU64,
    max_records: u64,
    max_bytes: u64,
    dedupe_window_ns: u64,
}

impl DurableQueue {
    pub fn open(dir: &Path, max_records: u64, max_bytes: u64, dedupe_window_secs: u64) -> Result<Self> {
        let db = sled::open(dir)?;
        let log = db.open_tree("log")?;
        let index = db.open_tree("index")?;

        let mut max_seq = 0u64;
        let mut record_count = 0u64;
        let mut byte_count = 0u64;
        for item in log.iter() {
            let (k, v) = item?;
            let seq = u64::from_be_bytes(k.as_ref().try_into().unwrap());
            max_seq = max_seq.max(seq);
            record_count += 1;
            byte_count += v.len() as u64;
        }

        Ok(Self {
            log,
            index,
            next_sequence: AtomicU64::new(max_seq + 1),
            record_count: AtomicU64::new(record_count),
            byte_count: AtomicU64::new(byte_count),
            max_records,
            max_bytes,
            dedupe_window_ns: dedupe_window_secs.saturating_mul(1_000_000_000),
        })
    }

    fn event_key(event_id: &[u8; 16]) -> [u8; 16] {
        *event_id
    }

    /// `enqueue(envelope) → ErrFull | ok`. Idempotent: re-enqueuing a known
    /// `PENDING`/`INFLIGHT` `event_id` is a no-op; an `event_id` `DONE`
    /// within the dedupe window is reported back via `Ok(false)` so the
    /// caller can return `DUPLICATE` without a second admission check.
    pub fn enqueue(&self, envelope: Envelope) -> Result<bool> {
        let key = Self::event_key(&envelope.event_id);

        if let Some(raw) = self.index.get(key)? {
            let entry: IndexEntry = bincode::deserialize(&raw)
                .map_err(|e| AmoskysError::Storage(e.to_string()))?;
            match entry.state {
                RecordState::Pending | RecordState::Inflight => return Ok(true),
                RecordState::Done => {
                    let done_ns = entry.done_ns.unwrap_or(0);
                    if now_ns().saturating_sub(done_ns) < self.dedupe_window_ns {
                        return Ok(false);
                    }
                }
            }
        }

        if self.record_count.load(Ordering::SeqCst) >= self.max_records
            || self.byte_count.load(Ordering::SeqCst) >= self.max_bytes
        {
            return Err(AmoskysError::QueueFull);
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let record = QueueRecord {
            envelope,
            attempts: 0,
            next_due_ns: 0,
            state: RecordState::Pending,
            sequence,
            enqueued_ns: now_ns(),
        };
        let record_bytes =
            bincode::serialize(&record).map_err(|e| AmoskysError::Storage(e.to_string()))?;
        let index_bytes = bincode::serialize(&IndexEntry {
            sequence,
            state: RecordState::Pending,
            done_ns: None,
        })
        .map_err(|e| AmoskysError::Storage(e.to_string()))?;

        (&self.log, &self.index)
            .transaction(|(log, index)| {
                log.insert(&seq_key(sequence), record_bytes.clone())?;
                index.insert(&key, index_bytes.clone())?;
                Ok::<_, ConflictableTransactionError<()>>(())
            })
            .map_err(|e| AmoskysError::Storage(format!("{:?}", e)))?;
        self.log.flush()?;

        self.record_count.fetch_add(1, Ordering::SeqCst);
        self.byte_count
            .fetch_add(record_bytes.len() as u64, Ordering::SeqCst);
        Ok(true)
    }

    /// `peek_batch(n) → [records]`: the oldest `n` `PENDING` records whose
    /// `next_due_ns` has passed, in FIFO order, transitioned to `INFLIGHT`.
    pub fn peek_batch(&self, n: usize) -> Result<Vec<QueueRecord>> {
        let now = now_ns();
        let mut out = Vec::with_capacity(n);
        for item in self.log.iter() {
            if out.len() >= n {
                break;
            }
            let (k, v) = item?;
            let mut record: QueueRecord =
                bincode::deserialize(&v).map_err(|e| AmoskysError::Storage(e.to_string()))?;
            if record.state != RecordState::Pending || record.next_due_ns > now {
                continue;
            }
            record.state = RecordState::Inflight;
            let bytes = bincode::serialize(&record).map_err(|e| AmoskysError::Storage(e.to_string()))?;
            self.log.insert(&k, bytes)?;
            let key = Self::event_key(&record.envelope.event_id);
            self.index.insert(
                key,
                bincode::serialize(&IndexEntry {
                    sequence: record.sequence,
                    state: RecordState::Inflight,
                    done_ns: None,
                })
                .map_err(|e| AmoskysError::Storage(e.to_string()))?,
            )?;
            out.push(record);
        }
        if !out.is_empty() {
            self.log.flush()?;
        }
        Ok(out)
    }

    /// `ack(event_ids[])`: removes the record entirely, freeing its slot.
    pub fn ack(&self, event_ids: &[[u8; 16]]) -> Result<()> {
        for event_id in event_ids {
            let key = Self::event_key(event_id);
            if let Some(raw) = self.index.remove(key)? {
                let entry: IndexEntry = bincode::deserialize(&raw)
                    .map_err(|e| AmoskysError::Storage(e.to_string()))?;
                if let Some(removed) = self.log.remove(seq_key(entry.sequence))? {
                    self.record_count.fetch_sub(1, Ordering::SeqCst);
                    self.byte_count
                        .fetch_sub(removed.len() as u64, Ordering::SeqCst);
                }
            }
        }
        self.log.flush()?;
        Ok(())
    }

    /// `nack(event_ids[], backoff_ns)`: puts records back as `PENDING` with
    /// `next_due_ns = now + backoff_ns`, preserving their original sequence.
    pub fn nack(&self, event_ids: &[[u8; 16]], backoff_ns: u64) -> Result<()> {
        let now = now_ns();
        for event_id in event_ids {
            let key = Self::event_key(event_id);
            let Some(raw) = self.index.get(key)? else {
                continue;
            };
            let entry: IndexEntry = bincode::deserialize(&raw)
                .map_err(|e| AmoskysError::Storage(e.to_string()))?;
            let seq = seq_key(entry.sequence);
            let Some(rec_bytes) = self.log.get(&seq)? else {
                continue;
            };
            let mut record: QueueRecord = bincode::deserialize(&rec_bytes)
                .map_err(|e| AmoskysError::Storage(e.to_string()))?;
            record.attempts += 1;
            record.next_due_ns = now.saturating_add(backoff_ns);
            record.state = RecordState::Pending;
            let bytes = bincode::serialize(&record).map_err(|e| AmoskysError::Storage(e.to_string()))?;
            self.log.insert(&seq, bytes)?;
            self.index.insert(
                key,
                bincode::serialize(&IndexEntry {
                    sequence: entry.sequence,
                    state: RecordState::Pending,
                    done_ns: None,
                })
                .map_err(|e| AmoskysError::Storage(e.to_string()))?,
            )?;
        }
        self.log.flush()?;
        Ok(())
    }

    /// Marks a record `DONE` in the index (used by the bus server's
    /// dedupe-window tracking) while physically removing it from `log` to
    /// keep the FIFO scan bounded to outstanding work.
    pub fn mark_done(&self, event_id: &[u8; 16]) -> Result<()> {
        let key = Self::event_key(event_id);
        if let Some(raw) = self.index.get(key)? {
            let entry: IndexEntry = bincode::deserialize(&raw)
                .map_err(|e| AmoskysError::Storage(e.to_string()))?;
            if let Some(removed) = self.log.remove(seq_key(entry.sequence))? {
                self.record_count.fetch_sub(1, Ordering::SeqCst);
                self.byte_count
                    .fetch_sub(removed.len() as u64, Ordering::SeqCst);
            }
            self.index.insert(
                key,
                bincode::serialize(&IndexEntry {
                    sequence: entry.sequence,
                    state: RecordState::Done,
                    done_ns: Some(now_ns()),
                })
                .map_err(|e| AmoskysError::Storage(e.to_string()))?,
            )?;
        }
        self.log.flush()?;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.record_count.load(Ordering::SeqCst)
    }

    /// Age in nanoseconds of the oldest `PENDING`/`INFLIGHT` record, or
    /// `None` when the queue is empty.
    pub fn oldest_age(&self) -> Result<Option<u64>> {
        let now = now_ns();
        for item in self.log.iter() {
            let (_, v) = item?;
            let record: QueueRecord =
                bincode::deserialize(&v).map_err(|e| AmoskysError::Storage(e.to_string()))?;
            return Ok(Some(now.saturating_sub(record.enqueued_ns)));
        }
        Ok(None)
    }
}
