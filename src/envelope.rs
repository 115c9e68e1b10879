//! Canonical event envelope: content-addressed identity and signature
//! verification.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::registry::SignerRegistry;

/// Accepted clock-skew window: `[now - 24h, now + 5min]`.
pub const MAX_PAST_SKEW: Duration = Duration::from_secs(24 * 3600);
pub const MAX_FUTURE_SKEW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventClass {
    Auth,
    Persistence,
    Flow,
    Process,
    Other,
}

impl EventClass {
    fn discriminant(self) -> u8 {
        match self {
            EventClass::Auth => 1,
            EventClass::Persistence => 2,
            EventClass::Flow => 3,
            EventClass::Process => 4,
            EventClass::Other => 5,
        }
    }
}

impl From<crate::pb::EventClass> for EventClass {
    fn from(c: crate::pb::EventClass) -> Self {
        match c {
            crate::pb::EventClass::Auth => EventClass::Auth,
            crate::pb::EventClass::Persistence => EventClass::Persistence,
            crate::pb::EventClass::Flow => EventClass::Flow,
            crate::pb::EventClass::Process => EventClass::Process,
            crate::pb::EventClass::Other | crate::pb::EventClass::Unspecified => EventClass::Other,
        }
    }
}

impl From<EventClass> for crate::pb::EventClass {
    fn from(c: EventClass) -> Self {
        match c {
            EventClass::Auth => crate::pb::EventClass::Auth,
            EventClass::Persistence => crate::pb::EventClass::Persistence,
            EventClass::Flow => crate::pb::EventClass::Flow,
            EventClass::Process => crate::pb::EventClass::Process,
            EventClass::Other => crate::pb::EventClass::Other,
        }
    }
}

/// The sole on-the-wire unit. Field order here is the canonical order used
/// by [`canonicalize`] and [`canonicalize_for_id`]: `event_id, source_id,
/// class, timestamp_ns, schema_version, payload, signature`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: [u8; 16],
    pub source_id: String,
    pub class: EventClass,
    pub timestamp_ns: u64,
    pub schema_version: u32,
    pub payload: Vec<u8>,
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("no signer registered for source_id {0:?}")]
    UnknownSource(String),
    #[error("signature does not verify")]
    BadSignature,
    #[error("event_id does not match canonicalized content")]
    IdMismatch,
    #[error("timestamp_ns {0} outside accepted skew window")]
    ClockSkew(u64),
}

/// Deterministic encoding with fixed field order, no map ambiguity. Used as
/// the basis for both signing and `event_id` derivation; `exclude_signature`
/// and `exclude_event_id` let the two derivations share one implementation
/// without either digest depending on itself.
fn canonical_bytes(envelope: &Envelope, exclude_signature: bool, exclude_event_id: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32 + envelope.payload.len());
    if !exclude_event_id {
        buf.extend_from_slice(&envelope.event_id);
    }
    buf.extend_from_slice(&(envelope.source_id.len() as u32).to_be_bytes());
    buf.extend_from_slice(envelope.source_id.as_bytes());
    buf.push(envelope.class.discriminant());
    buf.extend_from_slice(&envelope.timestamp_ns.to_be_bytes());
    buf.extend_from_slice(&envelope.schema_version.to_be_bytes());
    buf.extend_from_slice(&(envelope.payload.len() as u64).to_be_bytes());
    buf.extend_from_slice(&envelope.payload);
    if !exclude_signature {
        buf.extend_from_slice(&envelope.signature);
    }
    buf
}

/// Canonical bytes including `event_id`, excluding `signature`: what gets
/// signed, and what a signature is checked against.
pub fn canonicalize(envelope: &Envelope) -> Vec<u8> {
    canonical_bytes(envelope, true, false)
}

/// Canonical bytes excluding both `event_id` and `signature`: the basis for
/// `event_id` itself, since `event_id` cannot be a function of its own bytes.
pub fn canonicalize_for_id(envelope: &Envelope) -> Vec<u8> {
    canonical_bytes(envelope, true, true)
}

/// `compute_event_id(envelope) → id`: BLAKE3 of the canonical bytes minus
/// signature and event_id, truncated to 128 bits.
pub fn compute_event_id(envelope: &Envelope) -> [u8; 16] {
    let digest = blake3::hash(&canonicalize_for_id(envelope));
    let mut id = [0u8; 16];
    id.copy_from_slice(&digest.as_bytes()[..16]);
    id
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

fn within_skew(timestamp_ns: u64, now_ns: u64) -> bool {
    let past_floor = now_ns.saturating_sub(MAX_PAST_SKEW.as_nanos() as u64);
    let future_ceiling = now_ns.saturating_add(MAX_FUTURE_SKEW.as_nanos() as u64);
    timestamp_ns >= past_floor && timestamp_ns <= future_ceiling
}

/// Full admission check: `event_id` matches canonicalized content, the
/// signature verifies under the key registered for `source_id`, and
/// `timestamp_ns` falls in the accepted skew window.
pub fn verify(envelope: &Envelope, registry: &SignerRegistry) -> Result<(), VerifyError> {
    if compute_event_id(envelope) != envelope.event_id {
        return Err(VerifyError::IdMismatch);
    }

    let key = registry
        .get(&envelope.source_id)
        .ok_or_else(|| VerifyError::UnknownSource(envelope.source_id.clone()))?;

    let sig = Signature::from_bytes(&envelope.signature);
    key.verify(&canonicalize(envelope), &sig)
        .map_err(|_| VerifyError::BadSignature)?;

    if !within_skew(envelope.timestamp_ns, now_ns()) {
        return Err(VerifyError::ClockSkew(envelope.timestamp_ns));
    }

    Ok(())
}

/// Same as [`verify`] but checks skew against a caller-supplied `now_ns`,
/// used by tests that need deterministic boundary behavior.
pub fn verify_at(envelope: &Envelope, registry: &SignerRegistry, now_ns: u64) -> Result<(), VerifyError> {
    if compute_event_id(envelope) != envelope.event_id {
        return Err(VerifyError::IdMismatch);
    }
    let key = registry
        .get(&envelope.source_id)
        .ok_or_else(|| VerifyError::UnknownSource(envelope.source_id.clone()))?;
    let sig = Signature::from_bytes(&envelope.signature);
    key.verify(&canonicalize(envelope), &sig)
        .map_err(|_| VerifyError::BadSignature)?;
    if !within_skew(envelope.timestamp_ns, now_ns) {
        return Err(VerifyError::ClockSkew(envelope.timestamp_ns));
    }
    Ok(())
}

/// Builds and signs an envelope from its content fields, computing
/// `event_id` and `signature` in the correct order. Used by agents and by
/// tests that need well-formed envelopes.
pub fn seal(
    signing_key: &ed25519_dalek::SigningKey,
    source_id: String,
    class: EventClass,
    timestamp_ns: u64,
    schema_version: u32,
    payload: Vec<u8>,
) -> Envelope {
    let mut envelope = Envelope {
        event_id: [0u8; 16],
        source_id,
        class,
        timestamp_ns,
        schema_version,
        payload,
        signature: [0u8; 64],
    };
    envelope.event_id = compute_event_id(&envelope);
    let sig: Signature = ed25519_dalek::Signer::sign(signing_key, &canonicalize(&envelope));
    envelope.signature = sig.to_bytes();
    envelope
}
