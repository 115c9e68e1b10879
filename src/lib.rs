//! AMOSKYS / InfraSpectre — host-and-fleet security telemetry.
//!
//! This crate implements the reliable telemetry pipeline described in the
//! project specification: a mutually-authenticated event bus, a durable
//! at-least-once agent outbox, and a streaming fusion engine that correlates
//! multi-source events into incidents tied to a per-device risk score.
//!
//! Modules are organized the way the pipeline is laid out end to end:
//! envelope/crypto at the bottom, the durable queue above it, the bus server
//! and agent outbox riding on the queue, and the fusion engine consuming
//! queues on the other side.

pub mod config;
pub mod envelope;
pub mod error_handling;
pub mod fusion;
pub mod incident;
pub mod logging;
pub mod monitor;
pub mod outbox;
pub mod queue;
pub mod registry;
pub mod risk;

pub mod bus;

pub mod pb {
    tonic::include_proto!("amoskys.v1");
}

use thiserror::Error;

/// Crate-wide error type. Variants mirror the error kinds named in the
/// specification's error-handling design rather than implementation details,
/// so callers can match on them the same way across every component.
#[derive(Debug, Error)]
pub enum AmoskysError {
    /// Retryable transport failure: connection refused, reset, timed out.
    #[error("transport error: {0}")]
    Transport(String),

    /// Fatal to the RPC in progress; the connection is closed.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Per-envelope, non-retryable verification failure.
    #[error("envelope verification failed: {0}")]
    Verify(#[from] envelope::VerifyError),

    /// `timestamp_ns` outside the accepted skew window.
    #[error("clock skew: timestamp outside accepted window")]
    ClockSkew,

    /// Backpressure: the durable queue is at capacity.
    #[error("queue full")]
    QueueFull,

    /// Operationally fatal: the owning component should become unready.
    #[error("storage error: {0}")]
    Storage(String),

    /// Isolated rule-evaluation failure; never propagates past the engine.
    #[error("rule error: {0}")]
    Rule(String),

    /// Graceful shutdown in progress.
    #[error("shutdown requested")]
    ShutdownRequested,

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<sled::Error> for AmoskysError {
    fn from(e: sled::Error) -> Self {
        AmoskysError::Storage(e.to_string())
    }
}

impl From<std::io::Error> for AmoskysError {
    fn from(e: std::io::Error) -> Self {
        AmoskysError::Storage(e.to_string())
    }
}

/// Result type used across the crate's public APIs.
pub type Result<T> = std::result::Result<T, AmoskysError>;
