//! Event Bus Server: the mutually-authenticated ingest RPC endpoint plus the
//! read-only HTTP observability surface it shares a process with.

mod observability;
mod service;
mod tls;

pub use observability::{serve_observability, ObservabilityState};
pub use service::EventBusService;
pub use tls::load_server_tls;
