//! Structured logging setup and the category taxonomy used across the
//! pipeline's log statements, so every component tags records the same way
//! regardless of which binary emits them.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

/// Coarse category attached to log statements, mirroring the components
/// laid out in the system overview. Kept as an enum (rather than a free
/// string) so call sites can't typo a category that never gets filtered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    Envelope,
    Queue,
    Bus,
    Outbox,
    Fusion,
    Risk,
    Config,
    System,
}

impl LogCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Envelope => "envelope",
            LogCategory::Queue => "queue",
            LogCategory::Bus => "bus",
            LogCategory::Outbox => "outbox",
            LogCategory::Fusion => "fusion",
            LogCategory::Risk => "risk",
            LogCategory::Config => "config",
            LogCategory::System => "system",
        }
    }
}

pub fn log_info(category: LogCategory, message: &str) {
    tracing::info!(category = category.as_str(), "{message}");
}

pub fn log_warn(category: LogCategory, message: &str) {
    tracing::warn!(category = category.as_str(), "{message}");
}

pub fn log_error(category: LogCategory, message: &str) {
    tracing::error!(category = category.as_str(), "{message}");
}

/// Installs the global `tracing` subscriber: JSON-formatted structured logs
/// on stdout, level controlled by `RUST_LOG` (defaulting to `info`). Returns
/// a guard that must be held for the process lifetime when file appending
/// is enabled elsewhere; stdout logging needs no guard but the signature is
/// kept uniform so binaries don't need to special-case it.
pub fn init(service_name: &'static str) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .json()
        .with_target(true)
        .with_current_span(true)
        .with_span_list(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    tracing::info!(service = service_name, "logging initialized");
    None
}

/// Logs an envelope-admission decision without ever including payload
/// bytes, per the rule that payloads never appear in structured logs.
pub fn log_envelope_rejected(category: LogCategory, source_id: &str, event_id_hex: &str, reason: &str) {
    tracing::info!(
        category = category.as_str(),
        source_id,
        event_id = event_id_hex,
        reason,
        "envelope rejected"
    );
}
