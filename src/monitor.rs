//! Process-level health and readiness tracking, shared by the bus server
//! and fusion engine binaries to back their `/healthz` and `/ready`
//! endpoints and to periodically sample resource usage into the metrics
//! registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use metrics::gauge;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};

use crate::logging::{log_info, LogCategory};

/// Coarse health levels surfaced in the system report. `/ready` itself is
/// a strict boolean (queue writable ∧ registry loaded); this enum is a
/// richer signal for dashboards layered on top of that boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Degraded => write!(f, "DEGRADED"),
            HealthStatus::Down => write!(f, "DOWN"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_usage_percent: f64,
    pub memory_usage_mb: u64,
    pub queue_depth: u64,
    pub inflight: i64,
}

/// Tracks whether the owning component is ready to serve (queue writable
/// and signer registry loaded) and periodically samples process resource
/// usage for the metrics surface.
pub struct Monitor {
    queue_writable: AtomicBool,
    registry_loaded: AtomicBool,
    last_snapshot: Arc<RwLock<Option<ResourceSnapshot>>>,
    start_time: Instant,
    pid: Pid,
}

impl Monitor {
    pub fn new() -> Self {
        let pid = Pid::from_u32(std::process::id());
        Self {
            queue_writable: AtomicBool::new(true),
            registry_loaded: AtomicBool::new(false),
            last_snapshot: Arc::new(RwLock::new(None)),
            start_time: Instant::now(),
            pid,
        }
    }

    pub fn set_queue_writable(&self, writable: bool) {
        self.queue_writable.store(writable, Ordering::SeqCst);
    }

    pub fn set_registry_loaded(&self, loaded: bool) {
        self.registry_loaded.store(loaded, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.queue_writable.load(Ordering::SeqCst) && self.registry_loaded.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> HealthStatus {
        if !self.is_ready() {
            return HealthStatus::Down;
        }
        match self.last_snapshot.read().as_ref() {
            Some(snap) if snap.cpu_usage_percent > 95.0 => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Samples this process's CPU and memory usage via `sysinfo` and
    /// publishes them as gauges; `queue_depth`/`inflight` are supplied by
    /// the caller since the monitor itself has no queue handle.
    pub fn sample(&self, sys: &mut System, queue_depth: u64, inflight: i64) {
        sys.refresh_process(self.pid);
        let (cpu, mem_mb) = match sys.process(self.pid) {
            Some(proc) => (proc.cpu_usage() as f64, proc.memory() / 1024 / 1024),
            None => (0.0, 0),
        };

        let snapshot = ResourceSnapshot {
            timestamp: Utc::now(),
            cpu_usage_percent: cpu,
            memory_usage_mb: mem_mb,
            queue_depth,
            inflight,
        };

        gauge!("amoskys_process_cpu_percent").set(cpu);
        gauge!("amoskys_process_memory_mb").set(mem_mb as f64);
        gauge!("bus_queue_depth").set(queue_depth as f64);
        gauge!("bus_inflight").set(inflight as f64);

        *self.last_snapshot.write() = Some(snapshot);
    }

    pub fn generate_report(&self) -> serde_json::Value {
        let snapshot = self.last_snapshot.read().clone();
        serde_json::json!({
            "status": self.health().to_string(),
            "ready": self.is_ready(),
            "uptime_seconds": self.uptime_secs(),
            "resources": snapshot,
        })
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

pub fn log_startup(component: &str) {
    log_info(LogCategory::System, &format!("{component} starting"));
}
