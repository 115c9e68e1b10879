//! Startup configuration.
//!
//! A single TOML file supplies three sections — `[bus]`, `[agent]`,
//! `[fusion]`. The file path comes from the `AMOSKYS_CONFIG` environment
//! variable; no section reads secrets directly from the process
//! environment. Config is loaded once at startup and is immutable
//! thereafter as a global singleton; picking up a changed file requires a
//! restart.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{AmoskysError, Result};

fn default_listen_addr() -> String {
    "0.0.0.0:7443".to_string()
}

fn default_soft_limit_fraction() -> f64 {
    0.8
}

fn default_dedupe_window_secs() -> u64 {
    24 * 3600
}

fn default_publish_deadline_ms() -> u64 {
    5_000
}

fn default_concurrency() -> usize {
    num_cpus() * 4
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// `[bus]` section: Event Bus Server.
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Directory containing the TLS identity (cert + key) and the CA bundle
    /// client certificates chain to.
    pub tls_dir: PathBuf,
    /// Directory of `<source_id>.pub` files used to build the signer
    /// registry.
    pub signer_dir: PathBuf,
    /// Directory the server-side durable queue is persisted under.
    pub queue_dir: PathBuf,
    #[serde(default = "default_concurrency")]
    pub max_inflight: usize,
    #[serde(default = "default_soft_limit_fraction")]
    pub soft_limit_fraction: f64,
    #[serde(default = "default_dedupe_window_secs")]
    pub dedupe_window_secs: u64,
    #[serde(default = "default_publish_deadline_ms")]
    pub publish_deadline_ms: u64,
    #[serde(default)]
    pub queue: QueueLimits,
    /// Read-only HTTP observability surface.
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9443".to_string()
}

/// Durable queue capacity: whichever ceiling is hit first causes
/// `ErrFull`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueLimits {
    #[serde(default = "default_max_records")]
    pub max_records: u64,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
}

fn default_max_records() -> u64 {
    100_000
}

fn default_max_bytes() -> u64 {
    256 * 1024 * 1024
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
            max_bytes: default_max_bytes(),
        }
    }
}

/// `[agent]` section: Agent Outbox.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub source_id: String,
    /// Path to the agent's Ed25519 signing key (PKCS8 DER or raw 32-byte
    /// seed, distinct from the TLS identity).
    pub signing_key_path: PathBuf,
    pub bus_addr: String,
    pub tls_dir: PathBuf,
    pub queue_dir: PathBuf,
    #[serde(default)]
    pub queue: QueueLimits,
    #[serde(default = "default_backoff")]
    pub backoff: BackoffConfig,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_bytes")]
    pub max_batch_bytes: usize,
}

fn default_batch_size() -> usize {
    32
}

fn default_batch_bytes() -> usize {
    1024 * 1024
}

/// Backoff and circuit-breaker parameters for the outbox sender.
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
}

fn default_base_ms() -> u64 {
    250
}
fn default_cap_ms() -> u64 {
    30_000
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_cooldown_secs() -> u64 {
    15
}

fn default_backoff() -> BackoffConfig {
    BackoffConfig {
        base_ms: default_base_ms(),
        cap_ms: default_cap_ms(),
        breaker_threshold: default_breaker_threshold(),
        breaker_cooldown_secs: default_breaker_cooldown_secs(),
    }
}

impl BackoffConfig {
    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }
    pub fn cap(&self) -> Duration {
        Duration::from_millis(self.cap_ms)
    }
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }
}

/// `[fusion]` section: Fusion Engine.
#[derive(Debug, Clone, Deserialize)]
pub struct FusionConfig {
    pub input_queue_dir: PathBuf,
    pub store_dir: PathBuf,
    /// Optional path to a rules file (TOML); falls back to the built-in
    /// default rule set (`persistence_after_auth`) when absent.
    pub rules_path: Option<PathBuf>,
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    #[serde(default = "default_slack_secs")]
    pub slack_secs: u64,
    #[serde(default = "default_half_life_secs")]
    pub risk_half_life_secs: u64,
}

fn default_ring_capacity() -> usize {
    1000
}
fn default_slack_secs() -> u64 {
    60
}
fn default_half_life_secs() -> u64 {
    24 * 3600
}

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AmoskysConfig {
    pub bus: Option<BusConfig>,
    pub agent: Option<AgentConfig>,
    pub fusion: Option<FusionConfig>,
}

impl AmoskysConfig {
    /// Loads configuration from the path named by `env_var` (defaults to
    /// `AMOSKYS_CONFIG`). Each process only reads the sections it needs.
    pub fn load_from_env(env_var: &str) -> Result<Self> {
        let path = std::env::var(env_var)
            .map_err(|_| AmoskysError::Config(format!("{env_var} is not set")))?;
        Self::load_from_path(Path::new(&path))
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(|e| AmoskysError::Config(e.to_string()))?;
        settings
            .try_deserialize()
            .map_err(|e| AmoskysError::Config(e.to_string()))
    }

    pub fn bus(&self) -> Result<&BusConfig> {
        self.bus
            .as_ref()
            .ok_or_else(|| AmoskysError::Config("missing [bus] section".into()))
    }

    pub fn agent(&self) -> Result<&AgentConfig> {
        self.agent
            .as_ref()
            .ok_or_else(|| AmoskysError::Config("missing [agent] section".into()))
    }

    pub fn fusion(&self) -> Result<&FusionConfig> {
        self.fusion
            .as_ref()
            .ok_or_else(|| AmoskysError::Config("missing [fusion] section".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_env_var_is_a_config_error() {
        std::env::remove_var("AMOSKYS_CONFIG_TEST_MISSING");
        let err = AmoskysConfig::load_from_env("AMOSKYS_CONFIG_TEST_MISSING").unwrap_err();
        assert!(matches!(err, AmoskysError::Config(_)));
    }

    #[test]
    fn parses_minimal_bus_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("amoskys.toml");
        std::fs::write(
            &path,
            r#"
            [bus]
            tls_dir = "/tmp/tls"
            signer_dir = "/tmp/signers"
            queue_dir = "/tmp/queue"
            "#,
        )
        .unwrap();

        let cfg = AmoskysConfig::load_from_path(&path).unwrap();
        let bus = cfg.bus().unwrap();
        assert_eq!(bus.listen_addr, default_listen_addr());
        assert_eq!(bus.soft_limit_fraction, 0.8);
        assert_eq!(bus.queue.max_records, default_max_records());
    }
}
