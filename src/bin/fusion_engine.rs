//! Fusion Engine binary: introspection CLI
//! (`--list-incidents [--limit N]`, `--risk <device_id>`), plus a standalone
//! consumer-loop mode for offline replay. The bus server normally runs this
//! same consumer loop embedded in-process against its live queue (see
//! `bin/bus_server.rs`) since `sled` won't let two processes open one queue
//! directory at once; point this binary's `fusion.input_queue_dir` at a
//! queue directory no running bus server currently holds open.

use std::time::Duration;

use amoskys::config::AmoskysConfig;
use amoskys::fusion::{load_rules, FusionEngine};
use amoskys::incident::IncidentStore;
use amoskys::queue::DurableQueue;
use amoskys::risk::RiskLedger;
use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};

#[derive(Parser, Debug)]
#[command(name = "fusion-engine", about = "Streaming correlation engine and incident CLI")]
struct Cli {
    /// List the most recent incidents and exit instead of running the consumer loop.
    #[arg(long)]
    list_incidents: bool,

    /// Row limit for --list-incidents.
    #[arg(long, default_value_t = 20)]
    limit: usize,

    /// Print the current risk score for a device and exit.
    #[arg(long)]
    risk: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    amoskys::logging::init("fusion-engine");

    let cli = Cli::parse();
    let config = AmoskysConfig::load_from_env("AMOSKYS_CONFIG").wrap_err("loading configuration")?;
    let fusion_cfg = config.fusion().wrap_err("missing [fusion] section")?;

    let incidents = IncidentStore::open(&fusion_cfg.store_dir).wrap_err("opening incident store")?;

    if cli.list_incidents {
        for incident in incidents.list_recent(cli.limit)? {
            println!(
                "{} {} {:?} {} {}",
                hex_id(&incident.incident_id),
                incident.rule_id,
                incident.severity,
                incident.device_id,
                incident.summary
            );
        }
        return Ok(());
    }

    if let Some(device_id) = cli.risk {
        let risk = RiskLedger::new(fusion_cfg.risk_half_life_secs);
        for incident in incidents.for_device(&device_id)? {
            risk.record_incident(&device_id, incident.severity, incident.created_ns);
        }
        let now_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        println!("{}", risk.score(&device_id, now_ns));
        return Ok(());
    }

    amoskys::monitor::log_startup("fusion-engine");

    let rules = load_rules(fusion_cfg.rules_path.as_deref()).wrap_err("loading fusion rules")?;
    let risk = RiskLedger::new(fusion_cfg.risk_half_life_secs);
    let mut engine = FusionEngine::new(rules, fusion_cfg.ring_capacity, incidents, risk);

    let input_queue = DurableQueue::open(&fusion_cfg.input_queue_dir, u64::MAX, u64::MAX, 0)
        .wrap_err("opening fusion input queue")?;

    engine.start();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested, draining in-flight batch");
                break;
            }
            result = async { engine.drain(&input_queue, 64) } => {
                match result? {
                    0 => tokio::time::sleep(Duration::from_millis(200)).await,
                    _ => {}
                }
            }
        }
    }
    engine.stop()?;

    Ok(())
}

fn hex_id(id: &[u8; 16]) -> String {
    id.iter().map(|b| format!("{b:02x}")).collect()
}
