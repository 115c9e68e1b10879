//! Event Bus Server binary: wires configuration, logging, the signer
//! registry, the durable queue, the `Publish` RPC service, and the
//! observability HTTP surface together, then serves until `ctrl_c`, at
//! which point the gRPC server, the embedded fusion consumer, and the
//! observability surface all wind down together rather than being torn
//! down out from under each other.
//!
//! The fusion engine's consumer loop runs embedded here, on the same
//! `Arc<DurableQueue>` handle the `Publish` service writes into, rather than
//! as a second OS process pointed at the same directory: `sled` takes an
//! exclusive lock per directory, so the `fusion-engine` binary's consumer
//! mode is only safe against a queue directory no bus server currently has
//! open (offline replay); its `--list-incidents`/`--risk` introspection
//! modes only touch the incident store and remain safe to run alongside it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use amoskys::bus::{load_server_tls, serve_observability, EventBusService, ObservabilityState};
use amoskys::config::AmoskysConfig;
use amoskys::fusion::{load_rules, FusionEngine};
use amoskys::incident::IncidentStore;
use amoskys::monitor::Monitor;
use amoskys::pb::event_bus_server::EventBusServer;
use amoskys::queue::DurableQueue;
use amoskys::registry::SignerRegistry;
use amoskys::risk::RiskLedger;
use color_eyre::eyre::{Result, WrapErr};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    amoskys::logging::init("bus-server");

    let config = AmoskysConfig::load_from_env("AMOSKYS_CONFIG").wrap_err("loading configuration")?;
    let bus_cfg = config.bus().wrap_err("missing [bus] section")?;

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("installing prometheus recorder")?;

    let monitor = Arc::new(Monitor::new());
    amoskys::monitor::log_startup("bus-server");

    let registry = SignerRegistry::load_dir(&bus_cfg.signer_dir).wrap_err("loading signer registry")?;
    monitor.set_registry_loaded(!registry.is_empty());

    let queue = Arc::new(DurableQueue::open(
        &bus_cfg.queue_dir,
        bus_cfg.queue.max_records,
        bus_cfg.queue.max_bytes,
        bus_cfg.dedupe_window_secs,
    )?);
    monitor.set_queue_writable(true);

    let service = EventBusService::new(
        registry,
        queue.clone(),
        bus_cfg.max_inflight,
        bus_cfg.soft_limit_fraction,
        bus_cfg.publish_deadline_ms,
    );
    let publish_deadline = Duration::from_millis(service.publish_deadline_ms());

    let tls = load_server_tls(&bus_cfg.tls_dir).wrap_err("loading TLS identity")?;

    let listen_addr: SocketAddr = bus_cfg.listen_addr.parse().wrap_err("parsing bus.listen_addr")?;
    let metrics_addr: SocketAddr = bus_cfg.metrics_addr.parse().wrap_err("parsing bus.metrics_addr")?;

    let observability_monitor = monitor.clone();
    let observability_state = Arc::new(ObservabilityState {
        ready: Box::new(move || observability_monitor.is_ready()),
        metrics_handle,
    });

    let shutdown = CancellationToken::new();

    let observability_shutdown = shutdown.clone();
    let observability_task = tokio::spawn(serve_observability(metrics_addr, observability_state, async move {
        observability_shutdown.cancelled().await;
    }));

    let fusion_task = match config.fusion() {
        Ok(fusion_cfg) => {
            let incidents = IncidentStore::open(&fusion_cfg.store_dir).wrap_err("opening incident store")?;
            let risk = RiskLedger::new(fusion_cfg.risk_half_life_secs);
            let rules = load_rules(fusion_cfg.rules_path.as_deref()).wrap_err("loading fusion rules")?;
            let mut engine = FusionEngine::new(rules, fusion_cfg.ring_capacity, incidents, risk);
            engine.start();
            let fusion_queue = queue.clone();
            let fusion_shutdown = shutdown.clone();
            Some(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = fusion_shutdown.cancelled() => break,
                        result = async { engine.drain(&fusion_queue, 64) } => {
                            match result {
                                Ok(0) => tokio::time::sleep(Duration::from_millis(200)).await,
                                Ok(_) => {}
                                Err(e) => {
                                    tracing::warn!(error = %e, "fusion drain failed");
                                    tokio::time::sleep(Duration::from_millis(200)).await;
                                }
                            }
                        }
                    }
                }
                if let Err(e) = engine.stop() {
                    tracing::warn!(error = %e, "fusion engine stop failed to flush incident store");
                }
            }))
        }
        Err(_) => {
            tracing::info!("no [fusion] section configured, running bus server without embedded correlation");
            None
        }
    };

    tracing::info!(addr = %listen_addr, "bus server listening");

    let grpc_shutdown = shutdown.clone();
    let grpc_result = Server::builder()
        .tls_config(tls)
        .wrap_err("configuring server TLS")?
        .timeout(publish_deadline)
        .add_service(EventBusServer::new(service))
        .serve_with_shutdown(listen_addr, async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown requested, draining embedded fusion task and observability surface");
            grpc_shutdown.cancel();
        })
        .await;

    if let Some(task) = fusion_task {
        let _ = task.await;
    }
    let _ = observability_task.await;

    grpc_result.wrap_err("bus server terminated")?;
    Ok(())
}
