//! main.rs — TDOA receiver-node service
//!
//! Wires the pipeline together:
//!   1. Time base disciplined from GPS (PPS + fixes via a device adapter)
//!   2. Time-reference protocol over UDP (reference/status broadcasts, alerts)
//!   3. Processing fabric (worker pool + resource pool) carrying I/Q segments
//!   4. Time-difference extractor feeding the multilateration solver
//!
//! I/Q segments enter through the signal-source adapters of the deployment;
//! everything downstream of `PipelineContext` is wired here.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use tdoa_node::config::NodeConfig;
use tdoa_node::extractor::TimeDifferenceExtractor;
use tdoa_node::protocol::TimeReferenceProtocol;
use tdoa_node::solver::MultilaterationSolver;
use tdoa_node::time_base::TimeBase;
use tdoa_node::transport::UdpTransport;
use tdoa_node::{gps, PipelineContext};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "tdoa-node", about = "TDOA geolocation receiver node")]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// Node id on the time-reference protocol (overrides config)
    #[arg(long)]
    node_id: Option<String>,
    /// Local UDP port (overrides config)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tdoa_node=info".into()),
        )
        .init();

    let args = Args::parse();

    let config_text = std::fs::read_to_string(&args.config)
        .unwrap_or_else(|_| include_str!("../config.toml").to_string());
    let mut node_config = NodeConfig::from_toml(&config_text).context("loading configuration")?;
    if let Some(node_id) = args.node_id {
        node_config.protocol.node_id = node_id;
    }
    if let Some(port) = args.port {
        node_config.protocol.port = port;
    }
    let node_id = if node_config.protocol.node_id.is_empty() {
        format!("tdoa-{}", uuid::Uuid::new_v4().simple())
    } else {
        node_config.protocol.node_id.clone()
    };

    info!("starting TDOA node '{node_id}'");

    // Fabric: worker pool + resource accounting
    let context = PipelineContext::new(&node_config).context("building pipeline context")?;

    // Time base; PPS/fix feeds attach through the configured GPS adapter
    let gps_kind = gps::GpsDeviceKind::parse(&node_config.time_base.gps_device)
        .context("selecting GPS adapter")?;
    info!("GPS adapter: {gps_kind:?} at {}", node_config.time_base.gps_path);
    let (time_base, sync_events) = TimeBase::new(node_config.time_base_config());
    time_base.initialize(0.0);
    time_base.start();
    let _monitor = time_base.spawn_monitor();

    // Time-reference protocol over UDP
    let (transport, incoming) = UdpTransport::bind(node_id.clone(), node_config.transport_config())
        .await
        .context("binding protocol transport")?;
    let (protocol, mut alerts) =
        TimeReferenceProtocol::new(time_base.clone(), transport, node_config.protocol_config());
    protocol.start(incoming);

    // Measurement chain: extractor events drive the solver
    let (extractor, diff_events) = TimeDifferenceExtractor::new(node_config.extractor_config());
    let extractor = Arc::new(extractor);
    let solver = MultilaterationSolver::new(node_config.solver_config());
    {
        let extractor = extractor.clone();
        tokio::task::spawn_blocking(move || {
            while let Ok(set) = diff_events.recv() {
                let fix = solver.solve(&set, &extractor.sources());
                if fix.valid {
                    info!(
                        "position fix ({:.1}, {:.1}) m, gdop {:.1}, confidence {:.2}",
                        fix.position.x, fix.position.y, fix.gdop.gdop, fix.position.confidence
                    );
                } else {
                    warn!("no position fix: {}", fix.diagnostic);
                }
            }
        });
    }

    // Surface sync events and peer alerts
    tokio::task::spawn_blocking(move || {
        while let Ok(event) = sync_events.recv() {
            info!("sync event: {}", event.message);
        }
    });
    tokio::spawn(async move {
        while let Some(alert) = alerts.recv().await {
            warn!("peer alert: {}", alert.message);
        }
    });

    // Periodic health log
    let stats_protocol = protocol.clone();
    let stats_base = time_base.clone();
    let stats_pool = context.resources.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            let sync = stats_base.statistics();
            let proto = stats_protocol.statistics();
            info!(
                "health: status={:?} drift={:.1}ppb adev={:.2e} peers={} sent={} recv={} pending-resources={}",
                stats_base.status(),
                sync.drift_ppb,
                sync.allan_deviation,
                stats_protocol.peers().len(),
                proto.messages_sent,
                proto.messages_received,
                stats_pool.pending_count(),
            );
        }
    });

    info!(
        "pipeline ready: {} workers, queue {} ({})",
        context.engine.worker_count(),
        node_config.engine.max_queue_size,
        node_config.engine.backpressure
    );

    // Run until interrupted
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutting down");
    protocol.stop();
    Ok(())
}
