// AEGIS - Autonomous incident-response platform.
//
// Binary entry point: loads configuration, assembles the platform with
// the configured collaborator adapters, starts the agent fleet, the
// consensus engine, the meta-health monitor, and the control API, then
// runs until a shutdown signal arrives.
//
// This build wires the in-process adapters (in-memory event sink, static
// model invoker, keyword vector memory, mock executor backend); real
// deployments substitute provider adapters behind the same trait
// boundaries.

use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::{error, info};

use aegis_agents::{
    ChannelTelemetrySource, DependencyGraph, RecordingChannel, StaticModelInvoker,
    StaticVectorMemory,
};
use aegis_api::ControlApi;
use aegis_core::{AegisConfig, AegisPlatform, PlatformDeps};
use aegis_events::MemoryEventSink;
use aegis_executor::MockExecutorBackend;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("aegis=info".parse()?),
        )
        .json()
        .init();

    info!("starting AEGIS incident-response platform");

    let config = AegisConfig::load().await?;

    let mut memory = StaticVectorMemory::new();
    memory.insert(
        "seed-db-cascade",
        "database connection pool exhaustion cascading into downstream timeouts",
        serde_json::json!({ "cascaded": true, "resolution": "kill_query,scale_pool" }),
    );
    memory.insert(
        "seed-deploy-regression",
        "bad deploy raising error rates until rollback",
        serde_json::json!({ "cascaded": false, "resolution": "rollback_deploy" }),
    );

    let mut topology = DependencyGraph::new();
    topology.add_dependency("api-gateway", "order-service");
    topology.add_dependency("order-service", "db-primary");
    topology.add_dependency("db-proxy", "db-primary");
    topology.add_dependency("db-primary", "storage-volume");

    // The sender side stays alive for the life of the process; demo
    // scenarios and future adapters push batches through it.
    let (telemetry_tx, telemetry) = ChannelTelemetrySource::new(config.ingest.queue_depth);

    let platform = match AegisPlatform::build(
        config.clone(),
        PlatformDeps {
            invoker: Arc::new(StaticModelInvoker::new(0.8)),
            memory: Arc::new(memory),
            sink: Arc::new(MemoryEventSink::new()),
            backend: Arc::new(MockExecutorBackend::new()),
            notifications: Arc::new(RecordingChannel::new()),
            telemetry: Arc::new(telemetry),
            topology,
        },
    ) {
        Ok(platform) => {
            info!("platform assembled");
            platform
        }
        Err(e) => {
            error!("failed to assemble platform: {}", e);
            return Err(e);
        }
    };

    platform.start();

    let api = ControlApi::new(config.api.clone(), platform.clone());
    api.start().await?;
    info!(
        address = %config.api.bind_address,
        port = config.api.port,
        "control API listening"
    );

    signal::ctrl_c().await?;
    info!("shutdown signal received");
    drop(telemetry_tx);
    platform.stop();
    info!("AEGIS stopped");
    Ok(())
}
