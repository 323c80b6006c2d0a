//! Lattice gateway controller - reconciles Gateway API HTTPRoutes into VPC Lattice

use std::sync::Arc;

use clap::Parser;
use kube::CustomResourceExt;

use lattice_common::crd::{Gateway, GatewayClass, HttpRoute, ServiceImport};
use lattice_common::kube_utils::create_client;
use lattice_common::telemetry::{init_telemetry, TelemetryConfig};
use lattice_operator::config::{Cli, ControllerArgs};
use lattice_operator::controller_runner::{build_route_controller, cancel_on_signal};
use lattice_route::deploy::memory::MemoryCloud;
use lattice_route::RouteContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print_crds()?;
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "lattice-gateway-controller".to_string(),
        log_format: cli.controller.log_format,
    })?;

    run_controller(cli.controller).await
}

/// Print the CRDs this controller consumes as a multi-document YAML stream
fn print_crds() -> anyhow::Result<()> {
    let crds = [
        GatewayClass::crd(),
        Gateway::crd(),
        HttpRoute::crd(),
        ServiceImport::crd(),
    ];
    for crd in crds {
        let yaml = serde_yaml::to_string(&crd)
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("---\n{yaml}");
    }
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = create_client()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    // No remote control plane client is wired in; the controller converges an
    // in-process cloud.
    tracing::info!("using in-process Lattice cloud");
    let cloud = Arc::new(MemoryCloud::new());

    let ctx = Arc::new(RouteContext::from_client(
        client.clone(),
        cloud,
        args.controller_config(),
        args.deployer_config(),
    ));
    cancel_on_signal(ctx.shutdown.clone());

    tracing::info!(
        controller_name = %args.controller_name,
        "Starting Lattice gateway controller..."
    );
    build_route_controller(client, ctx, args.concurrency).await;

    tracing::info!("Lattice gateway controller shut down");
    Ok(())
}
