//! Command-line and environment configuration

use std::time::Duration;

use clap::{Args, Parser};

use lattice_common::telemetry::LogFormat;
use lattice_common::DEFAULT_CONTROLLER_NAME;
use lattice_route::controller::{
    DEFAULT_FATAL_BACKOFF, DEFAULT_RECONCILE_TIMEOUT, DEFAULT_RESYNC_INTERVAL,
    DEFAULT_RETRY_BACKOFF,
};
use lattice_route::deploy::DEFAULT_CALL_TIMEOUT;
use lattice_route::{ControllerConfig, DeployerConfig};

/// Default number of routes reconciled concurrently
pub const DEFAULT_CONCURRENCY: u16 = 8;

/// Lattice gateway controller - reconciles Gateway API HTTPRoutes into VPC Lattice
#[derive(Parser, Debug)]
#[command(name = "lattice-gateway-controller", version, about, long_about = None)]
pub struct Cli {
    /// Print the Gateway API and MCS CRDs the controller consumes and exit
    #[arg(long)]
    pub crd: bool,

    /// Controller settings
    #[command(flatten)]
    pub controller: ControllerArgs,
}

/// Controller settings
#[derive(Args, Debug, Clone)]
pub struct ControllerArgs {
    /// Controller name matched against GatewayClass.spec.controllerName
    #[arg(long, env = "LATTICE_CONTROLLER_NAME", default_value = DEFAULT_CONTROLLER_NAME)]
    pub controller_name: String,

    /// Maximum number of routes reconciled at once
    #[arg(long, env = "LATTICE_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: u16,

    /// Requeue delay after a retryable failure, in seconds
    #[arg(
        long,
        env = "LATTICE_RETRY_BACKOFF_SECS",
        default_value_t = DEFAULT_RETRY_BACKOFF.as_secs()
    )]
    pub retry_backoff_secs: u64,

    /// Requeue delay after a fatal failure, in seconds
    #[arg(
        long,
        env = "LATTICE_FATAL_BACKOFF_SECS",
        default_value_t = DEFAULT_FATAL_BACKOFF.as_secs()
    )]
    pub fatal_backoff_secs: u64,

    /// Requeue delay after a successful reconcile, in seconds
    #[arg(long, env = "LATTICE_RESYNC_SECS", default_value_t = DEFAULT_RESYNC_INTERVAL.as_secs())]
    pub resync_secs: u64,

    /// Upper bound on one deploy, in seconds
    #[arg(
        long,
        env = "LATTICE_RECONCILE_TIMEOUT_SECS",
        default_value_t = DEFAULT_RECONCILE_TIMEOUT.as_secs()
    )]
    pub reconcile_timeout_secs: u64,

    /// Timeout of a single cloud call, in seconds
    #[arg(
        long,
        env = "LATTICE_CALL_TIMEOUT_SECS",
        default_value_t = DEFAULT_CALL_TIMEOUT.as_secs()
    )]
    pub call_timeout_secs: u64,

    /// Log output format (json or text)
    #[arg(long, env = "LATTICE_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,
}

impl ControllerArgs {
    /// Controller settings for the route context
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            controller_name: self.controller_name.clone(),
            retry_backoff: Duration::from_secs(self.retry_backoff_secs),
            fatal_backoff: Duration::from_secs(self.fatal_backoff_secs),
            resync_interval: Duration::from_secs(self.resync_secs),
            reconcile_timeout: Duration::from_secs(self.reconcile_timeout_secs),
        }
    }

    /// Deployer settings
    pub fn deployer_config(&self) -> DeployerConfig {
        DeployerConfig {
            call_timeout: Duration::from_secs(self.call_timeout_secs),
        }
    }
}
