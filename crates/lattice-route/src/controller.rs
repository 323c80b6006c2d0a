//! HTTPRoute controller
//!
//! Drives Build → Deploy → Project for every route managed by this
//! controller and the cleanup path for deleted ones. Errors are classified by
//! [`ErrorClass`] and mapped onto requeue actions in [`error_policy`].

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Client, Resource};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use lattice_common::crd::{ConditionStatus, HttpRoute};
use lattice_common::events::{
    actions, reasons, ControllerEvent, EventPublisher, KubeEventPublisher,
};
use lattice_common::kube_utils::{has_finalizer, is_deleting};
use lattice_common::{Error, ErrorClass, NamespacedName, DEFAULT_CONTROLLER_NAME, FIELD_MANAGER};

use crate::builder::ModelBuilder;
use crate::client::{KubeRouteClient, ObjectStore, RouteStatusWriter};
use crate::deploy::cloud::LatticeCloud;
use crate::deploy::{DeployReport, DeployerConfig, StackDeployer};
use crate::model::{Stack, StackId};
use crate::relevance::is_route_relevant;
use crate::status::{StatusProjector, ACCEPTED};
use crate::store::LatticeDataStore;

/// Finalizer guarding the cloud resources of a route
pub const HTTP_ROUTE_FINALIZER: &str = "httproute.k8s.aws/resources";

/// Requeue delay after a retryable failure
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(20);

/// Requeue delay after a fatal or internal failure
pub const DEFAULT_FATAL_BACKOFF: Duration = Duration::from_secs(300);

/// Requeue delay after a successful reconcile
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(600);

/// Upper bound on one deploy
pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(300);

// =============================================================================
// Configuration and context
// =============================================================================

/// Controller settings
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Controller name matched against `GatewayClass.spec.controllerName`
    pub controller_name: String,
    /// Requeue delay after a retryable failure
    pub retry_backoff: Duration,
    /// Requeue delay after a fatal or internal failure
    pub fatal_backoff: Duration,
    /// Requeue delay after success
    pub resync_interval: Duration,
    /// Upper bound on one deploy; expiry is retryable
    pub reconcile_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            controller_name: DEFAULT_CONTROLLER_NAME.to_string(),
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            fatal_backoff: DEFAULT_FATAL_BACKOFF,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
        }
    }
}

/// Shared state of all route reconciliations
pub struct RouteContext {
    /// Reads declared objects
    pub objects: Arc<dyn ObjectStore>,
    /// Writes finalizers back onto routes
    pub writer: Arc<dyn RouteStatusWriter>,
    /// Cloud state shared across routes
    pub store: Arc<LatticeDataStore>,
    /// Route → stack
    pub builder: ModelBuilder,
    /// Stack → cloud
    pub deployer: StackDeployer,
    /// Deploy result → route status
    pub projector: StatusProjector,
    /// Kubernetes Events sink
    pub events: Arc<dyn EventPublisher>,
    /// Controller settings
    pub config: ControllerConfig,
    /// Cancelled on shutdown; every deploy runs under a child token
    pub shutdown: CancellationToken,
}

impl RouteContext {
    /// Wire a context from its seams
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        writer: Arc<dyn RouteStatusWriter>,
        cloud: Arc<dyn LatticeCloud>,
        events: Arc<dyn EventPublisher>,
        config: ControllerConfig,
        deployer_config: DeployerConfig,
    ) -> Self {
        let store = Arc::new(LatticeDataStore::new());
        Self {
            builder: ModelBuilder::new(objects.clone()),
            deployer: StackDeployer::new(cloud, store.clone(), deployer_config),
            projector: StatusProjector::new(writer.clone(), config.controller_name.clone()),
            objects,
            writer,
            store,
            events,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Context backed by the API server
    pub fn from_client(
        client: Client,
        cloud: Arc<dyn LatticeCloud>,
        config: ControllerConfig,
        deployer_config: DeployerConfig,
    ) -> Self {
        let kube = Arc::new(KubeRouteClient::new(client.clone()));
        let events = Arc::new(KubeEventPublisher::new(client, FIELD_MANAGER));
        Self::new(kube.clone(), kube, cloud, events, config, deployer_config)
    }

    /// Context with default settings for unit tests
    #[cfg(test)]
    pub fn for_testing(
        objects: Arc<dyn ObjectStore>,
        writer: Arc<dyn RouteStatusWriter>,
        cloud: Arc<dyn LatticeCloud>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self::new(
            objects,
            writer,
            cloud,
            events,
            ControllerConfig::default(),
            DeployerConfig::default(),
        )
    }
}

// =============================================================================
// Route lifecycle
// =============================================================================

/// Where a route is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutePhase {
    /// Not yet claimed: no finalizer
    Pending,
    /// Claimed, current generation not yet accepted
    Reconciling,
    /// Current generation accepted
    Ready,
    /// Marked for deletion, cloud resources not yet removed
    Deleting,
    /// Marked for deletion and released
    Deleted,
}

/// Derive the phase of a route from its finalizers, deletion timestamp and
/// status
pub fn route_phase(route: &HttpRoute, controller_name: &str) -> RoutePhase {
    let claimed = has_finalizer(route, HTTP_ROUTE_FINALIZER);
    if is_deleting(route) {
        return if claimed {
            RoutePhase::Deleting
        } else {
            RoutePhase::Deleted
        };
    }
    if !claimed {
        return RoutePhase::Pending;
    }

    let generation = route.metadata.generation;
    let accepted = route
        .status
        .iter()
        .flat_map(|s| s.parents.iter())
        .filter(|p| p.controller_name == controller_name)
        .flat_map(|p| p.conditions.iter())
        .any(|c| {
            c.type_ == ACCEPTED
                && c.status == ConditionStatus::True
                && c.observed_generation == generation
        });
    if accepted {
        RoutePhase::Ready
    } else {
        RoutePhase::Reconciling
    }
}

// =============================================================================
// Reconcile
// =============================================================================

/// Reconcile one route
#[instrument(skip(route, ctx), fields(route = %NamespacedName::of(route.as_ref())))]
pub async fn reconcile(route: Arc<HttpRoute>, ctx: Arc<RouteContext>) -> Result<Action, Error> {
    let id = NamespacedName::of(route.as_ref());
    let phase = route_phase(&route, &ctx.config.controller_name);
    debug!(?phase, "reconciling route");

    match phase {
        RoutePhase::Deleted => return Ok(Action::await_change()),
        // Cleanup runs even if the route stopped being ours while we still
        // hold its finalizer.
        RoutePhase::Deleting => return cleanup_route(&route, &id, &ctx).await,
        RoutePhase::Pending | RoutePhase::Reconciling | RoutePhase::Ready => {}
    }

    if !is_route_relevant(ctx.objects.as_ref(), &route, &ctx.config.controller_name).await? {
        debug!("route is not managed by this controller");
        return Ok(Action::await_change());
    }

    let obj_ref = route.object_ref(&());
    ctx.events
        .publish(
            &obj_ref,
            ControllerEvent::normal(
                reasons::RECONCILE,
                actions::RECONCILE,
                "Adding/Updating Reconcile",
            ),
        )
        .await;

    if phase == RoutePhase::Pending {
        if let Err(e) = ctx
            .writer
            .add_route_finalizer(&id.name, &id.namespace, HTTP_ROUTE_FINALIZER)
            .await
        {
            warn!(error = %e, "failed to add finalizer, continuing");
            ctx.events
                .publish(
                    &obj_ref,
                    ControllerEvent::warning(
                        reasons::FAILED_ADD_FINALIZER,
                        actions::RECONCILE,
                        format!("Failed to add finalizer: {e}"),
                    ),
                )
                .await;
        }
    }

    let stack = match ctx.builder.build(&route).await {
        Ok((stack, _)) => stack,
        Err(e) => {
            if e.class() != ErrorClass::NotReady {
                ctx.events
                    .publish(
                        &obj_ref,
                        ControllerEvent::warning(
                            reasons::FAILED_BUILD_MODEL,
                            actions::BUILD,
                            format!("Failed to build model: {e}"),
                        ),
                    )
                    .await;
            }
            return Err(e);
        }
    };
    log_stack(&stack);

    let report = match deploy(&stack, &ctx).await {
        Ok(report) => report,
        Err(e) => {
            let event = if e.is_retryable() {
                ControllerEvent::normal(
                    reasons::RETRY_RECONCILE,
                    actions::DEPLOY,
                    format!("Retry Reconcile: {e}"),
                )
            } else {
                ControllerEvent::warning(
                    reasons::FAILED_DEPLOY_MODEL,
                    actions::DEPLOY,
                    format!("Failed to deploy model: {e}"),
                )
            };
            ctx.events.publish(&obj_ref, event).await;
            return Err(e);
        }
    };

    ctx.events
        .publish(
            &obj_ref,
            ControllerEvent::normal(
                reasons::DEPLOY_SUCCEED,
                actions::DEPLOY,
                "Adding/Updating reconcile Done!",
            ),
        )
        .await;

    let dns = report
        .service_dns
        .or_else(|| ctx.store.get_service(stack.id()).map(|s| s.dns))
        .ok_or_else(|| {
            Error::internal_with_context("reconcile", "deployed service has no DNS name")
        })?;
    ctx.projector.project(&route, &dns).await?;

    info!(dns = %dns, "route reconciled");
    Ok(Action::requeue(ctx.config.resync_interval))
}

/// Remove the route's cloud resources, then release the finalizer
///
/// The finalizer stays when cleanup fails so the next attempt still sees the
/// route.
async fn cleanup_route(
    route: &HttpRoute,
    id: &NamespacedName,
    ctx: &RouteContext,
) -> Result<Action, Error> {
    let obj_ref = route.object_ref(&());
    ctx.events
        .publish(
            &obj_ref,
            ControllerEvent::normal(reasons::RECONCILE, actions::DELETE, "Deleting Reconcile"),
        )
        .await;

    let (stack, _) = ctx.builder.build(route).await?;
    log_stack(&stack);

    if let Err(e) = deploy(&stack, ctx).await {
        let note = format!("Failed to clean up model: {e}");
        let event = if e.is_retryable() {
            ControllerEvent::normal(reasons::FAILED_DEPLOY_MODEL, actions::DELETE, note)
        } else {
            ControllerEvent::warning(reasons::FAILED_DEPLOY_MODEL, actions::DELETE, note)
        };
        ctx.events.publish(&obj_ref, event).await;
        return Err(e);
    }

    if let Err(e) = ctx
        .writer
        .remove_route_finalizer(&id.name, &id.namespace, HTTP_ROUTE_FINALIZER)
        .await
    {
        ctx.events
            .publish(
                &obj_ref,
                ControllerEvent::warning(
                    reasons::FAILED_REMOVE_FINALIZER,
                    actions::DELETE,
                    format!("Failed to remove finalizer: {e}"),
                ),
            )
            .await;
        return Err(e);
    }

    info!("route resources cleaned up");
    Ok(Action::await_change())
}

/// Deploy under a child of the shutdown token and the reconcile timeout
async fn deploy(stack: &Stack, ctx: &RouteContext) -> Result<DeployReport, Error> {
    let cancel = ctx.shutdown.child_token();
    let timeout = ctx.config.reconcile_timeout;
    match tokio::time::timeout(timeout, ctx.deployer.deploy(stack, &cancel)).await {
        Ok(result) => result,
        Err(_) => {
            cancel.cancel();
            Err(Error::retryable_cloud(
                "reconcile",
                format!("deploy did not finish within {}s", timeout.as_secs()),
            ))
        }
    }
}

fn log_stack(stack: &Stack) {
    match stack.to_json() {
        Ok(json) => debug!(stack = %json, "stack"),
        Err(e) => warn!(error = %e, "failed to marshal stack"),
    }
}

/// Map a reconcile error onto a requeue action
pub fn error_policy(route: Arc<HttpRoute>, error: &Error, ctx: Arc<RouteContext>) -> Action {
    let id = StackId::from(NamespacedName::of(route.as_ref()));
    match error.class() {
        ErrorClass::NotReady => {
            info!(route = %id, %error, "route dependencies not ready");
            Action::await_change()
        }
        ErrorClass::Validation => {
            warn!(route = %id, %error, "route is invalid");
            Action::await_change()
        }
        ErrorClass::Retryable => {
            warn!(route = %id, %error, retryable = true, "reconciliation failed");
            Action::requeue(ctx.config.retry_backoff)
        }
        ErrorClass::Fatal | ErrorClass::Internal => {
            error!(?error, route = %id, retryable = false, "reconciliation failed");
            Action::requeue(ctx.config.fatal_backoff)
        }
    }
}
