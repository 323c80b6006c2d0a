//! Controller runner - builds the HTTPRoute controller future
//!
//! The controller watches HTTPRoutes directly and re-enqueues them when a
//! Gateway, Service, ServiceImport or Endpoints they reference changes.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::runtime::controller::Config as ControllerSettings;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;

use lattice_common::crd::{Gateway, HttpRoute, ServiceImport};
use lattice_route::watch::{impacted_routes, WatchEvent};
use lattice_route::{error_policy, reconcile, RouteContext};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build the HTTPRoute controller future
pub fn build_route_controller(
    client: Client,
    ctx: Arc<RouteContext>,
    concurrency: u16,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let routes: Api<HttpRoute> = Api::all(client.clone());
    let gateways: Api<Gateway> = Api::all(client.clone());
    let services: Api<Service> = Api::all(client.clone());
    let imports: Api<ServiceImport> = Api::all(client.clone());
    let endpoints: Api<Endpoints> = Api::all(client);

    let controller = Controller::new(routes, watcher_config())
        .with_config(ControllerSettings::default().concurrency(concurrency));
    let store = controller.store();

    tracing::info!(concurrency, "- HTTPRoute controller");

    Box::pin(
        controller
            .watches(gateways, watcher_config(), fan_out(store.clone(), WatchEvent::Gateway))
            .watches(services, watcher_config(), fan_out(store.clone(), WatchEvent::Service))
            .watches(
                imports,
                watcher_config(),
                fan_out(store.clone(), WatchEvent::ServiceImport),
            )
            .watches(endpoints, watcher_config(), fan_out(store, WatchEvent::Endpoints))
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("HTTPRoute")),
    )
}

/// Map a changed object onto the cached routes that reference it
fn fan_out<K>(
    routes: Store<HttpRoute>,
    wrap: fn(Arc<K>) -> WatchEvent,
) -> impl Fn(K) -> Vec<ObjectRef<HttpRoute>> + Send + Sync + 'static
where
    K: 'static,
{
    move |obj| impacted_routes(&wrap(Arc::new(obj)), &routes.state())
}

/// Cancel `token` on SIGINT or SIGTERM so in-flight deploys stop issuing calls
pub fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received, cancelling in-flight deploys");
        token.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
