//! Watch fan-out
//!
//! Changes to objects a route depends on re-enqueue every route that
//! references them. The controller runner wraps each watched object in a
//! [`WatchEvent`] and maps it through [`impacted_routes`].

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use tracing::debug;

use lattice_common::crd::{Gateway, HttpRoute, ServiceImport};
use lattice_common::NamespacedName;

use crate::builder::backend_keys;

/// A change to an object routes depend on
#[derive(Clone, Debug)]
pub enum WatchEvent {
    /// A parent Gateway changed
    Gateway(Arc<Gateway>),
    /// A backend Service changed
    Service(Arc<Service>),
    /// A backend ServiceImport changed
    ServiceImport(Arc<ServiceImport>),
    /// The Endpoints of a backend Service changed
    Endpoints(Arc<Endpoints>),
}

impl WatchEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Gateway(_) => "Gateway",
            Self::Service(_) => "Service",
            Self::ServiceImport(_) => "ServiceImport",
            Self::Endpoints(_) => "Endpoints",
        }
    }

    fn object_id(&self) -> NamespacedName {
        match self {
            Self::Gateway(o) => NamespacedName::of(o.as_ref()),
            Self::Service(o) => NamespacedName::of(o.as_ref()),
            Self::ServiceImport(o) => NamespacedName::of(o.as_ref()),
            Self::Endpoints(o) => NamespacedName::of(o.as_ref()),
        }
    }
}

/// Routes to re-reconcile after `event`
pub fn impacted_routes(event: &WatchEvent, routes: &[Arc<HttpRoute>]) -> Vec<ObjectRef<HttpRoute>> {
    let object = event.object_id();
    let impacted: Vec<ObjectRef<HttpRoute>> = routes
        .iter()
        .filter(|route| match event {
            WatchEvent::Gateway(_) => references_gateway(route, &object),
            WatchEvent::Service(_) | WatchEvent::Endpoints(_) => {
                references_backend(route, &object, false)
            }
            WatchEvent::ServiceImport(_) => references_backend(route, &object, true),
        })
        .map(|route| ObjectRef::from_obj(route.as_ref()))
        .collect();

    if !impacted.is_empty() {
        debug!(
            kind = event.kind(),
            object = %object,
            count = impacted.len(),
            "enqueueing routes for changed object"
        );
    }
    impacted
}

fn references_gateway(route: &HttpRoute, gateway: &NamespacedName) -> bool {
    let route_ns = route.namespace().unwrap_or_else(|| "default".to_string());
    route.primary_parent().is_some_and(|p| {
        p.name == gateway.name && p.namespace_or(&route_ns) == gateway.namespace
    })
}

fn references_backend(route: &HttpRoute, backend: &NamespacedName, is_import: bool) -> bool {
    backend_keys(route)
        .get(&(backend.namespace.clone(), backend.name.clone()))
        .is_some_and(|&import| import == is_import)
}
