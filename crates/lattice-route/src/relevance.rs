//! Whether a route belongs to this controller
//!
//! A route is ours when its first parent Gateway resolves and the Gateway's
//! class names our controller. Routes that are not ours get no side effects.

use tracing::debug;

use lattice_common::crd::HttpRoute;
use lattice_common::{Error, NamespacedName};

use crate::client::ObjectStore;

/// Resolve the route's parent Gateway and GatewayClass and compare the class
/// controller name with `controller_name`
///
/// Missing objects make the route irrelevant rather than failing; the
/// Gateway watch re-enqueues the route once they appear.
pub async fn is_route_relevant(
    objects: &dyn ObjectStore,
    route: &HttpRoute,
    controller_name: &str,
) -> Result<bool, Error> {
    let id = NamespacedName::of(route);
    let Some(parent) = route.primary_parent() else {
        debug!(route = %id, "route has no parent reference");
        return Ok(false);
    };

    let gateway_ns = parent.namespace_or(&id.namespace);
    let Some(gateway) = objects.get_gateway(&parent.name, gateway_ns).await? else {
        debug!(route = %id, gateway = %parent.name, "parent gateway not found");
        return Ok(false);
    };

    let class_name = &gateway.spec.gateway_class_name;
    let Some(class) = objects.get_gateway_class(class_name).await? else {
        debug!(route = %id, gateway_class = %class_name, "gateway class not found");
        return Ok(false);
    };

    Ok(class.spec.controller_name == controller_name)
}
