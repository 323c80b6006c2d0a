//! Status projection
//!
//! After a successful deploy the route gets the assigned DNS name as an
//! annotation and an `Accepted` condition in its status. The desired status is
//! computed by [`desired_route_status`]; the projector diffs it against what
//! the route already carries and only patches what changed.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::debug;

use lattice_common::crd::{
    Condition, ConditionStatus, HttpRoute, HttpRouteStatus, RouteParentStatus,
};
use lattice_common::{Error, NamespacedName};

use crate::client::RouteStatusWriter;

/// Annotation carrying the DNS name assigned to the route's service
pub const LATTICE_ASSIGNED_DOMAIN_NAME: &str =
    "application-networking.k8s.aws/lattice-assigned-domain-name";

/// Condition type and reason written on success
pub const ACCEPTED: &str = "Accepted";

/// Status the route should carry once its service is reachable at `dns`
///
/// Our parent entry comes first; entries written by other controllers are
/// kept as they are. The `Accepted` transition time is carried over from the
/// observed condition unless its status changed or it was never set.
pub fn desired_route_status(
    route: &HttpRoute,
    controller_name: &str,
    dns: &str,
    now: DateTime<Utc>,
) -> HttpRouteStatus {
    let observed = route.status.as_ref();
    let ours = observed
        .and_then(|s| s.parents.iter().find(|p| p.controller_name == controller_name));
    let previous = ours.and_then(|p| p.conditions.iter().find(|c| c.type_ == ACCEPTED));

    let accepted = Condition::new(
        ACCEPTED,
        ConditionStatus::True,
        ACCEPTED,
        format!("DNS Name: {dns}"),
    )
    .observed_generation(route.metadata.generation)
    .latch_transition_time(previous, now);

    let mut conditions: Vec<Condition> = ours
        .map(|p| p.conditions.iter().filter(|c| c.type_ != ACCEPTED).cloned().collect())
        .unwrap_or_default();
    conditions.insert(0, accepted);

    let mut parents = vec![RouteParentStatus {
        parent_ref: route.primary_parent().cloned().unwrap_or_default(),
        controller_name: controller_name.to_string(),
        conditions,
    }];
    parents.extend(
        observed
            .into_iter()
            .flat_map(|s| s.parents.iter())
            .filter(|p| p.controller_name != controller_name)
            .cloned(),
    );

    HttpRouteStatus { parents }
}

/// What [`StatusProjector::project`] wrote
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProjectOutcome {
    /// The DNS annotation was patched
    pub annotation_patched: bool,
    /// The status was patched
    pub status_patched: bool,
}

/// Writes deploy results back onto routes
pub struct StatusProjector {
    writer: Arc<dyn RouteStatusWriter>,
    controller_name: String,
}

impl StatusProjector {
    /// Create a projector writing status entries as `controller_name`
    pub fn new(writer: Arc<dyn RouteStatusWriter>, controller_name: impl Into<String>) -> Self {
        Self {
            writer,
            controller_name: controller_name.into(),
        }
    }

    /// Project `dns` onto `route`, patching only what differs
    pub async fn project(&self, route: &HttpRoute, dns: &str) -> Result<ProjectOutcome, Error> {
        let id = NamespacedName::of(route);
        let mut outcome = ProjectOutcome::default();

        let current = route.annotations().get(LATTICE_ASSIGNED_DOMAIN_NAME);
        if current.map(String::as_str) != Some(dns) {
            let annotations =
                BTreeMap::from([(LATTICE_ASSIGNED_DOMAIN_NAME.to_string(), dns.to_string())]);
            self.writer
                .patch_route_annotations(&id.name, &id.namespace, annotations)
                .await?;
            outcome.annotation_patched = true;
        }

        let desired = desired_route_status(route, &self.controller_name, dns, Utc::now());
        if route.status.as_ref() != Some(&desired) {
            self.writer
                .patch_route_status(&id.name, &id.namespace, &desired)
                .await?;
            outcome.status_patched = true;
        }

        debug!(route = %id, dns, ?outcome, "projected status");
        Ok(outcome)
    }
}
