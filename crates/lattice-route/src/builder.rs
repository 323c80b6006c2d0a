//! Model builder: HTTPRoute → [`Stack`]
//!
//! Resolves the route's parent Gateway and backends through the
//! [`ObjectStore`] and produces the full resource graph for the route. The
//! builder never touches the cloud; a failure here aborts the reconcile
//! before anything is deployed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Endpoints, Service};
use tracing::{debug, instrument};

use lattice_common::crd::{
    GatewayListener, HttpBackendRef, HttpRoute, HttpRouteMatch, PathMatchType, TlsMode,
    SERVICE_IMPORT_KIND, SERVICE_KIND,
};
use lattice_common::kube_utils::is_deleting;
use lattice_common::{Error, NamespacedName};

use crate::client::ObjectStore;
use crate::model::{
    DefaultAction, HeaderMatch, HealthCheck, Listener, PathMatch, Protocol, Rule, RuleMatch,
    RuleTarget, ServiceResource, Stack, StackId, StackMode, Target, TargetGroup, TargetGroupKey,
    Targets,
};

/// Gateway listener TLS option carrying the certificate to terminate with
pub const AWS_CUSTOM_CERT_ARN_KEY: &str = "aws-custom-cert-arn";

/// Weight of a backend reference that does not set one
pub const DEFAULT_BACKEND_WEIGHT: u32 = 1;

/// Builds stacks from routes
pub struct ModelBuilder {
    objects: Arc<dyn ObjectStore>,
}

impl ModelBuilder {
    /// Create a builder reading declared objects from `objects`
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self { objects }
    }

    /// Build the stack for `route`
    ///
    /// A route with a deletion timestamp yields a cleanup stack holding the
    /// service and target group descriptors only; nothing is resolved for it.
    #[instrument(skip_all, fields(route = %NamespacedName::of(route)))]
    pub async fn build(&self, route: &HttpRoute) -> Result<(Stack, ServiceResource), Error> {
        let route_id = NamespacedName::of(route);

        if is_deleting(route) {
            return Ok(self.build_cleanup(route, &route_id));
        }

        let parent = route.primary_parent().ok_or_else(|| {
            Error::validation_for_field(
                route_id.to_string(),
                "spec.parentRefs",
                "no parent reference",
            )
        })?;
        let gateway_ns = parent.namespace_or(&route_id.namespace);
        let gateway = self
            .objects
            .get_gateway(&parent.name, gateway_ns)
            .await?
            .ok_or_else(|| {
                Error::not_ready(
                    route_id.to_string(),
                    format!("gateway {gateway_ns}/{} not found", parent.name),
                )
            })?;

        let default_ref = route
            .spec
            .rules
            .first()
            .and_then(|r| r.backend_refs.first())
            .ok_or_else(|| {
                Error::validation_for_field(
                    route_id.to_string(),
                    "spec.rules.backendRefs",
                    "no backend reference",
                )
            })?;
        let default_key = backend_key(&route_id, default_ref)?;

        let mut service = ServiceResource {
            name: route_id.name.clone(),
            namespace: route_id.namespace.clone(),
            service_network: parent.name.clone(),
            customer_cert_arn: None,
            hostnames: route.spec.hostnames.clone(),
        };

        let mut listeners = Vec::new();
        for gw_listener in gateway.listeners_for_section(parent.section_name.as_deref()) {
            let protocol = Protocol::from_gateway(&gw_listener.protocol).ok_or_else(|| {
                Error::validation_for_field(
                    route_id.to_string(),
                    "spec.listeners.protocol",
                    format!("unsupported listener protocol {}", gw_listener.protocol),
                )
            })?;
            if service.customer_cert_arn.is_none() {
                service.customer_cert_arn = custom_cert_arn(gw_listener);
            }
            listeners.push(Listener {
                name: route_id.name.clone(),
                namespace: route_id.namespace.clone(),
                port: gw_listener.port,
                protocol,
                default_action: DefaultAction {
                    backend_service_name: default_key.name.clone(),
                    backend_service_namespace: default_key.namespace.clone(),
                    backend_port: default_key.port,
                    is_import: default_key.is_import,
                },
            });
        }
        if listeners.is_empty() {
            return Err(Error::not_ready(
                route_id.to_string(),
                format!(
                    "gateway {gateway_ns}/{} has no listener for section {}",
                    parent.name,
                    parent.section_name.as_deref().unwrap_or("*")
                ),
            ));
        }

        let rules = build_rules(route, &route_id, &listeners)?;
        let (target_groups, targets) = self.build_target_groups(route, &route_id).await?;

        let mut stack = Stack::new(StackId::from(route_id.clone()), StackMode::Apply);
        for tg in target_groups {
            stack.add(tg);
        }
        for t in targets {
            stack.add(t);
        }
        stack.add(service.clone());
        for listener in listeners {
            stack.add(listener);
        }
        for rule in rules {
            stack.add(rule);
        }

        debug!(resources = stack.len(), "built stack");
        Ok((stack, service))
    }

    fn build_cleanup(
        &self,
        route: &HttpRoute,
        route_id: &NamespacedName,
    ) -> (Stack, ServiceResource) {
        let service = ServiceResource {
            name: route_id.name.clone(),
            namespace: route_id.namespace.clone(),
            service_network: route
                .primary_parent()
                .map(|p| p.name.clone())
                .unwrap_or_default(),
            customer_cert_arn: None,
            hostnames: route.spec.hostnames.clone(),
        };

        let mut stack = Stack::new(StackId::from(route_id.clone()), StackMode::Cleanup);
        // Backends with unsupported kinds never produced a target group.
        for key in route.backend_refs().filter_map(|b| backend_key(route_id, b).ok()) {
            let name = key.cloud_name();
            stack.add(target_group(key, name));
        }
        stack.add(service.clone());
        (stack, service)
    }

    async fn build_target_groups(
        &self,
        route: &HttpRoute,
        route_id: &NamespacedName,
    ) -> Result<(Vec<TargetGroup>, Vec<Targets>), Error> {
        let mut keys = BTreeSet::new();
        let mut target_groups = Vec::new();
        let mut targets = Vec::new();

        for backend in route.backend_refs() {
            let key = backend_key(route_id, backend)?;
            if !keys.insert(key.clone()) {
                continue;
            }

            if key.is_import {
                if self
                    .objects
                    .get_service_import(&key.name, &key.namespace)
                    .await?
                    .is_none()
                {
                    return Err(Error::not_ready(
                        route_id.to_string(),
                        format!("service import {}/{} not found", key.namespace, key.name),
                    ));
                }
            } else {
                targets.push(Targets {
                    target_group: key.clone(),
                    targets: self.resolve_targets(&key).await?,
                });
            }

            let name = key.cloud_name();
            target_groups.push(target_group(key, name));
        }
        Ok((target_groups, targets))
    }

    async fn resolve_targets(&self, key: &TargetGroupKey) -> Result<Vec<Target>, Error> {
        let Some(service) = self.objects.get_service(&key.name, &key.namespace).await? else {
            debug!(backend = %key, "backend service not found, no targets");
            return Ok(Vec::new());
        };
        let Some(endpoints) = self.objects.get_endpoints(&key.name, &key.namespace).await? else {
            debug!(backend = %key, "backend endpoints not found, no targets");
            return Ok(Vec::new());
        };
        Ok(endpoint_targets(&service, &endpoints, key.port))
    }
}

/// Identity of the target group a backend reference maps to
fn backend_key(
    route_id: &NamespacedName,
    backend: &HttpBackendRef,
) -> Result<TargetGroupKey, Error> {
    let is_import = match backend.kind_or_default() {
        SERVICE_KIND => false,
        SERVICE_IMPORT_KIND => true,
        other => {
            return Err(Error::validation_for_field(
                route_id.to_string(),
                "spec.rules.backendRefs.kind",
                format!("unsupported backend kind {other}"),
            ))
        }
    };
    Ok(TargetGroupKey {
        name: backend.name.clone(),
        namespace: backend.namespace_or(&route_id.namespace).to_string(),
        port: backend.port,
        is_import,
    })
}

fn target_group(key: TargetGroupKey, name: String) -> TargetGroup {
    TargetGroup {
        key,
        name,
        protocol: Protocol::Http,
        health_check: HealthCheck::default(),
    }
}

/// Certificate ARN configured on a TLS-terminating listener
///
/// Only the exact option key counts; anything else falls back to no
/// certificate.
fn custom_cert_arn(listener: &GatewayListener) -> Option<String> {
    let tls = listener.tls.as_ref()?;
    if tls.mode.unwrap_or(TlsMode::Terminate) != TlsMode::Terminate {
        return None;
    }
    tls.options.get(AWS_CUSTOM_CERT_ARN_KEY).cloned()
}

/// One rule per listener and route rule
///
/// The first route rule is served by the listener default action when it has
/// no matches and a single backend, so it gets no rule of its own.
fn build_rules(
    route: &HttpRoute,
    route_id: &NamespacedName,
    listeners: &[Listener],
) -> Result<Vec<Rule>, Error> {
    let mut rules = Vec::new();
    for (i, route_rule) in route.spec.rules.iter().enumerate() {
        if route_rule.backend_refs.is_empty() {
            continue;
        }
        if i == 0 && route_rule.matches.is_empty() && route_rule.backend_refs.len() == 1 {
            continue;
        }

        let targets = route_rule
            .backend_refs
            .iter()
            .map(|b| {
                backend_key(route_id, b).map(|target_group| RuleTarget {
                    target_group,
                    weight: b.weight.unwrap_or(DEFAULT_BACKEND_WEIGHT),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let matches = route_rule.matches.first().map(rule_match).unwrap_or_default();

        for listener in listeners {
            rules.push(Rule {
                service_name: route_id.name.clone(),
                service_namespace: route_id.namespace.clone(),
                listener_port: listener.port,
                listener_protocol: listener.protocol,
                name: format!("rule-{}", i + 1),
                priority: i as u32 + 1,
                matches: matches.clone(),
                targets: targets.clone(),
            });
        }
    }
    Ok(rules)
}

fn rule_match(m: &HttpRouteMatch) -> RuleMatch {
    RuleMatch {
        path: m.path.as_ref().map(|p| PathMatch {
            exact: p.type_ == PathMatchType::Exact,
            value: p.value.clone(),
        }),
        headers: m
            .headers
            .iter()
            .map(|h| HeaderMatch {
                name: h.name.clone(),
                value: h.value.clone(),
            })
            .collect(),
    }
}

/// Endpoint addresses serving `port` of `service`, sorted
///
/// Without a port the service's first port is used. The endpoint port is
/// matched on the service port's name, or taken as-is when the subset exposes
/// a single port.
fn endpoint_targets(service: &Service, endpoints: &Endpoints, port: Option<u16>) -> Vec<Target> {
    let service_ports = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_deref())
        .unwrap_or_default();
    let service_port = match port {
        Some(p) => service_ports.iter().find(|sp| sp.port == i32::from(p)),
        None => service_ports.first(),
    };
    let Some(service_port) = service_port else {
        return Vec::new();
    };
    let port_name = service_port.name.as_deref();

    let mut targets = BTreeSet::new();
    for subset in endpoints.subsets.iter().flatten() {
        let ports = subset.ports.as_deref().unwrap_or_default();
        let endpoint_port = ports
            .iter()
            .find(|p| p.name.as_deref() == port_name)
            .or_else(|| if ports.len() == 1 { ports.first() } else { None })
            .and_then(|p| u16::try_from(p.port).ok());
        let Some(endpoint_port) = endpoint_port else {
            continue;
        };
        for address in subset.addresses.iter().flatten() {
            targets.insert(Target {
                address: address.ip.clone(),
                port: endpoint_port,
            });
        }
    }
    targets.into_iter().collect()
}

/// `(namespace, name)` of every supported backend of a route, with its import
/// flag
pub(crate) fn backend_keys(route: &HttpRoute) -> BTreeMap<(String, String), bool> {
    let route_id = NamespacedName::of(route);
    route
        .backend_refs()
        .filter_map(|b| backend_key(&route_id, b).ok())
        .map(|k| ((k.namespace, k.name), k.is_import))
        .collect()
}
