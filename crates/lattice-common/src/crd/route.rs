//! Gateway API `HTTPRoute` types

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// Backend kind for a plain Kubernetes Service (the Gateway API default)
pub const SERVICE_KIND: &str = "Service";

/// Backend kind for a multi-cluster ServiceImport
pub const SERVICE_IMPORT_KIND: &str = "ServiceImport";

/// Declared HTTP routing rules bound to parent Gateways
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gateway.networking.k8s.io",
    version = "v1beta1",
    kind = "HTTPRoute",
    root = "HttpRoute",
    plural = "httproutes",
    namespaced,
    status = "HttpRouteStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteSpec {
    /// Gateways this route attaches to. Only the first is honoured.
    #[serde(default)]
    pub parent_refs: Vec<ParentReference>,

    /// Hostnames matched against the HTTP Host header
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hostnames: Vec<String>,

    /// Routing rules
    #[serde(default)]
    pub rules: Vec<HttpRouteRule>,
}

/// Reference from a route to its parent Gateway
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ParentReference {
    /// API group of the parent (defaults to gateway.networking.k8s.io)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// Kind of the parent (defaults to Gateway)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Namespace of the parent; defaults to the route namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Name of the parent
    pub name: String,

    /// Listener name on the parent Gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_name: Option<String>,

    /// Listener port on the parent Gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// A single routing rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteRule {
    /// Request matches; empty matches everything
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<HttpRouteMatch>,

    /// Backends receiving matched traffic
    #[serde(default)]
    pub backend_refs: Vec<HttpBackendRef>,
}

/// Request match criteria
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteMatch {
    /// Path match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<HttpPathMatch>,

    /// Header matches, all of which must hold
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HttpHeaderMatch>,
}

/// Path match type
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PathMatchType {
    /// Exact path
    Exact,
    /// Path prefix
    #[default]
    PathPrefix,
}

/// Path match
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HttpPathMatch {
    /// How `value` is compared
    #[serde(default, rename = "type")]
    pub type_: PathMatchType,

    /// Path value
    #[serde(default = "default_path")]
    pub value: String,
}

fn default_path() -> String {
    "/".to_string()
}

/// Exact header match
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HttpHeaderMatch {
    /// Header name
    pub name: String,
    /// Header value
    pub value: String,
}

/// Backend reference (Service or ServiceImport)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HttpBackendRef {
    /// API group of the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// Kind of the backend; defaults to Service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Name of the backend
    pub name: String,

    /// Namespace of the backend; defaults to the route namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Service port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Relative traffic weight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

impl HttpBackendRef {
    /// Backend kind with the Gateway API default applied
    pub fn kind_or_default(&self) -> &str {
        self.kind.as_deref().unwrap_or(SERVICE_KIND)
    }

    /// Backend namespace, defaulting to the route namespace
    pub fn namespace_or<'a>(&'a self, route_namespace: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(route_namespace)
    }
}

impl ParentReference {
    /// Parent namespace, defaulting to the route namespace
    pub fn namespace_or<'a>(&'a self, route_namespace: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(route_namespace)
    }
}

/// Status of an HTTPRoute
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteStatus {
    /// Per-parent status
    #[serde(default)]
    pub parents: Vec<RouteParentStatus>,
}

/// Status of a route with respect to one parent
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteParentStatus {
    /// The parent this status is about
    pub parent_ref: ParentReference,

    /// Controller that wrote this status
    pub controller_name: String,

    /// Conditions for this parent
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl HttpRoute {
    /// First parent reference, the only one the controller honours
    pub fn primary_parent(&self) -> Option<&ParentReference> {
        self.spec.parent_refs.first()
    }

    /// Iterate over every backend reference in rule order
    pub fn backend_refs(&self) -> impl Iterator<Item = &HttpBackendRef> {
        self.spec.rules.iter().flat_map(|r| r.backend_refs.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_deserializes_from_gateway_api_json() {
        let json = serde_json::json!({
            "apiVersion": "gateway.networking.k8s.io/v1beta1",
            "kind": "HTTPRoute",
            "metadata": { "name": "service1", "namespace": "default" },
            "spec": {
                "parentRefs": [{ "name": "mesh1", "sectionName": "http" }],
                "rules": [{
                    "matches": [{ "path": { "type": "PathPrefix", "value": "/api" } }],
                    "backendRefs": [
                        { "name": "targetgroup1", "kind": "ServiceImport", "port": 8080 }
                    ]
                }]
            }
        });
        let route: HttpRoute = serde_json::from_value(json).unwrap();
        let parent = route.primary_parent().unwrap();
        assert_eq!(parent.name, "mesh1");
        assert_eq!(parent.section_name.as_deref(), Some("http"));
        assert_eq!(parent.namespace_or("default"), "default");

        let backend = route.backend_refs().next().unwrap();
        assert_eq!(backend.kind_or_default(), SERVICE_IMPORT_KIND);
        assert_eq!(backend.port, Some(8080));
        assert_eq!(
            route.spec.rules[0].matches[0].path.as_ref().unwrap().value,
            "/api"
        );
    }

    #[test]
    fn backend_kind_and_namespace_defaults() {
        let b = HttpBackendRef {
            name: "svc".to_string(),
            ..Default::default()
        };
        assert_eq!(b.kind_or_default(), SERVICE_KIND);
        assert_eq!(b.namespace_or("team-a"), "team-a");
    }
}
