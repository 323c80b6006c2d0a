//! Resource descriptors held by a [`Stack`](super::Stack)

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{ResourceKind, StackResource, StackResourceType};

/// Listener and target-group protocol
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// Plain HTTP
    #[default]
    Http,
    /// HTTP over TLS
    Https,
}

impl Protocol {
    /// Parse a Gateway listener protocol; only HTTP and HTTPS are supported
    pub fn from_gateway(protocol: &str) -> Option<Self> {
        match protocol {
            "HTTP" => Some(Self::Http),
            "HTTPS" => Some(Self::Https),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "HTTP"),
            Self::Https => write!(f, "HTTPS"),
        }
    }
}

// =============================================================================
// Service
// =============================================================================

/// The Lattice service fronting one route
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResource {
    /// Route name
    pub name: String,
    /// Route namespace
    pub namespace: String,
    /// Service network (parent Gateway name)
    pub service_network: String,
    /// Certificate ARN for TLS termination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_cert_arn: Option<String>,
    /// Route hostnames
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hostnames: Vec<String>,
}

impl ServiceResource {
    /// Name of the service in the cloud
    pub fn cloud_name(&self) -> String {
        lattice_service_name(&self.name, &self.namespace)
    }
}

/// Cloud name of the service created for route `name` in `namespace`
pub fn lattice_service_name(name: &str, namespace: &str) -> String {
    format!("{name}-{namespace}")
}

impl StackResourceType for ServiceResource {
    const KIND: ResourceKind = ResourceKind::Service;

    fn logical_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    fn into_resource(self) -> StackResource {
        StackResource::Service(self)
    }

    fn from_resource(resource: &StackResource) -> Option<&Self> {
        match resource {
            StackResource::Service(r) => Some(r),
            _ => None,
        }
    }
}

// =============================================================================
// Listener
// =============================================================================

/// Where a listener forwards requests that match no rule
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultAction {
    /// Backend name
    pub backend_service_name: String,
    /// Backend namespace
    pub backend_service_namespace: String,
    /// Backend port, if the route names one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_port: Option<u16>,
    /// Backend is a ServiceImport
    pub is_import: bool,
}

impl DefaultAction {
    /// Key of the target group the default action forwards to
    pub fn target_group_key(&self) -> TargetGroupKey {
        TargetGroupKey {
            name: self.backend_service_name.clone(),
            namespace: self.backend_service_namespace.clone(),
            port: self.backend_port,
            is_import: self.is_import,
        }
    }
}

/// A listener on the route's service
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    /// Owning service (route) name
    pub name: String,
    /// Owning service (route) namespace
    pub namespace: String,
    /// Listener port
    pub port: u16,
    /// Listener protocol
    pub protocol: Protocol,
    /// Default forward action
    pub default_action: DefaultAction,
}

impl StackResourceType for Listener {
    const KIND: ResourceKind = ResourceKind::Listener;

    fn logical_key(&self) -> String {
        format!("{}/{}/{}", self.namespace, self.name, self.port)
    }

    fn into_resource(self) -> StackResource {
        StackResource::Listener(self)
    }

    fn from_resource(resource: &StackResource) -> Option<&Self> {
        match resource {
            StackResource::Listener(r) => Some(r),
            _ => None,
        }
    }
}

// =============================================================================
// Rule
// =============================================================================

/// Path match of a rule
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathMatch {
    /// Exact match instead of prefix
    pub exact: bool,
    /// Path value
    pub value: String,
}

/// Header match of a rule
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeaderMatch {
    /// Header name
    pub name: String,
    /// Exact header value
    pub value: String,
}

/// Match criteria of a rule
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleMatch {
    /// Path match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathMatch>,
    /// Header matches
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HeaderMatch>,
}

/// Weighted forward target of a rule
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleTarget {
    /// Target group receiving the traffic
    pub target_group: TargetGroupKey,
    /// Relative weight
    pub weight: u32,
}

/// A listener rule
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Owning service (route) name
    pub service_name: String,
    /// Owning service (route) namespace
    pub service_namespace: String,
    /// Port of the listener the rule belongs to
    pub listener_port: u16,
    /// Protocol of the listener the rule belongs to
    pub listener_protocol: Protocol,
    /// Rule name, unique per listener
    pub name: String,
    /// Evaluation priority, lower first
    pub priority: u32,
    /// Match criteria
    pub matches: RuleMatch,
    /// Weighted targets
    pub targets: Vec<RuleTarget>,
}

impl StackResourceType for Rule {
    const KIND: ResourceKind = ResourceKind::Rule;

    fn logical_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.service_namespace, self.service_name, self.listener_port, self.name
        )
    }

    fn into_resource(self) -> StackResource {
        StackResource::Rule(self)
    }

    fn from_resource(resource: &StackResource) -> Option<&Self> {
        match resource {
            StackResource::Rule(r) => Some(r),
            _ => None,
        }
    }
}

// =============================================================================
// TargetGroup
// =============================================================================

/// Backend identity a target group is keyed on
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetGroupKey {
    /// Backend name
    pub name: String,
    /// Backend namespace
    pub namespace: String,
    /// Backend port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Backend is a ServiceImport
    pub is_import: bool,
}

impl TargetGroupKey {
    /// Cloud name of a target group this cluster owns
    pub fn local_name(&self) -> String {
        match self.port {
            Some(port) => format!("k8s-{}-{}-{}", self.name, self.namespace, port),
            None => format!("k8s-{}-{}", self.name, self.namespace),
        }
    }

    /// Cloud name under which an exporting cluster publishes this backend
    pub fn export_name(&self) -> String {
        format!("k8s-{}-{}-export", self.name, self.namespace)
    }

    /// Cloud name of the target group, exported or local
    pub fn cloud_name(&self) -> String {
        if self.is_import {
            self.export_name()
        } else {
            self.local_name()
        }
    }
}

impl fmt::Display for TargetGroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        if self.is_import {
            write!(f, " (import)")?;
        }
        Ok(())
    }
}

/// Health check settings of a target group
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    /// Whether health checking is enabled
    pub enabled: bool,
    /// Probe path
    pub path: String,
    /// Probe protocol
    pub protocol: Protocol,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/".to_string(),
            protocol: Protocol::Http,
        }
    }
}

/// A target group for one backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetGroup {
    /// Backend identity
    pub key: TargetGroupKey,
    /// Cloud name
    pub name: String,
    /// Traffic protocol
    pub protocol: Protocol,
    /// Health check settings
    pub health_check: HealthCheck,
}

impl StackResourceType for TargetGroup {
    const KIND: ResourceKind = ResourceKind::TargetGroup;

    fn logical_key(&self) -> String {
        self.key.to_string()
    }

    fn into_resource(self) -> StackResource {
        StackResource::TargetGroup(self)
    }

    fn from_resource(resource: &StackResource) -> Option<&Self> {
        match resource {
            StackResource::TargetGroup(r) => Some(r),
            _ => None,
        }
    }
}

// =============================================================================
// Targets
// =============================================================================

/// One endpoint registered in a target group
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target {
    /// Endpoint IP
    pub address: String,
    /// Endpoint port
    pub port: u16,
}

/// The endpoints registered in one target group
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Targets {
    /// Target group the endpoints belong to
    pub target_group: TargetGroupKey,
    /// Endpoints, sorted
    pub targets: Vec<Target>,
}

impl StackResourceType for Targets {
    const KIND: ResourceKind = ResourceKind::Targets;

    fn logical_key(&self) -> String {
        self.target_group.to_string()
    }

    fn into_resource(self) -> StackResource {
        StackResource::Targets(self)
    }

    fn from_resource(resource: &StackResource) -> Option<&Self> {
        match resource {
            StackResource::Targets(r) => Some(r),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_accepts_only_http_and_https() {
        assert_eq!(Protocol::from_gateway("HTTP"), Some(Protocol::Http));
        assert_eq!(Protocol::from_gateway("HTTPS"), Some(Protocol::Https));
        assert_eq!(Protocol::from_gateway("TCP"), None);
    }

    #[test]
    fn protocol_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Protocol::Https).unwrap(), "\"HTTPS\"");
        assert_eq!(Protocol::Http.to_string(), "HTTP");
    }

    #[test]
    fn target_group_names() {
        let key = TargetGroupKey {
            name: "targetgroup1".to_string(),
            namespace: "default".to_string(),
            port: Some(8080),
            is_import: false,
        };
        assert_eq!(key.local_name(), "k8s-targetgroup1-default-8080");
        assert_eq!(key.export_name(), "k8s-targetgroup1-default-export");
        assert_eq!(key.cloud_name(), key.local_name());
        let import = TargetGroupKey {
            is_import: true,
            ..key.clone()
        };
        assert_eq!(import.cloud_name(), "k8s-targetgroup1-default-export");
        assert_eq!(key.to_string(), "default/targetgroup1:8080");
    }

    #[test]
    fn logical_keys_include_discriminators() {
        let listener = Listener {
            name: "service1".to_string(),
            namespace: "default".to_string(),
            port: 80,
            ..Default::default()
        };
        assert_eq!(listener.logical_key(), "default/service1/80");
        assert_eq!(lattice_service_name("service1", "default"), "service1-default");
    }
}
