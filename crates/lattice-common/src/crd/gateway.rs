//! Gateway API `GatewayClass` and `Gateway` types
//!
//! Only the fields the controller reads are modelled. Unknown fields are
//! ignored on deserialization.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

// =============================================================================
// GatewayClass
// =============================================================================

/// Cluster-scoped class naming the controller responsible for its Gateways
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gateway.networking.k8s.io",
    version = "v1beta1",
    kind = "GatewayClass",
    plural = "gatewayclasses",
    shortname = "gc",
    status = "GatewayClassStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct GatewayClassSpec {
    /// Controller that manages Gateways of this class
    pub controller_name: String,

    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Status of a GatewayClass
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayClassStatus {
    /// Conditions reported by the controller
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

// =============================================================================
// Gateway
// =============================================================================

/// A Gateway maps to a Lattice service network
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gateway.networking.k8s.io",
    version = "v1beta1",
    kind = "Gateway",
    plural = "gateways",
    shortname = "gtw",
    namespaced,
    status = "GatewayStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    /// GatewayClass this Gateway belongs to
    pub gateway_class_name: String,

    /// Listener configurations
    #[serde(default)]
    pub listeners: Vec<GatewayListener>,
}

/// Gateway listener configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayListener {
    /// Listener name, referenced by `parentRefs[].sectionName`
    pub name: String,

    /// Optional hostname filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Port number
    pub port: u16,

    /// Protocol (HTTP, HTTPS, ...)
    pub protocol: String,

    /// TLS configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<GatewayTlsConfig>,
}

/// TLS mode of a Gateway listener
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TlsMode {
    /// TLS is terminated at the listener
    Terminate,
    /// TLS is passed through to the backend
    Passthrough,
}

/// TLS configuration of a Gateway listener
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayTlsConfig {
    /// TLS mode; the Gateway API default is Terminate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<TlsMode>,

    /// Implementation-specific options (annotation key/value pairs)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

/// Status of a Gateway
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    /// Conditions reported by the controller
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Gateway {
    /// Listeners selected by an optional `sectionName`
    ///
    /// With no section name every listener is selected.
    pub fn listeners_for_section<'a>(
        &'a self,
        section_name: Option<&'a str>,
    ) -> impl Iterator<Item = &'a GatewayListener> + 'a {
        self.spec
            .listeners
            .iter()
            .filter(move |l| section_name.map_or(true, |s| l.name == s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener(name: &str, port: u16) -> GatewayListener {
        GatewayListener {
            name: name.to_string(),
            port,
            protocol: "HTTP".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn section_name_selects_matching_listeners() {
        let gw = Gateway::new(
            "mesh1",
            GatewaySpec {
                gateway_class_name: "amazon-vpc-lattice".to_string(),
                listeners: vec![listener("http", 80), listener("https", 443)],
            },
        );
        let ports: Vec<u16> = gw.listeners_for_section(Some("https")).map(|l| l.port).collect();
        assert_eq!(ports, vec![443]);
        assert_eq!(gw.listeners_for_section(None).count(), 2);
        assert_eq!(gw.listeners_for_section(Some("grpc")).count(), 0);
    }

    #[test]
    fn tls_options_deserialize_from_gateway_yaml() {
        let json = serde_json::json!({
            "name": "https",
            "port": 443,
            "protocol": "HTTPS",
            "tls": {
                "mode": "Terminate",
                "options": { "aws-custom-cert-arn": "arn:aws:acm:cert" }
            }
        });
        let l: GatewayListener = serde_json::from_value(json).unwrap();
        let tls = l.tls.unwrap();
        assert_eq!(tls.mode, Some(TlsMode::Terminate));
        assert_eq!(tls.options["aws-custom-cert-arn"], "arn:aws:acm:cert");
    }
}
