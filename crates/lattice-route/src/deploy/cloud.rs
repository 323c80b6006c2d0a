//! Logical contract of the VPC Lattice control plane
//!
//! Only the operations the deployer needs are modelled. Each cloud object
//! embeds the `*Spec` it was created or last updated with, so the deployer can
//! diff desired against actual with `PartialEq`.

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use lattice_common::Error;

use crate::model::{Protocol, RuleMatch, Target};

/// Failure category reported by the cloud API
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloudErrorKind {
    /// Request rate exceeded
    Throttled,
    /// Concurrent modification or resource in use
    Conflict,
    /// Resource does not exist
    NotFound,
    /// Caller lacks permission
    AccessDenied,
    /// Request was malformed
    Validation,
    /// Request timed out
    Timeout,
    /// Server-side failure
    Internal,
}

/// Error returned by a [`LatticeCloud`] call
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{operation} failed ({kind:?}): {message}")]
pub struct CloudError {
    /// Failure category
    pub kind: CloudErrorKind,
    /// Operation that failed, e.g. "CreateService"
    pub operation: String,
    /// Message from the cloud
    pub message: String,
}

impl CloudError {
    /// Create a new cloud error
    pub fn new(
        kind: CloudErrorKind,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            CloudErrorKind::Throttled
                | CloudErrorKind::Conflict
                | CloudErrorKind::NotFound
                | CloudErrorKind::Timeout
                | CloudErrorKind::Internal
        )
    }
}

impl From<CloudError> for Error {
    fn from(e: CloudError) -> Self {
        if e.is_retryable() {
            Error::retryable_cloud(e.operation, e.message)
        } else {
            Error::fatal_cloud(e.operation, e.message)
        }
    }
}

/// Desired configuration of a service
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceSpec {
    /// Cloud name
    pub name: String,
    /// Service network to associate with
    pub service_network: String,
    /// Certificate for TLS termination
    pub customer_cert_arn: Option<String>,
    /// Custom domain names
    pub hostnames: Vec<String>,
}

/// A service as reported by the cloud
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloudService {
    /// Cloud id
    pub id: String,
    /// Cloud ARN
    pub arn: String,
    /// Assigned DNS name
    pub dns: String,
    /// Current configuration
    pub spec: ServiceSpec,
}

/// Desired configuration of a listener
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerSpec {
    /// Port
    pub port: u16,
    /// Protocol
    pub protocol: Protocol,
    /// Target group of the default forward action
    pub default_target_group_id: String,
}

/// A listener as reported by the cloud
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloudListener {
    /// Cloud id
    pub id: String,
    /// Cloud ARN
    pub arn: String,
    /// Current configuration
    pub spec: ListenerSpec,
}

/// Weighted forward target of a rule
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeightedTargetGroup {
    /// Target group id
    pub target_group_id: String,
    /// Relative weight
    pub weight: u32,
}

/// Desired configuration of a listener rule
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleSpec {
    /// Rule name, unique per listener
    pub name: String,
    /// Priority
    pub priority: u32,
    /// Match criteria
    pub matches: RuleMatch,
    /// Weighted forward targets
    pub targets: Vec<WeightedTargetGroup>,
}

/// A listener rule as reported by the cloud
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloudRule {
    /// Cloud id
    pub id: String,
    /// Cloud ARN
    pub arn: String,
    /// Current configuration
    pub spec: RuleSpec,
}

/// Desired configuration of a target group
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetGroupSpec {
    /// Cloud name
    pub name: String,
    /// Traffic protocol
    pub protocol: Protocol,
    /// Default target port
    pub port: Option<u16>,
    /// Health check enabled
    pub health_check_enabled: bool,
    /// Health check path
    pub health_check_path: String,
}

/// A target group as reported by the cloud
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloudTargetGroup {
    /// Cloud id
    pub id: String,
    /// Cloud ARN
    pub arn: String,
    /// Current configuration
    pub spec: TargetGroupSpec,
}

/// Logical VPC Lattice API
///
/// `find_*` return `Ok(None)` when nothing matches. Every other call fails
/// with [`CloudErrorKind::NotFound`] when its target is missing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LatticeCloud: Send + Sync {
    /// Look up a service by name
    async fn find_service(&self, name: &str) -> Result<Option<CloudService>, CloudError>;

    /// Create a service; the response carries the assigned DNS name
    async fn create_service(&self, spec: &ServiceSpec) -> Result<CloudService, CloudError>;

    /// Update a service
    async fn update_service(
        &self,
        id: &str,
        spec: &ServiceSpec,
    ) -> Result<CloudService, CloudError>;

    /// Delete a service; it must have no listeners
    async fn delete_service(&self, id: &str) -> Result<(), CloudError>;

    /// List the listeners of a service
    async fn list_listeners(&self, service_id: &str) -> Result<Vec<CloudListener>, CloudError>;

    /// Create a listener
    async fn create_listener(
        &self,
        service_id: &str,
        spec: &ListenerSpec,
    ) -> Result<CloudListener, CloudError>;

    /// Update a listener
    async fn update_listener(
        &self,
        service_id: &str,
        listener_id: &str,
        spec: &ListenerSpec,
    ) -> Result<CloudListener, CloudError>;

    /// Delete a listener and its rules
    async fn delete_listener(&self, service_id: &str, listener_id: &str) -> Result<(), CloudError>;

    /// List the rules of a listener
    async fn list_rules(
        &self,
        service_id: &str,
        listener_id: &str,
    ) -> Result<Vec<CloudRule>, CloudError>;

    /// Create a rule
    async fn create_rule(
        &self,
        service_id: &str,
        listener_id: &str,
        spec: &RuleSpec,
    ) -> Result<CloudRule, CloudError>;

    /// Update a rule
    async fn update_rule(
        &self,
        service_id: &str,
        listener_id: &str,
        rule_id: &str,
        spec: &RuleSpec,
    ) -> Result<CloudRule, CloudError>;

    /// Delete a rule
    async fn delete_rule(
        &self,
        service_id: &str,
        listener_id: &str,
        rule_id: &str,
    ) -> Result<(), CloudError>;

    /// Look up a target group by name
    async fn find_target_group(&self, name: &str) -> Result<Option<CloudTargetGroup>, CloudError>;

    /// Create a target group
    async fn create_target_group(
        &self,
        spec: &TargetGroupSpec,
    ) -> Result<CloudTargetGroup, CloudError>;

    /// Update a target group
    async fn update_target_group(
        &self,
        id: &str,
        spec: &TargetGroupSpec,
    ) -> Result<CloudTargetGroup, CloudError>;

    /// Delete a target group; fails with `Conflict` while a rule or listener uses it
    async fn delete_target_group(&self, id: &str) -> Result<(), CloudError>;

    /// Targets registered in a target group
    async fn list_targets(&self, target_group_id: &str) -> Result<Vec<Target>, CloudError>;

    /// Register targets
    async fn register_targets(
        &self,
        target_group_id: &str,
        targets: Vec<Target>,
    ) -> Result<(), CloudError>;

    /// Deregister targets
    async fn deregister_targets(
        &self,
        target_group_id: &str,
        targets: Vec<Target>,
    ) -> Result<(), CloudError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_common::ErrorClass;

    #[test]
    fn cloud_errors_map_onto_error_classes() {
        let cases = [
            (CloudErrorKind::Throttled, ErrorClass::Retryable),
            (CloudErrorKind::Conflict, ErrorClass::Retryable),
            (CloudErrorKind::NotFound, ErrorClass::Retryable),
            (CloudErrorKind::Timeout, ErrorClass::Retryable),
            (CloudErrorKind::Internal, ErrorClass::Retryable),
            (CloudErrorKind::AccessDenied, ErrorClass::Fatal),
            (CloudErrorKind::Validation, ErrorClass::Fatal),
        ];
        for (kind, class) in cases {
            let err: Error = CloudError::new(kind, "CreateService", "boom").into();
            assert_eq!(err.class(), class, "{kind:?}");
        }
    }

    #[test]
    fn cloud_error_display_names_operation() {
        let err = CloudError::new(CloudErrorKind::AccessDenied, "CreateTargetGroup", "denied");
        assert_eq!(err.to_string(), "CreateTargetGroup failed (AccessDenied): denied");
    }
}
