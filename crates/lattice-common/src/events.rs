//! Kubernetes Events emitted by the gateway controller
//!
//! Reconcile milestones and failures are recorded on the HTTPRoute so they
//! show up in `kubectl describe httproute`. Publishing never fails the
//! reconcile: a rejected Event is logged and dropped.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// One Event about a route
#[derive(Clone, Debug)]
pub struct ControllerEvent {
    /// Normal or Warning
    pub type_: EventType,
    /// Value of the REASON column, one of [`reasons`]
    pub reason: &'static str,
    /// Value of the ACTION column, one of [`actions`]
    pub action: &'static str,
    /// Human-readable message
    pub note: String,
}

impl ControllerEvent {
    /// A Normal event
    pub fn normal(reason: &'static str, action: &'static str, note: impl Into<String>) -> Self {
        Self {
            type_: EventType::Normal,
            reason,
            action,
            note: note.into(),
        }
    }

    /// A Warning event
    pub fn warning(reason: &'static str, action: &'static str, note: impl Into<String>) -> Self {
        Self {
            type_: EventType::Warning,
            reason,
            action,
            note: note.into(),
        }
    }

    /// Whether this is a Warning
    pub fn is_warning(&self) -> bool {
        matches!(self.type_, EventType::Warning)
    }
}

/// Sink for [`ControllerEvent`]s
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record `event` on the object behind `regarding`
    async fn publish(&self, regarding: &ObjectReference, event: ControllerEvent);
}

/// Publishes through the events API
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Report as `component`; the pod name, when set, becomes the instance
    pub fn new(client: Client, component: &str) -> Self {
        let reporter = Reporter {
            controller: component.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, regarding: &ObjectReference, event: ControllerEvent) {
        let ControllerEvent {
            type_,
            reason,
            action,
            note,
        } = event;
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, regarding).await {
            warn!(
                reason,
                object = regarding.name.as_deref().unwrap_or_default(),
                error = %e,
                "dropping event"
            );
        }
    }
}

/// Discards every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _regarding: &ObjectReference, _event: ControllerEvent) {}
}

/// Event reasons
pub mod reasons {
    /// Reconcile started, or route deletion started
    pub const RECONCILE: &str = "Reconcile";
    /// Model build failed
    pub const FAILED_BUILD_MODEL: &str = "FailedBuildModel";
    /// Deploy or cleanup failed
    pub const FAILED_DEPLOY_MODEL: &str = "FailedDeployModel";
    /// Deploy failed with a retryable error and will be retried
    pub const RETRY_RECONCILE: &str = "RetryReconcile";
    /// Deploy converged the cloud state
    pub const DEPLOY_SUCCEED: &str = "DeploySucceed";
    /// Adding the route finalizer failed
    pub const FAILED_ADD_FINALIZER: &str = "FailedAddFinalizer";
    /// Removing the route finalizer failed
    pub const FAILED_REMOVE_FINALIZER: &str = "FailedRemoveFinalizer";
}

/// Event actions
pub mod actions {
    /// Adding or updating a route
    pub const RECONCILE: &str = "Reconcile";
    /// Translating a route into a stack
    pub const BUILD: &str = "Build";
    /// Converging the cloud onto a stack
    pub const DEPLOY: &str = "Deploy";
    /// Removing the cloud resources of a deleted route
    pub const DELETE: &str = "Delete";
}
