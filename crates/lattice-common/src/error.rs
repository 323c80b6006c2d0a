//! Error types for the Lattice gateway controller
//!
//! Errors are structured with fields to aid debugging in production. Every
//! variant maps onto an [`ErrorClass`], which is what the reconciliation loop
//! uses to pick a requeue strategy and an event type.

use thiserror::Error;

/// Coarse classification used by the controller's error policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// A referenced object does not exist yet; wait for the next watch event
    NotReady,
    /// The declared input is invalid; wait for a spec change
    Validation,
    /// Transient condition; requeue with retry backoff
    Retryable,
    /// Rejected by the cloud or the API server; requeue at standard backoff
    Fatal,
    /// Local failure unrelated to the cloud or the declared spec
    Internal,
}

/// Main error type for Lattice operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A referenced object (usually the parent Gateway) is not resolvable yet
    #[error("not ready for {route}: {message}")]
    NotReady {
        /// Route being reconciled ("namespace/name")
        route: String,
        /// What is missing
        message: String,
    },

    /// Structurally invalid declared input
    #[error("validation error for {route}: {message}")]
    Validation {
        /// Route being reconciled ("namespace/name")
        route: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.parentRefs")
        field: Option<String>,
    },

    /// Transient cloud-side failure (throttling, conflict, timeout, cancellation)
    #[error("retryable cloud error [{resource}]: {message}")]
    RetryableCloud {
        /// Cloud resource or operation that failed
        resource: String,
        /// Description of what failed
        message: String,
    },

    /// Cloud rejected the request for a reason unlikely to resolve by itself
    #[error("cloud error [{resource}]: {message}")]
    FatalCloud {
        /// Cloud resource or operation that failed
        resource: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "deployer", "stack")
        context: String,
    },
}

impl Error {
    /// Create a not-ready error for a route
    pub fn not_ready(route: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::NotReady {
            route: route.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with route context and field path
    pub fn validation_for_field(
        route: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            route: route.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a retryable cloud error
    pub fn retryable_cloud(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::RetryableCloud {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a fatal cloud error
    pub fn fatal_cloud(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::FatalCloud {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Classify this error for the controller's error policy
    ///
    /// Kubernetes errors are retryable unless the API server rejected the
    /// request with a 4xx other than conflict (409) or throttling (429).
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 409 || ae.code == 429 => ErrorClass::Retryable,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) => ErrorClass::Fatal,
                _ => ErrorClass::Retryable,
            },
            Error::NotReady { .. } => ErrorClass::NotReady,
            Error::Validation { .. } => ErrorClass::Validation,
            Error::RetryableCloud { .. } => ErrorClass::Retryable,
            Error::FatalCloud { .. } => ErrorClass::Fatal,
            Error::Internal { .. } => ErrorClass::Internal,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}
