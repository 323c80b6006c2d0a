//! Common types for the Lattice gateway controller: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod telemetry;

pub use error::{Error, ErrorClass};
pub use kube_utils::NamespacedName;

/// Default controller name matched against `GatewayClass.spec.controllerName`
pub const DEFAULT_CONTROLLER_NAME: &str = "application-networking.k8s.aws/gateway-api-controller";

/// Field manager used for server-side patches
pub const FIELD_MANAGER: &str = "lattice-gateway-controller";
