//! Custom Resource types consumed by the Lattice gateway controller
//!
//! The controller does not own these CRDs. They are modelled with
//! `kube::CustomResource` so they can be watched and patched with typed APIs.

mod gateway;
mod route;
mod service_import;
mod types;

pub use gateway::{
    Gateway, GatewayClass, GatewayClassSpec, GatewayClassStatus, GatewayListener, GatewaySpec,
    GatewayStatus, GatewayTlsConfig, TlsMode,
};
pub use route::{
    HttpBackendRef, HttpHeaderMatch, HttpPathMatch, HttpRoute, HttpRouteMatch, HttpRouteRule,
    HttpRouteSpec, HttpRouteStatus, ParentReference, PathMatchType, RouteParentStatus,
    SERVICE_IMPORT_KIND, SERVICE_KIND,
};
pub use service_import::{ServiceImport, ServiceImportPort, ServiceImportSpec};
pub use types::{Condition, ConditionStatus};
