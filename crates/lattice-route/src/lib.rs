//! HTTPRoute reconciliation into VPC Lattice
//!
//! This crate turns Gateway API HTTPRoutes into Lattice service resources:
//!
//! - **Model**: The resource stack a route translates into
//! - **Builder**: Resolves a route and its referents into a stack
//! - **Deploy**: Converges the cloud onto a stack through [`deploy::cloud::LatticeCloud`]
//! - **Store**: Cloud identifiers shared across routes
//! - **Status**: Writes the assigned DNS name back onto the route
//! - **Controller**: Build → Deploy → Project loop with finalizer-guarded cleanup

#![deny(missing_docs)]

pub mod builder;
pub mod client;
pub mod controller;
pub mod deploy;
pub mod model;
pub mod relevance;
pub mod status;
pub mod store;
pub mod watch;

pub use controller::{error_policy, reconcile, ControllerConfig, RouteContext};
pub use deploy::{DeployerConfig, StackDeployer};
pub use store::LatticeDataStore;
