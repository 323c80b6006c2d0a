//! Lattice gateway controller binary support

#![deny(missing_docs)]

/// Command-line and environment configuration
pub mod config;
/// HTTPRoute controller wiring
pub mod controller_runner;
