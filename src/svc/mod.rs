//! # Services module
//!
//! This module provide services to provision consoles next to database
//! clusters, interact with kubernetes and expose telemetry.
pub mod cfg;
pub mod console;
pub mod crd;
pub mod k8s;
pub mod telemetry;
