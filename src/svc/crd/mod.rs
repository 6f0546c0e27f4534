//! # Custom resource definition module
//!
//! This module provide custom resource definition managed by the operator,
//! their structures and implementation.

pub mod cluster;
pub mod task;
