//! Shared test utilities for the k8s-secrets engine.
//!
//! This crate provides:
//! - Proptest generators for roles, binding rules and resource sets
//! - An in-memory cluster implementing the engine's cluster capability
//! - Test fixtures with sample roles and root configuration

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod generators;
pub mod mocks;
pub mod fixtures;

pub use generators::*;
