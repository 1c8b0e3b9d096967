//! OpenShift API for Data Protection operator
//!
//! This operator installs and continuously reconciles a Velero based
//! data-protection stack from a single DataProtectionApplication, and
//! manages CloudStorage buckets and DataProtectionTest probes, using
//! Custom Resource Definitions (CRDs).

pub mod adapters;
pub mod bootstrap;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod reconcilers;
pub mod store;

pub use error::{Error, Result};
