//! Reconcilers for the OADP CRDs
//!
//! This module contains the business logic for reconciling each CRD type.
//! Reconcilers are responsible for:
//! - Validating and resolving specs against observed cluster state
//! - Building and applying the desired children
//! - Running bucket lifecycle and storage probes
//! - Updating resource status and recording events

pub mod apply;
pub mod builders;
pub mod cloud_storage;
pub mod dpa;
pub mod images;
pub mod resolver;
pub mod status;
pub mod validator;
