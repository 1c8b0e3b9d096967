//! Kubernetes controllers for the OADP CRDs
//!
//! This module contains the controller implementations that watch for CRD changes
//! and trigger reconciliation.

pub mod backoff;
mod cloud_storage_controller;
mod dpa_controller;
mod dpt_controller;

pub use cloud_storage_controller::run as run_cloud_storage_controller;
pub use dpa_controller::run as run_dpa_controller;
pub use dpt_controller::run as run_dpt_controller;

use std::sync::Arc;

use kube::{Client, Resource, ResourceExt};
use tokio_util::sync::CancellationToken;

use crate::adapters::object_storage::ObjectStorageFactory;
use crate::config::OperatorEnv;
use crate::reconcilers::data_protection_test::ProbeSettings;
use crate::store::ClusterStore;
use backoff::Backoff;

/// Workers per controller; keys are still processed one at a time
pub const CONCURRENCY: u16 = 4;

/// Shared context for all controllers
pub struct Context {
    /// Kubernetes client, used for watches and finalizers
    pub client: Client,
    /// Reads and writes of reconcilers
    pub store: Arc<dyn ClusterStore>,
    pub env: OperatorEnv,
    pub storage: Arc<dyn ObjectStorageFactory>,
    pub probes: ProbeSettings,
    /// Cancelled on shutdown; in-flight reconciles stop at the next step
    pub cancel: CancellationToken,
    pub backoff: Backoff,
}

impl Context {
    /// Create a new context
    pub fn new(
        client: Client,
        store: Arc<dyn ClusterStore>,
        env: OperatorEnv,
        storage: Arc<dyn ObjectStorageFactory>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            store,
            env,
            storage,
            probes: ProbeSettings::default(),
            cancel,
            backoff: Backoff::new(),
        }
    }
}

/// Backoff key of an object
fn backoff_key<K: Resource<DynamicType = ()>>(obj: &K) -> String {
    format!(
        "{}/{}/{}",
        K::kind(&()),
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    )
}
