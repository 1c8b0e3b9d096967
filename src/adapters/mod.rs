//! Adapters between cluster objects and external systems

pub mod credentials;
pub mod object_storage;
pub mod secrets;

pub use secrets::*;
