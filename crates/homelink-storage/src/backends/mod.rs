//! Store backend implementations.
//!
//! This module contains implementations of the `RemoteStore` trait,
//! feature-gated for conditional compilation.

use std::sync::Arc;

use homelink_core::config::StoreSettings;
use homelink_core::storage::Result;
use homelink_core::{RemoteStore, StoreError};

pub mod memory;

// Redb backend (feature-gated)
#[cfg(feature = "redb")]
pub mod redb;

/// Create a store by backend identifier.
///
/// # Example
/// ```no_run
/// use homelink_core::config::StoreSettings;
/// use homelink_storage::create_store;
///
/// # fn main() -> Result<(), homelink_core::StoreError> {
/// let settings = StoreSettings {
///     backend: "redb".to_string(),
///     path: "./data/homelink.redb".to_string(),
///     ..Default::default()
/// };
/// let store = create_store(&settings)?;
/// # Ok(())
/// # }
/// ```
pub fn create_store(settings: &StoreSettings) -> Result<Arc<dyn RemoteStore>> {
    match settings.backend.as_str() {
        #[cfg(feature = "redb")]
        "redb" => Ok(Arc::new(redb::RedbStore::new(redb::RedbStoreConfig::new(
            settings.path.clone(),
        ))?)),

        "memory" => Ok(Arc::new(memory::MemoryStore::new())),

        other => Err(StoreError::Backend(format!(
            "Unknown backend type: {}. Available backends: {}",
            other,
            available_backends().join(", ")
        ))),
    }
}

/// Get list of available backend types (based on enabled features).
pub fn available_backends() -> Vec<&'static str> {
    #[cfg(feature = "redb")]
    return vec!["redb", "memory"];
    #[cfg(not(feature = "redb"))]
    vec!["memory"]
}
