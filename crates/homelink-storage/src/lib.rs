//! Remote store backends for HomeLink.
//!
//! | Backend | Feature | Persistent | Use |
//! |---------|---------|------------|-----|
//! | [`MemoryStore`] | always | no | tests, dry runs |
//! | [`RedbStore`] | `redb` (default) | yes | production |
//!
//! Both backends expose the same JSON tree semantics through
//! [`homelink_core::RemoteStore`].

pub mod backends;
pub mod tree;

pub use backends::memory::{MemoryStore, StoreWrite};
#[cfg(feature = "redb")]
pub use backends::redb::{RedbStore, RedbStoreConfig};
pub use backends::{available_backends, create_store};

/// Generate a new unique child key.
pub(crate) fn new_key() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
