//! Hierarchical remote store abstraction.
//!
//! The store is a tree of JSON values addressed by slash-separated paths
//! (`devices/list/<id>/topic`). Writes are fire-and-forget: they are queued
//! by the backend and never block the caller. Reads are asynchronous and
//! return the whole subtree under the requested path.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Storage error types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backend error.
    #[error("Backend error: {0}")]
    Backend(String),

    /// A read did not complete in time.
    #[error("Read of {path} timed out after {timeout_ms}ms")]
    Timeout { path: String, timeout_ms: u64 },

    /// The store has been closed or is unreachable.
    #[error("Store is closed")]
    Closed,

    /// Invalid path segment.
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// A location in the store tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StorePath {
    segments: Vec<String>,
}

impl StorePath {
    /// The root of the tree.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a slash-separated path. Empty segments are dropped.
    pub fn new(path: &str) -> Self {
        Self {
            segments: path
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Path of a child node. `name` may itself contain slashes.
    pub fn child(&self, name: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(
            name.split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        );
        Self { segments }
    }

    /// Path segments from the root.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Last segment, `None` for the root.
    pub fn key(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Whether `self` equals `other` or lies beneath it.
    pub fn starts_with(&self, other: &StorePath) -> bool {
        self.segments.starts_with(&other.segments)
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

impl From<&str> for StorePath {
    fn from(path: &str) -> Self {
        StorePath::new(path)
    }
}

/// Remote persistent store.
///
/// Implementations must preserve the order of writes issued from one caller
/// and must make reads observe every write queued before them.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Replace the value at `path`. `Value::Null` removes the subtree.
    fn set_value(&self, path: &StorePath, value: Value);

    /// Merge `children` into the object at `path`, leaving other children untouched.
    fn update_children(&self, path: &StorePath, children: Map<String, Value>);

    /// Read the subtree at `path`.
    async fn read(&self, path: &StorePath) -> Result<Option<Value>>;

    /// Generate a new unique child key.
    fn generate_key(&self) -> String;

    /// Flush queued writes and release resources.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Check if this backend survives a restart.
    fn is_persistent(&self) -> bool;
}

/// Read `path`, failing with [`StoreError::Timeout`] when `timeout` elapses first.
pub async fn read_with_timeout(
    store: &dyn RemoteStore,
    path: &StorePath,
    timeout: Duration,
) -> Result<Option<Value>> {
    match tokio::time::timeout(timeout, store.read(path)).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            path: path.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}
