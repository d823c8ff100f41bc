// Coordination store adapter
//
// The registry is built on a replicated key-value store with atomic create,
// TTL expiry and change watches (the etcd v2 model). Only this narrow surface
// is used. Implementations never retry; callers own the retry policy.

pub mod memory;

pub use memory::MemStore;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Key not found: {key}")]
    KeyNotFound { key: String },

    #[error("Key already exists: {key}")]
    NodeExist { key: String },

    #[error("Not a file: {key}")]
    NotAFile { key: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Watch on {key} fell behind by {skipped} events")]
    WatchLagged { key: String, skipped: u64 },

    #[error("Watch closed")]
    WatchClosed,
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::KeyNotFound { .. })
    }

    pub fn is_node_exist(&self) -> bool {
        matches!(self, StoreError::NodeExist { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Change events delivered by [`CoordStore::watch`].
pub type WatchStream = BoxStream<'static, StoreResult<Response>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Get,
    Create,
    Set,
    Update,
    Delete,
    Expire,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Get => "get",
            Action::Create => "create",
            Action::Set => "set",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Expire => "expire",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key, or a directory of keys, as seen by the store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    pub key: String,
    pub value: Option<String>,
    pub dir: bool,
    pub nodes: Vec<Node>,
    pub ttl: Option<Duration>,
    pub modified_index: u64,
}

impl Node {
    pub fn value(&self) -> &str {
        self.value.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub action: Action,
    pub node: Node,
    pub prev_node: Option<Node>,
    /// Store-wide modification index when this response was produced.
    pub index: u64,
}

#[async_trait]
pub trait CoordStore: Send + Sync + fmt::Debug {
    /// Learns the cluster members from the configured addresses.
    async fn sync_cluster(&self) -> StoreResult<()>;

    /// Creates `path`, failing if it exists. `None` means no expiry.
    async fn create(&self, path: &str, value: &str, ttl: Option<Duration>) -> StoreResult<Response>;

    /// Replaces the value of an existing `path` and resets its TTL.
    async fn update(&self, path: &str, value: &str, ttl: Option<Duration>) -> StoreResult<Response>;

    /// Creates or overwrites `path`.
    async fn set(&self, path: &str, value: &str, ttl: Option<Duration>) -> StoreResult<Response>;

    async fn delete(&self, path: &str) -> StoreResult<Response>;

    /// Reads a key, or the children of a directory.
    async fn get(&self, path: &str, recursive: bool) -> StoreResult<Response>;

    /// Subscribes to changes of `path` (and, when `recursive`, everything
    /// below it). Events that happen after this returns are delivered.
    async fn watch(&self, path: &str, recursive: bool) -> StoreResult<WatchStream>;
}
