#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Cluster membership and shard ownership for beehive hives.
//!
//! Hives announce themselves under a TTL-bound key in a coordination store and
//! watch the hive directory to learn about peers. Bees claim or discover the
//! owner of a group of dictionary keys under a per-application lock.

pub mod config;
pub mod error;
pub mod events;
pub mod fatal;
pub mod lock;
pub mod membership;
pub mod ownership;
pub mod paths;
pub mod record;
pub mod registry;
pub mod store;

pub mod test_utils;

pub use config::RegistryConfig;
pub use error::{Error, Fatal, Result};
pub use events::{ChannelContext, ClusterEvent, EventKind, HiveContext};
pub use fatal::FatalHandler;
pub use record::{DictKey, OwnerRecord, ShardGroup};
pub use registry::Registry;
pub use store::{CoordStore, MemStore};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a hive (one process in the cluster).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HiveId(pub String);

impl HiveId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random id, for hives that are not given one.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HiveId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for HiveId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of a bee: one instance of an application running on a hive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BeeId {
    pub hive: HiveId,
    pub app: String,
    pub id: u64,
}

impl BeeId {
    pub fn new(hive: impl Into<HiveId>, app: impl Into<String>, id: u64) -> Self {
        Self {
            hive: hive.into(),
            app: app.into(),
            id,
        }
    }
}

impl fmt::Display for BeeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.hive, self.app, self.id)
    }
}
