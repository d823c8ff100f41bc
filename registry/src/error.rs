use crate::{record::OwnerRecord, store::StoreError, BeeId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Coordination store error: {0}")]
    Store(#[from] StoreError),

    #[error("Releasing lock {key} held by {holder}, not by {caller}")]
    LockNotHeld {
        key: String,
        holder: OwnerRecord,
        caller: OwnerRecord,
    },

    #[error("Cannot encode registry value: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Invalid registry configuration: {0}")]
    Config(String),

    #[error("Registry is not connected")]
    NotConnected,

    #[error("Unrecoverable: {0}")]
    Fatal(#[from] Fatal),
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}

/// Conditions after which the hive must not keep running.
///
/// These are returned, never acted on, by the component that detects them.
/// [`crate::FatalHandler`] is the single place that turns them into an abort.
#[derive(Error, Debug, Clone)]
pub enum Fatal {
    #[error("Cannot connect to registry nodes {addrs:?}: {source}")]
    ClusterSync {
        addrs: Vec<String>,
        #[source]
        source: StoreError,
    },

    #[error("Error in registering hive entry {key}: {source}")]
    Register {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("Error in updating hive entry {key} in the registry: {source}")]
    RefreshTtl {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("Error in unregistering hive entry {key}: {source}")]
    Unregister {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("Cannot read the hive directory {key}: {source}")]
    HiveDirectory {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("Watch on hive directory {key} stopped: {reason}")]
    HiveWatch { key: String, reason: String },

    #[error("Inconsistent owners for bee {bee} at {key}: {first} vs {second}")]
    SplitOwnership {
        bee: BeeId,
        key: String,
        first: OwnerRecord,
        second: OwnerRecord,
    },

    #[error("Cannot decode registry value {value:?} at {key}")]
    CorruptValue { key: String, value: String },
}

pub type Result<T> = std::result::Result<T, Error>;
