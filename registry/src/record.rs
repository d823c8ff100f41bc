// Values stored in the registry
//
// Shard keys and lock entries both hold an `OwnerRecord` encoded as JSON with
// the field names `hive_id` and `bee_id`. Other implementations read the same
// keys, so the field names are part of the wire format.

use crate::{
    error::{Fatal, Result},
    BeeId, HiveId,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One partition of an application's state: a key inside a dictionary.
///
/// Ordered by dictionary, then key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DictKey {
    pub dict: String,
    pub key: String,
}

impl DictKey {
    pub fn new(dict: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            dict: dict.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for DictKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dict, self.key)
    }
}

/// A set of dictionary keys that must have a single owner.
///
/// Always held sorted and without duplicates, so every operation visits the
/// keys in the same order no matter how the caller listed them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardGroup(Vec<DictKey>);

impl ShardGroup {
    pub fn new(mut keys: Vec<DictKey>) -> Self {
        keys.sort();
        keys.dedup();
        Self(keys)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DictKey> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[DictKey] {
        &self.0
    }
}

impl From<Vec<DictKey>> for ShardGroup {
    fn from(keys: Vec<DictKey>) -> Self {
        Self::new(keys)
    }
}

impl FromIterator<DictKey> for ShardGroup {
    fn from_iter<I: IntoIterator<Item = DictKey>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a ShardGroup {
    type Item = &'a DictKey;
    type IntoIter = std::slice::Iter<'a, DictKey>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Owner of a registered key: a bee on a hive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerRecord {
    pub hive_id: HiveId,
    pub bee_id: u64,
}

impl OwnerRecord {
    pub fn new(hive_id: impl Into<HiveId>, bee_id: u64) -> Self {
        Self {
            hive_id: hive_id.into(),
            bee_id,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes the value stored at `key`. A value that does not parse means
    /// the registry holds something this hive did not write.
    pub fn decode(key: &str, value: &str) -> std::result::Result<Self, Fatal> {
        serde_json::from_str(value).map_err(|_| Fatal::CorruptValue {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    pub fn is_bee(&self, bee: &BeeId) -> bool {
        self.hive_id == bee.hive && self.bee_id == bee.id
    }
}

impl From<&BeeId> for OwnerRecord {
    fn from(bee: &BeeId) -> Self {
        Self {
            hive_id: bee.hive.clone(),
            bee_id: bee.id,
        }
    }
}

impl fmt::Display for OwnerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.hive_id, self.bee_id)
    }
}
