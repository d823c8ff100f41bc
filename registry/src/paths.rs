use crate::{record::DictKey, HiveId};

const APP_DIR: &str = "apps";
const HIVE_DIR: &str = "hives";

/// Name of the per-application lock entry
pub const LOCK_FILE_NAME: &str = "__lock__";

/// Key layout of the registry:
///
/// ```text
/// <prefix>/hives/<hive>              hive registration
/// <prefix>/apps/<app>/__lock__       application lock
/// <prefix>/apps/<app>/<dict>/<key>   shard owner
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryPaths {
    prefix: String,
}

impl RegistryPaths {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn hive_dir(&self) -> String {
        format!("{}/{HIVE_DIR}", self.prefix)
    }

    pub fn hive_path(&self, hive: &HiveId) -> String {
        format!("{}/{}", self.hive_dir(), hive)
    }

    pub fn app_path(&self, app: &str, elems: &[&str]) -> String {
        let mut path = format!("{}/{APP_DIR}/{app}", self.prefix);
        for elem in elems {
            path.push('/');
            path.push_str(elem);
        }
        path
    }

    pub fn lock_path(&self, app: &str) -> String {
        self.app_path(app, &[LOCK_FILE_NAME])
    }

    pub fn shard_path(&self, app: &str, dk: &DictKey) -> String {
        self.app_path(app, &[&dk.dict, &dk.key])
    }

    /// Strips the hive directory from `path`. Returns `None` for paths outside
    /// of it.
    pub fn hive_id_from_path(&self, path: &str) -> Option<HiveId> {
        let dir = self.hive_dir();
        path.strip_prefix(&dir)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|id| !id.is_empty())
            .map(HiveId::from)
    }
}
