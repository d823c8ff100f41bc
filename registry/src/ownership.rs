// Shard ownership
//
// The owner of a dictionary key is the record stored at its shard path. Both
// group operations run under the application lock, so two of them for the
// same application never interleave. Writers that skip the lock are not
// detected.

use crate::{
    config::RegistryConfig,
    error::{Fatal, Result},
    lock::AppLock,
    paths::RegistryPaths,
    record::{DictKey, OwnerRecord, ShardGroup},
    store::CoordStore,
    BeeId,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct Ownership {
    store: Arc<dyn CoordStore>,
    paths: RegistryPaths,
    lock: AppLock,
    app_ttl: Option<Duration>,
}

impl Ownership {
    pub fn new(config: &RegistryConfig, store: Arc<dyn CoordStore>) -> Self {
        let paths = RegistryPaths::new(config.prefix.clone());
        Self {
            lock: AppLock::new(store.clone(), paths.clone()),
            store,
            paths,
            app_ttl: config.app_ttl_opt(),
        }
    }

    pub fn lock(&self) -> &AppLock {
        &self.lock
    }

    /// Makes `bee` the owner of every key in `group`, overwriting any
    /// previous owner.
    pub async fn set(&self, bee: &BeeId, group: &ShardGroup) -> Result<OwnerRecord> {
        self.lock.acquire(bee).await?;
        let result = self.set_locked(bee, group).await;
        self.release(bee, result).await
    }

    /// Claims `group` for `bee`, or finds who already owns it.
    ///
    /// Returns the record every key in the group points to afterwards: `bee`
    /// itself, or the single existing owner. Two different existing owners
    /// within the group is an unrecoverable [`Fatal::SplitOwnership`],
    /// reported before anything is written.
    pub async fn store_or_get(&self, bee: &BeeId, group: &ShardGroup) -> Result<OwnerRecord> {
        self.lock.acquire(bee).await?;
        let result = self.store_or_get_locked(bee, group).await;
        self.release(bee, result).await
    }

    /// Current owner of a single key, read without the lock.
    pub async fn owner_of(&self, app: &str, dk: &DictKey) -> Result<Option<OwnerRecord>> {
        let key = self.paths.shard_path(app, dk);
        match self.store.get(&key, false).await {
            Ok(res) => Ok(Some(OwnerRecord::decode(&key, res.node.value())?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_locked(&self, bee: &BeeId, group: &ShardGroup) -> Result<OwnerRecord> {
        let record = OwnerRecord::from(bee);
        let value = record.encode()?;
        for dk in group {
            let key = self.paths.shard_path(&bee.app, dk);
            self.store.set(&key, &value, self.app_ttl).await?;
        }
        debug!(%bee, keys = group.len(), "bee set as owner");
        Ok(record)
    }

    async fn store_or_get_locked(&self, bee: &BeeId, group: &ShardGroup) -> Result<OwnerRecord> {
        let mut existing: Option<OwnerRecord> = None;

        for dk in group {
            let key = self.paths.shard_path(&bee.app, dk);
            let res = match self.store.get(&key, false).await {
                Ok(res) => res,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };

            let owner = OwnerRecord::decode(&key, res.node.value())?;
            if let Some(first) = &existing {
                if *first != owner {
                    return Err(Fatal::SplitOwnership {
                        bee: bee.clone(),
                        key,
                        first: first.clone(),
                        second: owner,
                    }
                    .into());
                }
            } else {
                existing = Some(owner);
            }
        }

        let record = existing.unwrap_or_else(|| OwnerRecord::from(bee));
        let value = record.encode()?;
        for dk in group {
            let key = self.paths.shard_path(&bee.app, dk);
            match self.store.create(&key, &value, self.app_ttl).await {
                Ok(_) => {}
                Err(e) if e.is_node_exist() => {}
                Err(e) => return Err(e.into()),
            }
        }

        if record.is_bee(bee) {
            debug!(%bee, keys = group.len(), "bee owns its shard group");
        } else {
            info!(%bee, owner = %record, "shard group already owned");
        }
        Ok(record)
    }

    /// Releases the lock after a locked section. The section's own error wins
    /// over a release error.
    async fn release<T>(&self, bee: &BeeId, result: Result<T>) -> Result<T> {
        match (result, self.lock.release(bee).await) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release)) => {
                warn!(%bee, error = %release, "cannot release app lock");
                Err(e)
            }
        }
    }
}
