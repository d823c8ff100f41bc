// Application lock
//
// One entry per application, `<prefix>/apps/<app>/__lock__`, holding the
// owner record of the bee that holds it. The entry has no TTL: a holder that
// dies without releasing leaves the application locked.

use crate::{
    error::{Error, Result},
    paths::RegistryPaths,
    record::OwnerRecord,
    store::{CoordStore, StoreError},
    BeeId,
};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub struct AppLock {
    store: Arc<dyn CoordStore>,
    paths: RegistryPaths,
}

impl AppLock {
    pub fn new(store: Arc<dyn CoordStore>, paths: RegistryPaths) -> Self {
        Self { store, paths }
    }

    /// Blocks until `bee` holds the lock of its application.
    ///
    /// Contenders are not queued: after each release every waiter retries the
    /// create and exactly one of them wins.
    pub async fn acquire(&self, bee: &BeeId) -> Result<()> {
        let key = self.paths.lock_path(&bee.app);
        let value = OwnerRecord::from(bee).encode()?;

        loop {
            match self.store.create(&key, &value, None).await {
                Ok(_) => {
                    debug!(%bee, %key, "app lock acquired");
                    return Ok(());
                }
                Err(e) if e.is_node_exist() => {}
                Err(e) => return Err(e.into()),
            }

            let mut changes = self.store.watch(&key, false).await?;

            // The holder may have released between the failed create and the
            // subscription.
            match self.store.get(&key, false).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            }

            trace!(%bee, %key, "waiting for app lock");
            match changes.next().await {
                Some(Ok(_)) => {}
                // Changes were dropped; any of them may have been the release.
                Some(Err(StoreError::WatchLagged { skipped, .. })) => {
                    debug!(%bee, %key, skipped, "app lock watch lagged, retrying");
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Err(StoreError::WatchClosed.into()),
            }
        }
    }

    /// Releases the lock if `bee` holds it. Fails without touching the entry
    /// when someone else does.
    pub async fn release(&self, bee: &BeeId) -> Result<()> {
        let key = self.paths.lock_path(&bee.app);
        let caller = OwnerRecord::from(bee);

        let current = self.store.get(&key, false).await?;
        let holder = OwnerRecord::decode(&key, current.node.value())?;
        if holder != caller {
            return Err(Error::LockNotHeld {
                key,
                holder,
                caller,
            });
        }

        self.store.delete(&key).await?;
        debug!(%bee, %key, "app lock released");
        Ok(())
    }
}
