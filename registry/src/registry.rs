use crate::{
    config::RegistryConfig,
    error::Result,
    events::HiveContext,
    fatal::FatalHandler,
    membership::Membership,
    ownership::Ownership,
    record::{DictKey, OwnerRecord, ShardGroup},
    store::CoordStore,
    BeeId, HiveId,
};
use std::sync::Arc;
use tracing::info;

/// The registry as seen by a hive: membership plus shard ownership over one
/// coordination store connection.
///
/// Every [`crate::Fatal`] surfacing here goes through the [`FatalHandler`]
/// before it is returned.
#[derive(Debug)]
pub struct Registry {
    membership: Membership,
    ownership: Ownership,
    fatal: FatalHandler,
}

impl Registry {
    /// Connects the hive to the registry.
    ///
    /// Returns `Ok(None)` without calling `connect` when no store address is
    /// configured; the hive then runs without cluster coordination.
    pub async fn connect<F>(
        config: &RegistryConfig,
        ctx: Arc<dyn HiveContext>,
        fatal: FatalHandler,
        connect: F,
    ) -> Result<Option<Self>>
    where
        F: FnOnce(&[String]) -> Arc<dyn CoordStore>,
    {
        if !config.is_enabled() {
            info!("no registry address configured, running without cluster coordination");
            return Ok(None);
        }

        let store = connect(&config.addrs);
        let registry = Self {
            membership: Membership::new(config, store.clone(), ctx, fatal.clone()),
            ownership: Ownership::new(config, store),
            fatal,
        };
        registry
            .fatal
            .check(registry.membership.start().await)?;
        Ok(Some(registry))
    }

    pub fn is_connected(&self) -> bool {
        self.membership.is_connected()
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.fatal.check(self.membership.disconnect().await)
    }

    pub async fn set(&self, bee: &BeeId, group: &ShardGroup) -> Result<OwnerRecord> {
        self.fatal.check(self.ownership.set(bee, group).await)
    }

    pub async fn store_or_get(&self, bee: &BeeId, group: &ShardGroup) -> Result<OwnerRecord> {
        self.fatal.check(self.ownership.store_or_get(bee, group).await)
    }

    pub async fn owner_of(&self, app: &str, dk: &DictKey) -> Result<Option<OwnerRecord>> {
        self.fatal.check(self.ownership.owner_of(app, dk).await)
    }

    pub async fn live_hives(&self) -> Result<Vec<HiveId>> {
        self.membership.live_hives().await
    }

    pub fn ownership(&self) -> &Ownership {
        &self.ownership
    }
}
