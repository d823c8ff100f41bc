// Hive membership
//
// A hive is alive exactly while its entry under the hive directory exists.
// The entry carries a TTL and is refreshed at half that period. Every hive
// watches the directory and turns entry creation/deletion into
// `HiveJoined`/`HiveLeft` events on its own event bus.

use crate::{
    config::RegistryConfig,
    error::{Fatal, Result},
    events::{ClusterEvent, EventKind, HiveContext},
    fatal::FatalHandler,
    paths::RegistryPaths,
    store::{Action, CoordStore, Response, StoreError, StoreResult},
    HiveId,
};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Maps one change under the hive directory to the event it announces, if any.
pub fn membership_event(
    paths: &RegistryPaths,
    change: &Response,
    expire_as_leave: bool,
) -> Option<ClusterEvent> {
    let hive = paths.hive_id_from_path(&change.node.key)?;
    match (change.action, &change.prev_node) {
        (Action::Create, None) => Some(ClusterEvent::HiveJoined(hive)),
        (Action::Delete, Some(_)) => Some(ClusterEvent::HiveLeft(hive)),
        (Action::Expire, Some(_)) if expire_as_leave => Some(ClusterEvent::HiveLeft(hive)),
        _ => None,
    }
}

struct Shared {
    store: Arc<dyn CoordStore>,
    ctx: Arc<dyn HiveContext>,
    fatal: FatalHandler,
    paths: RegistryPaths,
    hive_ttl: Option<Duration>,
    expire_as_leave: bool,
}

impl Shared {
    fn hive_key_value(&self) -> (String, String) {
        let id = self.ctx.hive_id();
        (self.paths.hive_path(&id), id.0)
    }

    async fn refresh_ttl(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        let (key, value) = self.hive_key_value();
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(period) => {
                    if let Err(source) = self.store.update(&key, &value, self.hive_ttl).await {
                        self.fatal.trigger(&Fatal::RefreshTtl { key: key.clone(), source });
                        return;
                    }
                    debug!(hive = %value, "hive TTL updated in registry");
                }
            }
        }
        debug!(hive = %value, "TTL refresher stopped");
    }

    /// Registered hives and the store index the listing reflects.
    async fn read_hive_dir(&self, dir: &str) -> StoreResult<(u64, BTreeSet<HiveId>)> {
        match self.store.get(dir, false).await {
            Ok(listing) => {
                let hives = listing
                    .node
                    .nodes
                    .iter()
                    .filter_map(|node| self.paths.hive_id_from_path(&node.key))
                    .collect();
                Ok((listing.index, hives))
            }
            Err(e) if e.is_not_found() => Ok((0, BTreeSet::new())),
            Err(e) => Err(e),
        }
    }

    /// Re-reads the hive directory after the watch dropped changes and emits
    /// the joins and leaves that happened in the gap.
    async fn resync(&self, dir: &str, view: &mut HiveView) -> StoreResult<()> {
        let (index, hives) = self.read_hive_dir(dir).await?;
        for hive in hives.difference(&view.live) {
            self.ctx.emit(ClusterEvent::HiveJoined(hive.clone()));
        }
        for hive in view.live.difference(&hives) {
            self.ctx.emit(ClusterEvent::HiveLeft(hive.clone()));
        }
        info!(hives = hives.len(), index, "hive view resynced after lagging watch");
        *view = HiveView { index, live: hives };
        Ok(())
    }

    async fn watch_hives(self: Arc<Self>, cancel: CancellationToken) {
        let dir = self.paths.hive_dir();

        // Subscribe before taking the snapshot so nothing falls in between;
        // changes already contained in the snapshot are skipped by index.
        let mut changes = match self.store.watch(&dir, true).await {
            Ok(changes) => changes,
            Err(source) => {
                self.fatal.trigger(&Fatal::HiveDirectory { key: dir, source });
                return;
            }
        };
        let mut view = match self.read_hive_dir(&dir).await {
            Ok((index, live)) => HiveView { index, live },
            Err(source) => {
                self.fatal.trigger(&Fatal::HiveDirectory { key: dir, source });
                return;
            }
        };

        for hive in &view.live {
            self.ctx.emit(ClusterEvent::HiveJoined(hive.clone()));
        }

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                change = changes.next() => match change {
                    Some(Ok(change)) => {
                        if change.index <= view.index {
                            continue;
                        }
                        view.apply(&self.paths, &change);
                        match membership_event(&self.paths, &change, self.expire_as_leave) {
                            Some(event) => {
                                info!(?event, "hive membership changed");
                                self.ctx.emit(event);
                            }
                            None => trace!(
                                action = %change.action,
                                key = %change.node.key,
                                "received an update from registry"
                            ),
                        }
                    }
                    Some(Err(StoreError::WatchLagged { skipped, .. })) => {
                        warn!(dir = %dir, skipped, "hive watch lagged, re-reading hive directory");
                        if let Err(source) = self.resync(&dir, &mut view).await {
                            self.fatal.trigger(&Fatal::HiveDirectory { key: dir.clone(), source });
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        self.fatal.trigger(&Fatal::HiveWatch { key: dir.clone(), reason: e.to_string() });
                        return;
                    }
                    None => {
                        self.fatal.trigger(&Fatal::HiveWatch {
                            key: dir.clone(),
                            reason: "change stream closed".to_string(),
                        });
                        return;
                    }
                },
            }
        }
        debug!(dir = %dir, "hive watcher stopped");
    }
}

/// What the watcher believes the hive directory holds.
///
/// Tracks entries, not reported membership: an `expire` that is not reported
/// as a leave still removes the hive, so a later resync does not announce it.
struct HiveView {
    index: u64,
    live: BTreeSet<HiveId>,
}

impl HiveView {
    fn apply(&mut self, paths: &RegistryPaths, change: &Response) {
        let Some(hive) = paths.hive_id_from_path(&change.node.key) else {
            return;
        };
        match change.action {
            Action::Create | Action::Set | Action::Update => {
                self.live.insert(hive);
            }
            Action::Delete | Action::Expire => {
                self.live.remove(&hive);
            }
            Action::Get => {}
        }
        self.index = change.index;
    }
}

struct BackgroundTask {
    cancel: CancellationToken,
    done: JoinHandle<()>,
}

impl BackgroundTask {
    fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let done = tokio::spawn(f(cancel.clone()));
        Self { cancel, done }
    }

    /// Cancels the task and waits until it has exited.
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.done.await {
            warn!(error = %e, "registry background task did not exit cleanly");
        }
    }
}

struct Pollers {
    ttl: BackgroundTask,
    watch: BackgroundTask,
}

/// Keeps this hive registered and reports peers joining and leaving.
pub struct Membership {
    shared: Arc<Shared>,
    addrs: Vec<String>,
    refresh_interval: Duration,
    connected: AtomicBool,
    pollers: Mutex<Option<Pollers>>,
}

impl Membership {
    pub fn new(
        config: &RegistryConfig,
        store: Arc<dyn CoordStore>,
        ctx: Arc<dyn HiveContext>,
        fatal: FatalHandler,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                ctx,
                fatal,
                paths: RegistryPaths::new(config.prefix.clone()),
                hive_ttl: config.hive_ttl_opt(),
                expire_as_leave: config.expire_as_leave,
            }),
            addrs: config.addrs.clone(),
            refresh_interval: config.refresh_interval(),
            connected: AtomicBool::new(false),
            pollers: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Syncs with the store, registers this hive and starts the TTL refresher
    /// and the hive watcher.
    pub async fn start(&self) -> Result<()> {
        let shared = &self.shared;
        shared
            .store
            .sync_cluster()
            .await
            .map_err(|source| Fatal::ClusterSync {
                addrs: self.addrs.clone(),
                source,
            })?;
        self.connected.store(true, Ordering::SeqCst);

        shared.ctx.register_event(EventKind::HiveJoined);
        shared.ctx.register_event(EventKind::HiveLeft);

        let (key, value) = shared.hive_key_value();
        shared
            .store
            .create(&key, &value, shared.hive_ttl)
            .await
            .map_err(|source| Fatal::Register {
                key: key.clone(),
                source,
            })?;
        info!(hive = %value, key = %key, "hive registered");

        self.start_pollers();
        Ok(())
    }

    fn start_pollers(&self) {
        let period = self.refresh_interval;
        let ttl_shared = self.shared.clone();
        let ttl = BackgroundTask::spawn(move |cancel| ttl_shared.refresh_ttl(period, cancel));
        let watch_shared = self.shared.clone();
        let watch = BackgroundTask::spawn(move |cancel| watch_shared.watch_hives(cancel));

        *self.pollers.lock() = Some(Pollers { ttl, watch });
    }

    /// Stops both background tasks and removes this hive's entry. Does
    /// nothing if the hive never connected or is already disconnected.
    pub async fn disconnect(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let pollers = self.pollers.lock().take();
        if let Some(pollers) = pollers {
            pollers.watch.stop().await;
            pollers.ttl.stop().await;
        }

        let (key, value) = self.shared.hive_key_value();
        self.shared
            .store
            .delete(&key)
            .await
            .map_err(|source| Fatal::Unregister {
                key: key.clone(),
                source,
            })?;
        info!(hive = %value, "hive unregistered");
        Ok(())
    }

    /// Hives currently registered, sorted.
    pub async fn live_hives(&self) -> Result<Vec<HiveId>> {
        let dir = self.shared.paths.hive_dir();
        let (_, hives) = self.shared.read_hive_dir(&dir).await?;
        Ok(hives.into_iter().collect())
    }
}

impl std::fmt::Debug for Membership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Membership")
            .field("hive", &self.shared.ctx.hive_id())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Node;

    fn change(action: Action, key: &str, prev: Option<&str>) -> Response {
        Response {
            action,
            node: Node {
                key: key.to_string(),
                ..Node::default()
            },
            prev_node: prev.map(|v| Node {
                key: key.to_string(),
                value: Some(v.to_string()),
                ..Node::default()
            }),
            index: 1,
        }
    }

    #[test]
    fn test_membership_event_mapping() {
        let paths = RegistryPaths::new("beehive");
        let joined = ClusterEvent::HiveJoined("h1".into());
        let left = ClusterEvent::HiveLeft("h1".into());

        let cases = [
            (change(Action::Create, "beehive/hives/h1", None), false, Some(joined)),
            (change(Action::Delete, "beehive/hives/h1", Some("h1")), false, Some(left.clone())),
            (change(Action::Delete, "beehive/hives/h1", None), false, None),
            (change(Action::Update, "beehive/hives/h1", Some("h1")), false, None),
            (change(Action::Set, "beehive/hives/h1", None), false, None),
            (change(Action::Expire, "beehive/hives/h1", Some("h1")), false, None),
            (change(Action::Expire, "beehive/hives/h1", Some("h1")), true, Some(left)),
            (change(Action::Create, "beehive/apps/kv/__lock__", None), false, None),
        ];

        for (change, expire_as_leave, expected) in cases {
            assert_eq!(
                membership_event(&paths, &change, expire_as_leave),
                expected,
                "{} {}",
                change.action,
                change.node.key
            );
        }
    }
}
