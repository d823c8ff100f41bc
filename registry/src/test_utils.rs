use crate::{
    config::RegistryConfig,
    error::{Fatal, Result},
    events::{ChannelContext, ClusterEvent},
    fatal::FatalHandler,
    registry::Registry,
    store::{CoordStore, MemStore},
    HiveId,
};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

/// Collects fatal conditions instead of aborting.
#[derive(Debug)]
pub struct RecordingFatal {
    seen: Arc<Mutex<Vec<Fatal>>>,
    tx: mpsc::UnboundedSender<Fatal>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Fatal>>,
}

impl RecordingFatal {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn handler(&self) -> FatalHandler {
        let seen = self.seen.clone();
        let tx = self.tx.clone();
        FatalHandler::new(move |fatal| {
            seen.lock().push(fatal.clone());
            let _ = tx.send(fatal.clone());
        })
    }

    pub fn seen(&self) -> Vec<Fatal> {
        self.seen.lock().clone()
    }

    /// Waits for the next recorded condition.
    pub async fn next(&self) -> Option<Fatal> {
        self.rx.lock().await.recv().await
    }
}

impl Default for RecordingFatal {
    fn default() -> Self {
        Self::new()
    }
}

/// A config that enables the registry with a placeholder address.
pub fn test_config() -> RegistryConfig {
    RegistryConfig::with_addrs(["mem://test"])
}

/// A hive connected to a shared in-memory store.
#[derive(Debug)]
pub struct TestHive {
    pub id: HiveId,
    pub ctx: Arc<ChannelContext>,
    pub registry: Registry,
    pub events: mpsc::UnboundedReceiver<ClusterEvent>,
}

impl TestHive {
    pub async fn start(
        store: &Arc<MemStore>,
        config: &RegistryConfig,
        id: &str,
        fatal: FatalHandler,
    ) -> Result<Self> {
        let (ctx, events) = ChannelContext::new(id);
        let ctx = Arc::new(ctx);
        let shared: Arc<dyn CoordStore> = store.clone();
        let registry = Registry::connect(config, ctx.clone(), fatal, move |_| shared)
            .await?
            .ok_or(crate::Error::NotConnected)?;

        Ok(Self {
            id: HiveId::from(id),
            ctx,
            registry,
            events,
        })
    }

    /// Next membership event, or `None` if none arrives within five seconds.
    pub async fn next_event(&mut self) -> Option<ClusterEvent> {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .ok()
            .flatten()
    }

    /// Waits for `count` events and returns them in arrival order.
    pub async fn take_events(&mut self, count: usize) -> Vec<ClusterEvent> {
        let mut events = Vec::with_capacity(count);
        while events.len() < count {
            match self.next_event().await {
                Some(event) => events.push(event),
                None => break,
            }
        }
        events
    }
}

/// Starts `ids.len()` hives on one store, one after another.
pub async fn test_cluster(
    config: &RegistryConfig,
    ids: &[&str],
    fatal: &RecordingFatal,
) -> (Arc<MemStore>, Vec<TestHive>) {
    let store = Arc::new(MemStore::new());
    let mut hives = Vec::with_capacity(ids.len());
    for id in ids {
        let hive = TestHive::start(&store, config, id, fatal.handler())
            .await
            .unwrap_or_else(|e| panic!("cannot start hive {id}: {e}"));
        hives.push(hive);
    }
    (store, hives)
}
