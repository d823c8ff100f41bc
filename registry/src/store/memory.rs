use super::{Action, CoordStore, Node, Response, StoreError, StoreResult, WatchStream};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Changes buffered per watch before the watch is reported as lagging.
pub const WATCH_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
    modified_index: u64,
}

impl Entry {
    fn new(value: &str, ttl: Option<Duration>, index: u64) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
            modified_index: index,
        }
    }

    fn node(&self, key: &str) -> Node {
        Node {
            key: key.to_string(),
            value: Some(self.value.clone()),
            ttl: self
                .expires_at
                .map(|at| at.saturating_duration_since(Instant::now())),
            modified_index: self.modified_index,
            ..Node::default()
        }
    }
}

#[derive(Debug, Default)]
struct WatchBuf {
    events: VecDeque<Response>,
    skipped: u64,
    closed: bool,
}

/// Changes matching one watch, waiting to be read by its stream.
///
/// Only matching changes are queued, so traffic elsewhere in the store never
/// fills it. A full queue is dropped and the loss reported to the reader as a
/// single `WatchLagged`.
#[derive(Debug, Default)]
struct WatchQueue {
    buf: Mutex<WatchBuf>,
    notify: Notify,
}

impl WatchQueue {
    fn push(&self, response: Response) {
        {
            let mut buf = self.buf.lock();
            if buf.events.len() >= WATCH_CAPACITY {
                buf.skipped += buf.events.len() as u64 + 1;
                buf.events.clear();
            } else {
                buf.events.push_back(response);
            }
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.buf.lock().closed = true;
        self.notify.notify_one();
    }

    /// The next queued item, or `None` once the store is gone.
    async fn next(&self, key: &str) -> Option<StoreResult<Response>> {
        loop {
            {
                let mut buf = self.buf.lock();
                if buf.skipped > 0 {
                    let skipped = std::mem::take(&mut buf.skipped);
                    return Some(Err(StoreError::WatchLagged {
                        key: key.to_string(),
                        skipped,
                    }));
                }
                if let Some(response) = buf.events.pop_front() {
                    return Some(Ok(response));
                }
                if buf.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }
}

#[derive(Debug)]
struct Watcher {
    path: String,
    recursive: bool,
    queue: Weak<WatchQueue>,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    index: u64,
    watchers: Vec<Watcher>,
}

impl State {
    fn next_index(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    /// Queues `response` on every live watch of its key. Watches whose stream
    /// was dropped are forgotten.
    fn publish(&mut self, response: &Response) {
        self.watchers.retain(|watcher| {
            let Some(queue) = watcher.queue.upgrade() else {
                return false;
            };
            if watches(&watcher.path, watcher.recursive, &response.node.key) {
                queue.push(response.clone());
            }
            true
        });
    }

    fn is_dir(&self, path: &str) -> bool {
        let prefix = format!("{path}/");
        self.entries
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(key, _)| key.starts_with(&prefix))
    }

    /// A key cannot live below another key or replace a directory.
    fn check_file_path(&self, path: &str) -> StoreResult<()> {
        let mut parent = path;
        while let Some((head, _)) = parent.rsplit_once('/') {
            if self.entries.contains_key(head) {
                return Err(StoreError::NotAFile {
                    key: head.to_string(),
                });
            }
            parent = head;
        }
        if self.is_dir(path) {
            return Err(StoreError::NotAFile {
                key: path.to_string(),
            });
        }
        Ok(())
    }

    fn dir_node(&self, path: &str, recursive: bool) -> Option<Node> {
        let prefix = format!("{path}/");
        let mut children: BTreeMap<String, Node> = BTreeMap::new();

        for (key, entry) in self.entries.range(prefix.clone()..) {
            let Some(rest) = key.strip_prefix(&prefix) else {
                break;
            };
            match rest.split_once('/') {
                None => {
                    children.insert(key.clone(), entry.node(key));
                }
                Some((head, _)) => {
                    let child = format!("{prefix}{head}");
                    if children.contains_key(&child) {
                        continue;
                    }
                    let node = if recursive {
                        self.dir_node(&child, true)
                    } else {
                        None
                    };
                    let node = node.unwrap_or_else(|| Node {
                        key: child.clone(),
                        dir: true,
                        ..Node::default()
                    });
                    children.insert(child, node);
                }
            }
        }

        if children.is_empty() {
            return None;
        }
        Some(Node {
            key: path.to_string(),
            dir: true,
            nodes: children.into_values().collect(),
            ..Node::default()
        })
    }
}

/// An in-process coordination store.
///
/// Implements the same create/update/delete/watch contract as the replicated
/// store, with TTLs measured on the tokio clock. Expired keys are removed
/// (and announced with an `expire` event) on the next call or on
/// [`MemStore::purge_expired`].
#[derive(Debug)]
pub struct MemStore {
    state: Mutex<State>,
    available: AtomicBool,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
        }
    }

    /// While unavailable every call fails with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Removes every key whose TTL has run out.
    pub fn purge_expired(&self) {
        let mut state = self.state.lock();
        Self::expire_locked(&mut state);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("store is offline".to_string()))
        }
    }

    fn expire_locked(state: &mut State) {
        let now = Instant::now();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at.is_some_and(|at| at <= now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            if let Some(entry) = state.entries.remove(&key) {
                let index = state.next_index();
                trace!(%key, "key expired");
                state.publish(&Response {
                    action: Action::Expire,
                    node: Node {
                        key: key.clone(),
                        modified_index: index,
                        ..Node::default()
                    },
                    prev_node: Some(entry.node(&key)),
                    index,
                });
            }
        }
    }

    fn write(
        &self,
        action: Action,
        path: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<Response> {
        self.check_available()?;
        let mut state = self.state.lock();
        Self::expire_locked(&mut state);
        state.check_file_path(path)?;

        let prev = state.entries.get(path).map(|entry| entry.node(path));
        match (action, &prev) {
            (Action::Create, Some(_)) => {
                return Err(StoreError::NodeExist {
                    key: path.to_string(),
                })
            }
            (Action::Update, None) => {
                return Err(StoreError::KeyNotFound {
                    key: path.to_string(),
                })
            }
            _ => {}
        }

        let index = state.next_index();
        let entry = Entry::new(value, ttl, index);
        let node = entry.node(path);
        state.entries.insert(path.to_string(), entry);

        let response = Response {
            action,
            node,
            prev_node: prev,
            index,
        };
        state.publish(&response);
        Ok(response)
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemStore {
    fn drop(&mut self) {
        for watcher in self.state.get_mut().watchers.drain(..) {
            if let Some(queue) = watcher.queue.upgrade() {
                queue.close();
            }
        }
    }
}

fn watches(path: &str, recursive: bool, key: &str) -> bool {
    key == path
        || (recursive
            && key
                .strip_prefix(path)
                .is_some_and(|rest| rest.starts_with('/')))
}

#[async_trait]
impl CoordStore for MemStore {
    async fn sync_cluster(&self) -> StoreResult<()> {
        self.check_available()
    }

    async fn create(&self, path: &str, value: &str, ttl: Option<Duration>) -> StoreResult<Response> {
        self.write(Action::Create, path, value, ttl)
    }

    async fn update(&self, path: &str, value: &str, ttl: Option<Duration>) -> StoreResult<Response> {
        self.write(Action::Update, path, value, ttl)
    }

    async fn set(&self, path: &str, value: &str, ttl: Option<Duration>) -> StoreResult<Response> {
        self.write(Action::Set, path, value, ttl)
    }

    async fn delete(&self, path: &str) -> StoreResult<Response> {
        self.check_available()?;
        let mut state = self.state.lock();
        Self::expire_locked(&mut state);

        if state.is_dir(path) {
            return Err(StoreError::NotAFile {
                key: path.to_string(),
            });
        }
        let Some(entry) = state.entries.remove(path) else {
            return Err(StoreError::KeyNotFound {
                key: path.to_string(),
            });
        };

        let index = state.next_index();
        let response = Response {
            action: Action::Delete,
            node: Node {
                key: path.to_string(),
                modified_index: index,
                ..Node::default()
            },
            prev_node: Some(entry.node(path)),
            index,
        };
        state.publish(&response);
        Ok(response)
    }

    async fn get(&self, path: &str, recursive: bool) -> StoreResult<Response> {
        self.check_available()?;
        let mut state = self.state.lock();
        Self::expire_locked(&mut state);

        let node = match state.entries.get(path) {
            Some(entry) => entry.node(path),
            None => state
                .dir_node(path, recursive)
                .ok_or_else(|| StoreError::KeyNotFound {
                    key: path.to_string(),
                })?,
        };

        Ok(Response {
            action: Action::Get,
            node,
            prev_node: None,
            index: state.index,
        })
    }

    async fn watch(&self, path: &str, recursive: bool) -> StoreResult<WatchStream> {
        self.check_available()?;
        let queue = Arc::new(WatchQueue::default());
        {
            let mut state = self.state.lock();
            state.watchers.push(Watcher {
                path: path.to_string(),
                recursive,
                queue: Arc::downgrade(&queue),
            });
            debug!(path, recursive, watches = state.watchers.len(), "watch registered");
        }

        let key = path.to_string();
        let stream = futures::stream::unfold((queue, key), |(queue, key)| async move {
            let item = queue.next(&key).await?;
            Some((item, (queue, key)))
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_is_exclusive() {
        let store = MemStore::new();
        store.create("a/b", "1", None).await.unwrap();

        let err = store.create("a/b", "2", None).await.unwrap_err();
        assert!(err.is_node_exist());
        assert_eq!(store.get("a/b", false).await.unwrap().node.value(), "1");
    }

    #[tokio::test]
    async fn test_update_and_delete_need_existing_key() {
        let store = MemStore::new();
        assert!(store.update("k", "v", None).await.unwrap_err().is_not_found());
        assert!(store.delete("k").await.unwrap_err().is_not_found());

        store.set("k", "v1", None).await.unwrap();
        let res = store.update("k", "v2", None).await.unwrap();
        assert_eq!(res.action, Action::Update);
        assert_eq!(res.prev_node.unwrap().value(), "v1");

        let res = store.delete("k").await.unwrap();
        assert_eq!(res.prev_node.unwrap().value(), "v2");
    }

    #[tokio::test]
    async fn test_directory_listing() {
        let store = MemStore::new();
        store.create("root/hives/a", "a", None).await.unwrap();
        store.create("root/hives/b", "b", None).await.unwrap();
        store.create("root/apps/kv/d/k", "x", None).await.unwrap();

        let dir = store.get("root/hives", false).await.unwrap().node;
        assert!(dir.dir);
        let keys: Vec<_> = dir.nodes.iter().map(|n| n.key.as_str()).collect();
        assert_eq!(keys, vec!["root/hives/a", "root/hives/b"]);

        let root = store.get("root", true).await.unwrap().node;
        assert_eq!(root.nodes.len(), 2);
        assert_eq!(root.nodes[0].key, "root/apps");
        assert_eq!(root.nodes[0].nodes[0].nodes[0].nodes[0].key, "root/apps/kv/d/k");

        assert!(store.get("root/nothing", false).await.unwrap_err().is_not_found());
        assert!(matches!(
            store.create("root/hives/a/x", "", None).await,
            Err(StoreError::NotAFile { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_and_refresh() {
        let store = MemStore::new();
        let ttl = Some(Duration::from_secs(10));
        store.create("hive", "h", ttl).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        store.update("hive", "h", ttl).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.get("hive", false).await.is_ok());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(store.get("hive", false).await.unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_delivers_matching_changes() {
        let store = MemStore::new();
        let mut dir = store.watch("root/hives", true).await.unwrap();
        let mut key = store.watch("root/hives/a", false).await.unwrap();

        store.create("root/other", "", None).await.unwrap();
        store.create("root/hives/a", "a", Some(Duration::from_secs(1))).await.unwrap();
        store.create("root/hives/b", "b", None).await.unwrap();

        let ev = dir.next().await.unwrap().unwrap();
        assert_eq!((ev.action, ev.node.key.as_str()), (Action::Create, "root/hives/a"));
        let ev = dir.next().await.unwrap().unwrap();
        assert_eq!(ev.node.key, "root/hives/b");

        tokio::time::advance(Duration::from_secs(2)).await;
        store.purge_expired();

        let ev = key.next().await.unwrap().unwrap();
        assert_eq!(ev.action, Action::Create);
        let ev = key.next().await.unwrap().unwrap();
        assert_eq!(ev.action, Action::Expire);
        assert_eq!(ev.prev_node.unwrap().value(), "a");
    }

    #[tokio::test]
    async fn test_unrelated_traffic_never_fills_a_watch() {
        let store = MemStore::new();
        let mut hives = store.watch("root/hives", true).await.unwrap();

        for i in 0..WATCH_CAPACITY * 2 {
            store.set(&format!("root/apps/kv/d/{i}"), "x", None).await.unwrap();
        }
        store.create("root/hives/a", "a", None).await.unwrap();

        let ev = hives.next().await.unwrap().unwrap();
        assert_eq!((ev.action, ev.node.key.as_str()), (Action::Create, "root/hives/a"));
        assert_eq!(store.state.lock().watchers.len(), 1);
    }

    #[tokio::test]
    async fn test_overflowing_watch_reports_lag_then_resumes() {
        let store = MemStore::new();
        let mut changes = store.watch("k", false).await.unwrap();

        let writes = WATCH_CAPACITY + 10;
        for i in 0..writes {
            store.set("k", &i.to_string(), None).await.unwrap();
        }

        match changes.next().await.unwrap() {
            Err(StoreError::WatchLagged { key, skipped }) => {
                assert_eq!(key, "k");
                assert_eq!(skipped, WATCH_CAPACITY as u64 + 1);
            }
            other => panic!("expected a lag, got {other:?}"),
        }

        let mut rest = Vec::new();
        for _ in 0..writes - WATCH_CAPACITY - 1 {
            rest.push(changes.next().await.unwrap().unwrap().node.value().to_string());
        }
        assert_eq!(rest.last().map(String::as_str), Some((writes - 1).to_string().as_str()));
    }

    #[tokio::test]
    async fn test_dropped_watch_is_forgotten_and_store_drop_ends_streams() {
        let store = MemStore::new();
        let dropped = store.watch("a", false).await.unwrap();
        let mut kept = store.watch("b", false).await.unwrap();
        drop(dropped);

        store.set("a", "1", None).await.unwrap();
        assert_eq!(store.state.lock().watchers.len(), 1);

        drop(store);
        assert!(kept.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemStore::new();
        store.set_available(false);
        assert!(matches!(store.sync_cluster().await, Err(StoreError::Unavailable(_))));
        assert!(matches!(store.create("k", "v", None).await, Err(StoreError::Unavailable(_))));

        store.set_available(true);
        assert!(store.create("k", "v", None).await.is_ok());
    }
}
