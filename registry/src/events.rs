use crate::HiveId;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

/// Membership changes. Every hive emits these for every hive, itself
/// included.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClusterEvent {
    HiveJoined(HiveId),
    HiveLeft(HiveId),
}

impl ClusterEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ClusterEvent::HiveJoined(_) => EventKind::HiveJoined,
            ClusterEvent::HiveLeft(_) => EventKind::HiveLeft,
        }
    }

    pub fn hive(&self) -> &HiveId {
        match self {
            ClusterEvent::HiveJoined(id) | ClusterEvent::HiveLeft(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    HiveJoined,
    HiveLeft,
}

/// What the registry needs from the hosting hive.
pub trait HiveContext: Send + Sync {
    fn hive_id(&self) -> HiveId;

    /// Called once per event kind before any event of that kind is emitted.
    fn register_event(&self, kind: EventKind);

    fn emit(&self, event: ClusterEvent);
}

/// A [`HiveContext`] that forwards events into a channel.
#[derive(Debug)]
pub struct ChannelContext {
    id: HiveId,
    tx: mpsc::UnboundedSender<ClusterEvent>,
    registered: Mutex<Vec<EventKind>>,
}

impl ChannelContext {
    pub fn new(id: impl Into<HiveId>) -> (Self, mpsc::UnboundedReceiver<ClusterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = Self {
            id: id.into(),
            tx,
            registered: Mutex::new(Vec::new()),
        };
        (ctx, rx)
    }

    pub fn registered(&self) -> Vec<EventKind> {
        self.registered.lock().clone()
    }
}

impl HiveContext for ChannelContext {
    fn hive_id(&self) -> HiveId {
        self.id.clone()
    }

    fn register_event(&self, kind: EventKind) {
        let mut registered = self.registered.lock();
        if !registered.contains(&kind) {
            registered.push(kind);
        }
    }

    fn emit(&self, event: ClusterEvent) {
        if self.tx.send(event).is_err() {
            warn!(hive = %self.id, "cluster event dropped, receiver is gone");
        }
    }
}
