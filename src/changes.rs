//! Push-based change notifications for the story tables.
//!
//! The store publishes one [`ChangeEvent`] after every successful write.
//! Consumers hold a [`Subscription`] scoped to the tables they care about;
//! dropping it unsubscribes.
use crate::model::ItemId;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
pub enum Table {
    Stories,
    Views,
    Likes,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Stories => "stories",
            Table::Views => "story_views",
            Table::Likes => "story_likes",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Delete,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct ChangeEvent {
    pub table: Table,
    pub op: ChangeOp,
    pub item_id: ItemId,
}

/// What a subscriber observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    Changed(ChangeEvent),
    /// The subscriber fell behind and missed events; it must refetch everything.
    Resync,
}

#[derive(Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
    active: Arc<AtomicUsize>,
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn publish(&self, event: ChangeEvent) {
        // A send error only means nobody is listening.
        let receivers = self.tx.send(event).unwrap_or(0);
        debug!(
            table = event.table.as_str(),
            item_id = event.item_id,
            receivers,
            "change published"
        );
    }

    pub fn subscribe(&self, tables: &[Table]) -> Subscription {
        self.active.fetch_add(1, Ordering::SeqCst);
        Subscription {
            rx: self.tx.subscribe(),
            tables: tables.to_vec(),
            item: None,
            active: Arc::clone(&self.active),
        }
    }

    /// Live subscriptions, counted from subscribe until drop.
    pub fn subscriber_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<ChangeEvent>,
    tables: Vec<Table>,
    item: Option<ItemId>,
    active: Arc<AtomicUsize>,
}

impl Subscription {
    /// Narrow the subscription to a single item.
    pub fn for_item(mut self, item_id: ItemId) -> Self {
        self.item = Some(item_id);
        self
    }

    fn matches(&self, event: &ChangeEvent) -> bool {
        self.tables.contains(&event.table) && self.item.map_or(true, |id| id == event.item_id)
    }

    /// Wait for the next matching notice. `None` once the feed is gone.
    pub async fn recv(&mut self) -> Option<Notice> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.matches(&event) => return Some(Notice::Changed(event)),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "change subscriber lagged");
                    return Some(Notice::Resync);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Drain whatever is already queued without waiting.
    pub fn drain(&mut self) -> Vec<Notice> {
        let mut out = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.matches(&event) => out.push(Notice::Changed(event)),
                Ok(_) => {}
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "change subscriber lagged");
                    out.push(Notice::Resync);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return out,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
