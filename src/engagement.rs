//! Views, likes and the owner's view roster.
//!
//! View writes are fire-and-forget: a failure is logged and the viewer keeps
//! watching. Likes are optimistic: [`LikeState`] flips locally before the
//! write and the write is never rolled back on failure.
use crate::changes::{Notice, Subscription, Table};
use crate::db::Store;
use crate::error::StoryError;
use crate::model::{Item, ItemId, NotificationKind, Profile, UserId, ViewRoster, ViewerEntry};
use crate::social::SocialGraph;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Sink for views scheduled by playback.
#[async_trait]
pub trait ViewRecorder: Send + Sync {
    /// Returns whether a new view row was written.
    async fn record_view(&self, item_id: ItemId, viewer: UserId) -> bool;
}

/// Like state as shown to one viewer of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LikeState {
    authoritative: bool,
    provisional: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LikeAck {
    pub liked: bool,
    /// Play the like animation; only when transitioning into liked.
    pub celebrate: bool,
}

impl LikeState {
    pub fn new(authoritative: bool) -> Self {
        Self {
            authoritative,
            provisional: None,
        }
    }

    pub fn liked(&self) -> bool {
        self.provisional.unwrap_or(self.authoritative)
    }

    pub fn is_provisional(&self) -> bool {
        self.provisional.is_some()
    }

    pub fn toggle(&mut self) -> LikeAck {
        let liked = !self.liked();
        self.provisional = Some(liked);
        LikeAck {
            liked,
            celebrate: liked,
        }
    }

    /// Adopt the store's answer, e.g. after the next roster or feed load.
    pub fn reconcile(&mut self, authoritative: bool) {
        self.authoritative = authoritative;
        self.provisional = None;
    }
}

#[derive(Clone)]
pub struct EngagementTracker {
    store: Store,
    graph: Arc<dyn SocialGraph>,
}

impl EngagementTracker {
    pub fn new(store: Store, graph: Arc<dyn SocialGraph>) -> Self {
        Self { store, graph }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Idempotent per (item, viewer). Errors are logged and swallowed.
    pub async fn record_view(&self, item_id: ItemId, viewer: UserId) -> bool {
        match self.store.insert_view(item_id, viewer, Utc::now()).await {
            Ok(inserted) => {
                debug!(item_id, viewer, inserted, "view recorded");
                inserted
            }
            Err(err) => {
                warn!(?err, item_id, viewer, "failed to record view");
                false
            }
        }
    }

    /// Current like state; an unreadable store reads as not liked.
    pub async fn like_state(&self, item_id: ItemId, viewer: UserId) -> LikeState {
        match self.store.is_liked(item_id, viewer).await {
            Ok(liked) => LikeState::new(liked),
            Err(err) => {
                warn!(?err, item_id, viewer, "failed to read like state");
                LikeState::new(false)
            }
        }
    }

    /// Flip the local state, then persist it. The ack reflects the local flip
    /// whether or not the write succeeded.
    pub async fn toggle_like(&self, state: &mut LikeState, item: &Item, viewer: UserId) -> LikeAck {
        let ack = state.toggle();
        self.persist_like(item, viewer, ack.liked).await;
        ack
    }

    /// Write the like and, on a new like of someone else's item, notify the author.
    #[instrument(skip(self, item), fields(item_id = item.id))]
    pub async fn persist_like(&self, item: &Item, viewer: UserId, liked: bool) {
        let now = Utc::now();
        let changed = match self.store.set_like(item.id, viewer, liked, now).await {
            Ok(changed) => changed,
            Err(err) => {
                warn!(?err, liked, "failed to persist like; keeping local state");
                return;
            }
        };
        if !(changed && liked) || item.author_id == viewer {
            return;
        }
        if let Err(err) = self
            .store
            .notify_user(item.author_id, viewer, NotificationKind::StoryLike, item.id, now)
            .await
        {
            warn!(?err, recipient = item.author_id, "failed to send like notification");
        }
    }

    /// Who viewed the item and whether each viewer liked it. Author only.
    #[instrument(skip(self))]
    pub async fn view_roster(
        &self,
        item_id: ItemId,
        requester: UserId,
    ) -> Result<ViewRoster, StoryError> {
        let (count, records) = self.store.owner_view_records(item_id, requester).await?;
        let likes = self.store.like_count(item_id).await?;
        let ids: Vec<UserId> = records.iter().map(|r| r.viewer_id).collect();
        let profiles: HashMap<UserId, Profile> = self
            .graph
            .profiles(&ids)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let viewers = records
            .into_iter()
            .map(|r| ViewerEntry {
                viewer: profiles
                    .get(&r.viewer_id)
                    .cloned()
                    .unwrap_or_else(|| Profile::unknown(r.viewer_id)),
                viewed_at: r.viewed_at,
                liked: r.liked,
            })
            .collect();
        Ok(ViewRoster {
            item_id,
            count,
            likes,
            viewers,
        })
    }

    /// Roster that refreshes as views and likes arrive.
    pub async fn watch_roster(
        &self,
        item_id: ItemId,
        requester: UserId,
    ) -> Result<RosterWatch, StoryError> {
        let subscription = self
            .store
            .subscribe(&[Table::Views, Table::Likes])
            .for_item(item_id);
        let current = self.view_roster(item_id, requester).await?;
        info!(item_id, count = current.count, "watching view roster");
        Ok(RosterWatch {
            tracker: self.clone(),
            item_id,
            requester,
            subscription,
            current,
        })
    }
}

#[async_trait]
impl ViewRecorder for EngagementTracker {
    async fn record_view(&self, item_id: ItemId, viewer: UserId) -> bool {
        EngagementTracker::record_view(self, item_id, viewer).await
    }
}

/// Live roster for one item. Dropping it unsubscribes.
pub struct RosterWatch {
    tracker: EngagementTracker,
    item_id: ItemId,
    requester: UserId,
    subscription: Subscription,
    current: ViewRoster,
}

impl RosterWatch {
    pub fn current(&self) -> &ViewRoster {
        &self.current
    }

    /// Wait for the next view or like change and refetch. `None` once the
    /// change feed is gone.
    pub async fn next(&mut self) -> Option<Result<&ViewRoster, StoryError>> {
        match self.subscription.recv().await? {
            Notice::Changed(ev) => {
                debug!(table = ev.table.as_str(), item_id = ev.item_id, "roster invalidated")
            }
            Notice::Resync => debug!(item_id = self.item_id, "roster resync"),
        }
        self.subscription.drain();
        match self.tracker.view_roster(self.item_id, self.requester).await {
            Ok(roster) => {
                self.current = roster;
                Some(Ok(&self.current))
            }
            Err(err) => Some(Err(err)),
        }
    }
}
