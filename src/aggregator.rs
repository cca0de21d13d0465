//! Builds the viewer's story tray: live items, privacy-filtered, grouped per
//! author and ranked by read state.
use crate::changes::{Notice, Subscription, Table};
use crate::db::Store;
use crate::model::{
    AuthorGroup, Item, ItemId, PermanentPost, PostId, Profile, StoryEntry, StoryFeed, UserId,
};
use crate::social::SocialGraph;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Tables whose changes invalidate a feed snapshot.
pub const FEED_TABLES: [Table; 3] = [Table::Stories, Table::Views, Table::Likes];

#[derive(Clone)]
pub struct Aggregator {
    store: Store,
    graph: Arc<dyn SocialGraph>,
}

impl Aggregator {
    pub fn new(store: Store, graph: Arc<dyn SocialGraph>) -> Self {
        Self { store, graph }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Load the feed for `viewer`. Any fetch failure degrades to an empty feed.
    pub async fn load(&self, viewer: UserId, now: DateTime<Utc>) -> StoryFeed {
        match self.try_load(viewer, now).await {
            Ok(feed) => feed,
            Err(err) => {
                warn!(?err, viewer, "story feed unavailable; showing no stories");
                StoryFeed::default()
            }
        }
    }

    #[instrument(skip(self, now))]
    pub async fn try_load(&self, viewer: UserId, now: DateTime<Utc>) -> Result<StoryFeed> {
        let items = self.store.live_items(now).await?;
        if items.is_empty() {
            return Ok(StoryFeed::default());
        }

        let author_ids: Vec<UserId> = items
            .iter()
            .map(|i| i.author_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let post_ids: Vec<PostId> = items
            .iter()
            .filter_map(|i| i.post_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let (profiles, posts, viewed, following) = futures::try_join!(
            self.graph.profiles(&author_ids),
            self.store.posts(&post_ids),
            self.store.viewed_item_ids(viewer),
            self.graph.following(viewer),
        )?;

        let feed = assemble(viewer, items, profiles, posts, &viewed, &following);
        debug!(
            viewer,
            own = feed.own.is_some(),
            groups = feed.others.len(),
            "story feed assembled"
        );
        Ok(feed)
    }
}

/// Whether `viewer` may see items by `author`. An author missing from the
/// social graph is treated as private.
pub fn visible_to(
    viewer: UserId,
    author: UserId,
    profile: Option<&Profile>,
    following: &HashSet<UserId>,
) -> bool {
    let private = profile.map_or(true, |p| p.is_private);
    author == viewer || !private || following.contains(&author)
}

/// Pure part of the aggregation: filter, group, roll up and rank.
///
/// `items` must be live and sorted by creation time.
pub fn assemble(
    viewer: UserId,
    items: Vec<Item>,
    profiles: Vec<Profile>,
    posts: Vec<PermanentPost>,
    viewed: &HashSet<ItemId>,
    following: &HashSet<UserId>,
) -> StoryFeed {
    let profiles: HashMap<UserId, Profile> = profiles.into_iter().map(|p| (p.id, p)).collect();
    let posts: HashMap<PostId, PermanentPost> = posts.into_iter().map(|p| (p.id, p)).collect();

    let mut order: Vec<UserId> = Vec::new();
    let mut grouped: HashMap<UserId, Vec<StoryEntry>> = HashMap::new();

    for item in items {
        let author = item.author_id;
        if !visible_to(viewer, author, profiles.get(&author), following) {
            continue;
        }
        let post = item.post_id.and_then(|id| posts.get(&id).cloned());
        let entry = StoryEntry {
            viewed: viewed.contains(&item.id),
            post,
            item,
        };
        grouped
            .entry(author)
            .or_insert_with(|| {
                order.push(author);
                Vec::new()
            })
            .push(entry);
    }

    let mut own = None;
    let mut others = Vec::with_capacity(order.len());
    for author_id in order {
        let Some(entries) = grouped.remove(&author_id) else {
            continue;
        };
        let author = profiles
            .get(&author_id)
            .cloned()
            .unwrap_or_else(|| Profile::unknown(author_id));
        let group = AuthorGroup {
            fully_viewed: entries.iter().all(|e| e.viewed),
            author,
            items: entries,
        };
        if author_id == viewer {
            own = Some(group);
        } else {
            others.push(group);
        }
    }

    // Unviewed first, then most recently updated.
    others.sort_by(|a, b| {
        a.fully_viewed
            .cmp(&b.fully_viewed)
            .then_with(|| b.last_updated().cmp(&a.last_updated()))
    });

    StoryFeed { own, others }
}

/// A feed snapshot kept current by change notifications.
///
/// While held (a playback session is open) notifications are only recorded;
/// the snapshot is rebuilt once the hold is released.
pub struct LiveFeed {
    aggregator: Aggregator,
    viewer: UserId,
    subscription: Subscription,
    snapshot: StoryFeed,
    held: bool,
    dirty: bool,
}

impl LiveFeed {
    pub async fn open(aggregator: Aggregator, viewer: UserId) -> Self {
        // Subscribe before the first load so nothing written in between is lost.
        let subscription = aggregator.store().subscribe(&FEED_TABLES);
        let snapshot = aggregator.load(viewer, Utc::now()).await;
        Self {
            aggregator,
            viewer,
            subscription,
            snapshot,
            held: false,
            dirty: false,
        }
    }

    pub fn snapshot(&self) -> &StoryFeed {
        &self.snapshot
    }

    pub fn viewer(&self) -> UserId {
        self.viewer
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub async fn refresh(&mut self) -> &StoryFeed {
        self.subscription.drain();
        self.snapshot = self.aggregator.load(self.viewer, Utc::now()).await;
        self.dirty = false;
        &self.snapshot
    }

    /// Freeze the snapshot for the duration of a playback session.
    pub fn hold(&mut self) {
        self.held = true;
    }

    /// Playback closed: always rebuild so viewed state is reflected.
    pub async fn release(&mut self) -> &StoryFeed {
        self.held = false;
        self.refresh().await
    }

    /// Apply already-queued notifications without waiting. Returns whether the
    /// snapshot was rebuilt.
    pub async fn pump(&mut self) -> bool {
        if !self.subscription.drain().is_empty() {
            self.dirty = true;
        }
        if self.dirty && !self.held {
            self.refresh().await;
            return true;
        }
        false
    }

    /// Wait for the next change and rebuild. While held, changes accumulate
    /// and this keeps waiting. `None` once the change feed is gone.
    pub async fn next_update(&mut self) -> Option<&StoryFeed> {
        loop {
            if self.dirty && !self.held {
                return Some(self.refresh().await);
            }
            match self.subscription.recv().await? {
                Notice::Changed(ev) => {
                    debug!(table = ev.table.as_str(), item_id = ev.item_id, "feed invalidated");
                }
                Notice::Resync => info!(viewer = self.viewer, "feed resync"),
            }
            self.dirty = true;
        }
    }
}
