//! Database module: the SQLite-backed story store.
//!
//! - `model`: row mapping and view models returned by repositories.
//! - `repo`: SQL-only functions over a [`Pool`].
//!
//! [`Store`] wraps a pool together with the [`ChangeFeed`] and is what the
//! rest of the crate talks to: every successful story, view or like write is
//! followed by a change notification.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{StoredMessage, ViewerRecord};

use crate::changes::{ChangeEvent, ChangeFeed, ChangeOp, Subscription, Table};
use crate::error::StoryError;
use crate::model::{
    Item, ItemId, NewItem, Notification, NotificationKind, PermanentPost, PostId, UserId, View,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct Store {
    pool: Pool,
    changes: ChangeFeed,
}

impl Store {
    pub fn new(pool: Pool) -> Self {
        Self::with_feed(pool, ChangeFeed::default())
    }

    pub fn with_feed(pool: Pool, changes: ChangeFeed) -> Self {
        Self { pool, changes }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn changes(&self) -> &ChangeFeed {
        &self.changes
    }

    pub fn subscribe(&self, tables: &[Table]) -> Subscription {
        self.changes.subscribe(tables)
    }

    fn notify(&self, table: Table, op: ChangeOp, item_id: ItemId) {
        self.changes.publish(ChangeEvent { table, op, item_id });
    }

    pub async fn live_items(&self, now: DateTime<Utc>) -> Result<Vec<Item>> {
        repo::live_items(&self.pool, now).await
    }

    pub async fn live_items_by_author(
        &self,
        author_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Item>> {
        repo::live_items_by_author(&self.pool, author_id, now).await
    }

    /// Any item, expired or not.
    pub async fn item(&self, item_id: ItemId) -> Result<Option<Item>> {
        repo::get_item(&self.pool, item_id).await
    }

    pub async fn live_item(&self, item_id: ItemId, now: DateTime<Utc>) -> Result<Option<Item>> {
        repo::get_live_item(&self.pool, item_id, now).await
    }

    pub async fn post(&self, post_id: PostId) -> Result<Option<PermanentPost>> {
        repo::get_post(&self.pool, post_id).await
    }

    pub async fn posts(&self, ids: &[PostId]) -> Result<Vec<PermanentPost>> {
        repo::posts_by_ids(&self.pool, ids).await
    }

    pub async fn insert_item(&self, new: &NewItem) -> Result<Item> {
        let item = repo::insert_item(&self.pool, new).await?;
        self.notify(Table::Stories, ChangeOp::Insert, item.id);
        Ok(item)
    }

    pub async fn delete_item(&self, item_id: ItemId, requester: UserId) -> Result<(), StoryError> {
        repo::delete_item(&self.pool, item_id, requester).await?;
        self.notify(Table::Stories, ChangeOp::Delete, item_id);
        Ok(())
    }

    /// Uniqueness-tolerant: `Ok(false)` if the view already existed.
    pub async fn insert_view(
        &self,
        item_id: ItemId,
        viewer_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let inserted = repo::insert_view(&self.pool, item_id, viewer_id, at).await?;
        if inserted {
            self.notify(Table::Views, ChangeOp::Insert, item_id);
        }
        Ok(inserted)
    }

    pub async fn views_for_item(&self, item_id: ItemId) -> Result<Vec<View>> {
        repo::views_for_item(&self.pool, item_id).await
    }

    pub async fn viewed_item_ids(&self, viewer_id: UserId) -> Result<HashSet<ItemId>> {
        repo::viewed_item_ids(&self.pool, viewer_id).await
    }

    /// View list of an item, served only to the item's author.
    pub async fn owner_view_records(
        &self,
        item_id: ItemId,
        requester: UserId,
    ) -> Result<(i64, Vec<ViewerRecord>), StoryError> {
        let Some(item) = repo::get_item(&self.pool, item_id).await? else {
            return Err(StoryError::NotFound(format!("story {}", item_id)));
        };
        if item.author_id != requester {
            return Err(StoryError::Forbidden("only the author may list viewers"));
        }
        let count = repo::count_views(&self.pool, item_id).await?;
        let records = repo::viewer_records(&self.pool, item_id).await?;
        Ok((count, records))
    }

    pub async fn set_like(
        &self,
        item_id: ItemId,
        viewer_id: UserId,
        liked: bool,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = if liked {
            repo::upsert_like(&self.pool, item_id, viewer_id, at).await?
        } else {
            repo::delete_like(&self.pool, item_id, viewer_id).await?
        };
        if changed {
            let op = if liked { ChangeOp::Insert } else { ChangeOp::Delete };
            self.notify(Table::Likes, op, item_id);
        }
        Ok(changed)
    }

    pub async fn like_count(&self, item_id: ItemId) -> Result<i64> {
        repo::count_likes(&self.pool, item_id).await
    }

    pub async fn is_liked(&self, item_id: ItemId, viewer_id: UserId) -> Result<bool> {
        repo::like_exists(&self.pool, item_id, viewer_id).await
    }

    pub async fn notify_user(
        &self,
        recipient_id: UserId,
        actor_id: UserId,
        kind: NotificationKind,
        item_id: ItemId,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        repo::insert_notification(&self.pool, recipient_id, actor_id, kind, Some(item_id), at).await
    }

    pub async fn notifications(&self, recipient_id: UserId) -> Result<Vec<Notification>> {
        repo::notifications_for(&self.pool, recipient_id).await
    }
}
