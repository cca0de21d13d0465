//! Row mapping and view models used by repositories.
//!
//! Keep these focused on the shape of query results. Business rules live in
//! the aggregator, engagement and creation layers.

use crate::model::{
    ConversationId, Item, ItemId, ItemKind, Notification, NotificationKind, PermanentPost,
    Profile, UserId,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

pub(crate) const ITEM_COLUMNS: &str = "id, author_id, kind, content, media_url, background, \
     duration_secs, mentions, post_id, source_story_id, is_beam, created_at, expires_at";

pub(crate) const PROFILE_COLUMNS: &str = "id, handle, avatar_url, is_private, is_admin";

pub(crate) const POST_COLUMNS: &str = "id, author_id, caption, image_url, video_url";

pub(crate) fn item_from_row(row: &SqliteRow) -> Result<Item> {
    let id: ItemId = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    let kind = ItemKind::parse_kind(&kind)
        .ok_or_else(|| anyhow!("story {} has unknown kind {}", id, kind))?;
    let mentions: String = row.try_get("mentions")?;
    let mentions: Vec<UserId> = serde_json::from_str(&mentions)
        .with_context(|| format!("story {} has malformed mentions", id))?;

    Ok(Item {
        id,
        author_id: row.try_get("author_id")?,
        kind,
        content: row.try_get("content")?,
        media_url: row.try_get("media_url")?,
        background: row.try_get("background")?,
        duration_secs: row.try_get("duration_secs")?,
        mentions,
        post_id: row.try_get("post_id")?,
        source_item_id: row.try_get("source_story_id")?,
        is_beam: row.try_get("is_beam")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

pub(crate) fn profile_from_row(row: &SqliteRow) -> Result<Profile> {
    Ok(Profile {
        id: row.try_get("id")?,
        handle: row.try_get("handle")?,
        avatar_url: row.try_get("avatar_url")?,
        is_private: row.try_get("is_private")?,
        is_admin: row.try_get("is_admin")?,
    })
}

pub(crate) fn post_from_row(row: &SqliteRow) -> Result<PermanentPost> {
    Ok(PermanentPost {
        id: row.try_get("id")?,
        author_id: row.try_get("author_id")?,
        caption: row.try_get("caption")?,
        image_url: row.try_get("image_url")?,
        video_url: row.try_get("video_url")?,
    })
}

pub(crate) fn notification_from_row(row: &SqliteRow) -> Result<Notification> {
    let id: i64 = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    let kind = NotificationKind::parse_kind(&kind)
        .ok_or_else(|| anyhow!("notification {} has unknown kind {}", id, kind))?;
    Ok(Notification {
        id,
        recipient_id: row.try_get("recipient_id")?,
        actor_id: row.try_get("actor_id")?,
        kind,
        item_id: row.try_get("story_id")?,
        is_read: row.try_get("is_read")?,
        created_at: row.try_get("created_at")?,
    })
}

/// One row of an item's view list, joined with the viewer's like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerRecord {
    pub viewer_id: UserId,
    pub viewed_at: DateTime<Utc>,
    pub liked: bool,
}

/// Message row as written by the reply bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub media_url: Option<String>,
    pub item_id: Option<ItemId>,
}
