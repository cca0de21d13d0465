use super::model::{
    item_from_row, notification_from_row, post_from_row, profile_from_row, StoredMessage,
    ViewerRecord, ITEM_COLUMNS, POST_COLUMNS, PROFILE_COLUMNS,
};
use crate::error::StoryError;
use crate::model::{
    expiry_for, ConversationId, Item, ItemId, NewItem, Notification, NotificationKind,
    PermanentPost, PostId, Profile, UserId, View,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashSet;
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {}", normalized))?
        .create_if_missing(true);
    let pool = SqlitePool::connect_with(options)
        .await
        .with_context(|| format!("failed to open database {}", normalized))?;
    // WAL lets the aggregator read while views and likes are being written.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// For file-backed SQLite URLs: expand a leading `~/` and create the parent
/// directory. In-memory and non-sqlite URLs pass through unchanged.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }

    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{}?{}", path, q),
        None => format!("sqlite://{}", path),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Social graph mirror
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn upsert_profile(pool: &Pool, profile: &Profile) -> Result<()> {
    sqlx::query(
        "INSERT INTO profiles (id, handle, avatar_url, is_private, is_admin) \
         VALUES (?, ?, ?, ?, ?) ON CONFLICT(id) DO UPDATE SET handle = excluded.handle, \
         avatar_url = excluded.avatar_url, \
         is_private = excluded.is_private, is_admin = excluded.is_admin",
    )
    .bind(profile.id)
    .bind(&profile.handle)
    .bind(&profile.avatar_url)
    .bind(profile.is_private)
    .bind(profile.is_admin)
    .execute(pool)
    .await
    .context("failed to upsert profile")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn follow(pool: &Pool, follower_id: UserId, followee_id: UserId) -> Result<()> {
    sqlx::query(
        "INSERT INTO follows (follower_id, followee_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
    )
    .bind(follower_id)
    .bind(followee_id)
    .execute(pool)
    .await
    .context("failed to insert follow")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn profiles_by_ids(pool: &Pool, ids: &[UserId]) -> Result<Vec<Profile>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("SELECT {} FROM profiles WHERE id IN (", PROFILE_COLUMNS));
    let mut list = qb.separated(", ");
    for id in ids {
        list.push_bind(*id);
    }
    list.push_unseparated(")");
    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(profile_from_row).collect()
}

#[instrument(skip_all)]
pub async fn profiles_by_handles(pool: &Pool, handles: &[String]) -> Result<Vec<Profile>> {
    if handles.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "SELECT {} FROM profiles WHERE lower(handle) IN (",
        PROFILE_COLUMNS
    ));
    let mut list = qb.separated(", ");
    for handle in handles {
        list.push_bind(handle.to_lowercase());
    }
    list.push_unseparated(")");
    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(profile_from_row).collect()
}

#[instrument(skip_all)]
pub async fn following_ids(pool: &Pool, viewer_id: UserId) -> Result<HashSet<UserId>> {
    let ids: Vec<UserId> =
        sqlx::query_scalar("SELECT followee_id FROM follows WHERE follower_id = ?")
            .bind(viewer_id)
            .fetch_all(pool)
            .await?;
    Ok(ids.into_iter().collect())
}

async fn is_admin(pool: &Pool, user_id: UserId) -> Result<bool> {
    let admin: Option<bool> = sqlx::query_scalar("SELECT is_admin FROM profiles WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(admin.unwrap_or(false))
}

// ---------------------------------------------------------------------------
// Permanent posts (read-only from the stories side, insert for seeding)
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn insert_post(pool: &Pool, post: &PermanentPost) -> Result<PostId> {
    let rec = sqlx::query(
        "INSERT INTO posts (id, author_id, caption, image_url, video_url) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(post.id)
    .bind(post.author_id)
    .bind(&post.caption)
    .bind(&post.image_url)
    .bind(&post.video_url)
    .fetch_one(pool)
    .await
    .context("failed to insert post")?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn get_post(pool: &Pool, post_id: PostId) -> Result<Option<PermanentPost>> {
    let row = sqlx::query(&format!("SELECT {} FROM posts WHERE id = ?", POST_COLUMNS))
        .bind(post_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(post_from_row).transpose()
}

/// Resolve many posts in one round trip.
#[instrument(skip_all)]
pub async fn posts_by_ids(pool: &Pool, ids: &[PostId]) -> Result<Vec<PermanentPost>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("SELECT {} FROM posts WHERE id IN (", POST_COLUMNS));
    let mut list = qb.separated(", ");
    for id in ids {
        list.push_bind(*id);
    }
    list.push_unseparated(")");
    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(post_from_row).collect()
}

// ---------------------------------------------------------------------------
// Stories
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn insert_item(pool: &Pool, new: &NewItem) -> Result<Item> {
    let expires_at = expiry_for(new.created_at);
    let mentions = serde_json::to_string(&new.mentions)?;
    let rec = sqlx::query(
        "INSERT INTO stories (author_id, kind, content, media_url, background, duration_secs, \
         mentions, post_id, source_story_id, is_beam, created_at, expires_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(new.author_id)
    .bind(new.kind.as_str())
    .bind(&new.content)
    .bind(&new.media_url)
    .bind(&new.background)
    .bind(new.duration_secs)
    .bind(&mentions)
    .bind(new.post_id)
    .bind(new.source_item_id)
    .bind(new.is_beam)
    .bind(new.created_at)
    .bind(expires_at)
    .fetch_one(pool)
    .await
    .context("failed to insert story")?;

    Ok(Item {
        id: rec.get("id"),
        author_id: new.author_id,
        kind: new.kind,
        content: new.content.clone(),
        media_url: new.media_url.clone(),
        background: new.background.clone(),
        duration_secs: new.duration_secs,
        mentions: new.mentions.clone(),
        post_id: new.post_id,
        source_item_id: new.source_item_id,
        is_beam: new.is_beam,
        created_at: new.created_at,
        expires_at,
    })
}

/// Fetch a story regardless of expiry.
#[instrument(skip_all)]
pub async fn get_item(pool: &Pool, item_id: ItemId) -> Result<Option<Item>> {
    let row = sqlx::query(&format!("SELECT {} FROM stories WHERE id = ?", ITEM_COLUMNS))
        .bind(item_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(item_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn get_live_item(
    pool: &Pool,
    item_id: ItemId,
    now: DateTime<Utc>,
) -> Result<Option<Item>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM stories WHERE id = ? AND expires_at > ?",
        ITEM_COLUMNS
    ))
    .bind(item_id)
    .bind(now)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(item_from_row).transpose()
}

/// All non-expired stories, oldest first.
#[instrument(skip_all)]
pub async fn live_items(pool: &Pool, now: DateTime<Utc>) -> Result<Vec<Item>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM stories WHERE expires_at > ? ORDER BY created_at ASC, id ASC",
        ITEM_COLUMNS
    ))
    .bind(now)
    .fetch_all(pool)
    .await?;
    rows.iter().map(item_from_row).collect()
}

#[instrument(skip_all)]
pub async fn live_items_by_author(
    pool: &Pool,
    author_id: UserId,
    now: DateTime<Utc>,
) -> Result<Vec<Item>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM stories WHERE author_id = ? AND expires_at > ? \
         ORDER BY created_at ASC, id ASC",
        ITEM_COLUMNS
    ))
    .bind(author_id)
    .bind(now)
    .fetch_all(pool)
    .await?;
    rows.iter().map(item_from_row).collect()
}

/// Delete a story on behalf of `requester`. Only the author or an admin may.
#[instrument(skip_all)]
pub async fn delete_item(pool: &Pool, item_id: ItemId, requester: UserId) -> Result<()> {
    let Some(item) = get_item(pool, item_id).await? else {
        return Err(StoryError::NotFound(format!("story {}", item_id)).into());
    };
    if item.author_id != requester && !is_admin(pool, requester).await? {
        return Err(StoryError::Forbidden("only the author or an admin may delete a story").into());
    }
    sqlx::query("DELETE FROM stories WHERE id = ?")
        .bind(item_id)
        .execute(pool)
        .await
        .context("failed to delete story")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// Returns `false` when the viewer had already seen the item.
#[instrument(skip_all)]
pub async fn insert_view(
    pool: &Pool,
    item_id: ItemId,
    viewer_id: UserId,
    viewed_at: DateTime<Utc>,
) -> Result<bool> {
    let res =
        sqlx::query("INSERT INTO story_views (story_id, viewer_id, viewed_at) VALUES (?, ?, ?)")
            .bind(item_id)
            .bind(viewer_id)
            .bind(viewed_at)
            .execute(pool)
            .await;
    match res {
        Ok(_) => Ok(true),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Ok(false),
        Err(err) => Err(err).context("failed to insert story view"),
    }
}

#[instrument(skip_all)]
pub async fn views_for_item(pool: &Pool, item_id: ItemId) -> Result<Vec<View>> {
    let rows = sqlx::query(
        "SELECT story_id, viewer_id, viewed_at FROM story_views WHERE story_id = ? \
         ORDER BY viewed_at DESC",
    )
    .bind(item_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(View {
                item_id: row.try_get("story_id")?,
                viewer_id: row.try_get("viewer_id")?,
                viewed_at: row.try_get("viewed_at")?,
            })
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn viewed_item_ids(pool: &Pool, viewer_id: UserId) -> Result<HashSet<ItemId>> {
    let ids: Vec<ItemId> =
        sqlx::query_scalar("SELECT story_id FROM story_views WHERE viewer_id = ?")
            .bind(viewer_id)
            .fetch_all(pool)
            .await?;
    Ok(ids.into_iter().collect())
}

#[instrument(skip_all)]
pub async fn count_views(pool: &Pool, item_id: ItemId) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM story_views WHERE story_id = ?")
        .bind(item_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Viewers of an item, newest first, each flagged with whether they liked it.
#[instrument(skip_all)]
pub async fn viewer_records(pool: &Pool, item_id: ItemId) -> Result<Vec<ViewerRecord>> {
    let rows = sqlx::query(
        "SELECT v.viewer_id, v.viewed_at, CASE WHEN l.viewer_id IS NULL THEN 0 ELSE 1 END AS liked \
         FROM story_views v \
         LEFT JOIN story_likes l ON l.story_id = v.story_id AND l.viewer_id = v.viewer_id \
         WHERE v.story_id = ? \
         ORDER BY v.viewed_at DESC",
    )
    .bind(item_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(ViewerRecord {
                viewer_id: row.try_get("viewer_id")?,
                viewed_at: row.try_get("viewed_at")?,
                liked: row.try_get::<i64, _>("liked")? != 0,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Likes
// ---------------------------------------------------------------------------

/// Returns `true` if the like did not exist before.
#[instrument(skip_all)]
pub async fn upsert_like(
    pool: &Pool,
    item_id: ItemId,
    viewer_id: UserId,
    at: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "INSERT INTO story_likes (story_id, viewer_id, created_at) VALUES (?, ?, ?) \
         ON CONFLICT(story_id, viewer_id) DO NOTHING",
    )
    .bind(item_id)
    .bind(viewer_id)
    .bind(at)
    .execute(pool)
    .await
    .context("failed to upsert story like")?;
    Ok(res.rows_affected() > 0)
}

/// Returns `true` if a like was removed.
#[instrument(skip_all)]
pub async fn delete_like(pool: &Pool, item_id: ItemId, viewer_id: UserId) -> Result<bool> {
    let res = sqlx::query("DELETE FROM story_likes WHERE story_id = ? AND viewer_id = ?")
        .bind(item_id)
        .bind(viewer_id)
        .execute(pool)
        .await
        .context("failed to delete story like")?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn like_exists(pool: &Pool, item_id: ItemId, viewer_id: UserId) -> Result<bool> {
    let found: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM story_likes WHERE story_id = ? AND viewer_id = ?")
            .bind(item_id)
            .bind(viewer_id)
            .fetch_optional(pool)
            .await?;
    Ok(found.is_some())
}

#[instrument(skip_all)]
pub async fn count_likes(pool: &Pool, item_id: ItemId) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM story_likes WHERE story_id = ?")
        .bind(item_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn insert_notification(
    pool: &Pool,
    recipient_id: UserId,
    actor_id: UserId,
    kind: NotificationKind,
    item_id: Option<ItemId>,
    at: DateTime<Utc>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO notifications (recipient_id, actor_id, kind, story_id, created_at) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(recipient_id)
    .bind(actor_id)
    .bind(kind.as_str())
    .bind(item_id)
    .bind(at)
    .fetch_one(pool)
    .await
    .context("failed to insert notification")?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn notifications_for(pool: &Pool, recipient_id: UserId) -> Result<Vec<Notification>> {
    let rows = sqlx::query(
        "SELECT id, recipient_id, actor_id, kind, story_id, is_read, created_at \
         FROM notifications WHERE recipient_id = ? ORDER BY created_at DESC, id DESC",
    )
    .bind(recipient_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(notification_from_row).collect()
}

// ---------------------------------------------------------------------------
// Messaging mirror
// ---------------------------------------------------------------------------

fn ordered_pair(a: UserId, b: UserId) -> (UserId, UserId) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

#[instrument(skip_all)]
pub async fn find_conversation(
    pool: &Pool,
    a: UserId,
    b: UserId,
) -> Result<Option<ConversationId>> {
    let (lo, hi) = ordered_pair(a, b);
    let id = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM conversations WHERE user_a = ? AND user_b = ?",
    )
    .bind(lo)
    .bind(hi)
    .fetch_optional(pool)
    .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn get_or_create_conversation(
    pool: &Pool,
    a: UserId,
    b: UserId,
) -> Result<ConversationId> {
    if let Some(id) = find_conversation(pool, a, b).await? {
        return Ok(id);
    }
    let (lo, hi) = ordered_pair(a, b);
    let rec = sqlx::query("INSERT INTO conversations (user_a, user_b) VALUES (?, ?) RETURNING id")
        .bind(lo)
        .bind(hi)
        .fetch_one(pool)
        .await
        .context("failed to create conversation")?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn insert_message(
    pool: &Pool,
    conversation_id: ConversationId,
    sender_id: UserId,
    content: &str,
    media_url: Option<&str>,
    item_id: Option<ItemId>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO messages (conversation_id, sender_id, content, media_url, story_id) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(conversation_id)
    .bind(sender_id)
    .bind(content)
    .bind(media_url)
    .bind(item_id)
    .fetch_one(pool)
    .await
    .context("failed to insert message")?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn messages_in(
    pool: &Pool,
    conversation_id: ConversationId,
) -> Result<Vec<StoredMessage>> {
    let rows = sqlx::query(
        "SELECT id, conversation_id, sender_id, content, media_url, story_id \
         FROM messages WHERE conversation_id = ? ORDER BY id ASC",
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(StoredMessage {
                id: row.try_get("id")?,
                conversation_id: row.try_get("conversation_id")?,
                sender_id: row.try_get("sender_id")?,
                content: row.try_get("content")?,
                media_url: row.try_get("media_url")?,
                item_id: row.try_get("story_id")?,
            })
        })
        .collect()
}
