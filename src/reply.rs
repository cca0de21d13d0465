//! Story replies, delivered as direct messages to the author.
use crate::db::{self, Pool, Store};
use crate::error::StoryError;
use crate::model::{ConversationId, ItemId, UserId};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, instrument};

pub const MAX_REPLY_CHARS: usize = 1000;

#[async_trait]
pub trait Messenger: Send + Sync {
    async fn find_conversation(&self, a: UserId, b: UserId) -> Result<Option<ConversationId>>;

    async fn send_message(
        &self,
        conversation: ConversationId,
        sender: UserId,
        content: &str,
        media_ref: Option<&str>,
        item_id: ItemId,
    ) -> Result<i64>;
}

#[derive(Debug, Clone)]
pub struct SqliteMessenger {
    pool: Pool,
}

impl SqliteMessenger {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Messenger for SqliteMessenger {
    async fn find_conversation(&self, a: UserId, b: UserId) -> Result<Option<ConversationId>> {
        db::find_conversation(&self.pool, a, b).await
    }

    async fn send_message(
        &self,
        conversation: ConversationId,
        sender: UserId,
        content: &str,
        media_ref: Option<&str>,
        item_id: ItemId,
    ) -> Result<i64> {
        let item = Some(item_id);
        db::insert_message(&self.pool, conversation, sender, content, media_ref, item).await
    }
}

pub fn quote_reply(text: &str) -> String {
    format!("Replied to your story: \"{}\"", text)
}

#[derive(Clone)]
pub struct ReplyBridge {
    store: Store,
    messenger: Arc<dyn Messenger>,
}

impl ReplyBridge {
    pub fn new(store: Store, messenger: Arc<dyn Messenger>) -> Self {
        Self { store, messenger }
    }

    /// Send `text` to the item's author. Returns the message id.
    #[instrument(skip(self, text, now))]
    pub async fn send_reply(
        &self,
        item_id: ItemId,
        viewer: UserId,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, StoryError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(StoryError::Invalid("reply is empty"));
        }
        if text.chars().count() > MAX_REPLY_CHARS {
            return Err(StoryError::Invalid("reply is too long"));
        }
        let item = self
            .store
            .item(item_id)
            .await?
            .ok_or_else(|| StoryError::NotFound(format!("story {}", item_id)))?;
        if !item.is_live(now) {
            return Err(StoryError::Invalid("story has expired"));
        }
        if item.author_id == viewer {
            return Err(StoryError::Invalid("cannot reply to your own story"));
        }

        let conversation = self
            .messenger
            .find_conversation(viewer, item.author_id)
            .await?
            .ok_or(StoryError::ContactRequired)?;

        let media_ref = match (&item.media_url, item.post_id) {
            (Some(url), _) => Some(url.clone()),
            (None, Some(post_id)) => self
                .store
                .post(post_id)
                .await?
                .and_then(|p| p.media_url().map(str::to_string)),
            (None, None) => None,
        };

        let message_id = self
            .messenger
            .send_message(conversation, viewer, &quote_reply(text), media_ref.as_deref(), item_id)
            .await?;
        info!(message_id, conversation, "story reply sent");
        Ok(message_id)
    }
}
