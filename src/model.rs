use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type ItemId = i64;
pub type PostId = i64;
pub type ConversationId = i64;

/// Every story lives exactly this long; callers cannot change it.
pub const STORY_TTL_HOURS: i64 = 24;

pub const DEFAULT_BACKGROUND: &str = "#000000";

/// Bounds for the per-item playback override, in seconds.
pub const MIN_DURATION_SECS: i64 = 1;
pub const MAX_DURATION_SECS: i64 = 60;

pub fn expiry_for(created_at: DateTime<Utc>) -> DateTime<Utc> {
    created_at + Duration::hours(STORY_TTL_HOURS)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Text,
    Image,
    Video,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Text => "text",
            ItemKind::Image => "image",
            ItemKind::Video => "video",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "text" => Some(ItemKind::Text),
            "image" => Some(ItemKind::Image),
            "video" => Some(ItemKind::Video),
            _ => None,
        }
    }
}

/// Backdrop of a story: a flat color or a named gradient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Background {
    Color(String),
    Gradient(String),
}

impl Background {
    /// Parse `#rrggbb` or `gradient:<name>`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Some(name) = s.strip_prefix("gradient:") {
            let valid = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            return valid.then(|| Background::Gradient(name.to_string()));
        }
        let hex = s.strip_prefix('#')?;
        if hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Background::Color(format!("#{}", hex.to_ascii_lowercase())))
        } else {
            None
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Background::Color(c) => c.clone(),
            Background::Gradient(name) => format!("gradient:{}", name),
        }
    }
}

impl Default for Background {
    fn default() -> Self {
        Background::Color(DEFAULT_BACKGROUND.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Item {
    pub id: ItemId,
    pub author_id: UserId,
    pub kind: ItemKind,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub background: String,
    pub duration_secs: Option<i64>,
    pub mentions: Vec<UserId>,
    pub post_id: Option<PostId>,
    pub source_item_id: Option<ItemId>,
    pub is_beam: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Item {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Insert payload for a story. Ids and expiry are assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewItem {
    pub author_id: UserId,
    pub kind: ItemKind,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub background: String,
    pub duration_secs: Option<i64>,
    pub mentions: Vec<UserId>,
    pub post_id: Option<PostId>,
    pub source_item_id: Option<ItemId>,
    pub is_beam: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub id: UserId,
    pub handle: String,
    pub avatar_url: Option<String>,
    pub is_private: bool,
    pub is_admin: bool,
}

impl Profile {
    /// Placeholder identity for authors the social graph no longer knows.
    pub fn unknown(id: UserId) -> Self {
        Self {
            id,
            handle: format!("user{}", id),
            avatar_url: None,
            is_private: false,
            is_admin: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermanentPost {
    pub id: PostId,
    pub author_id: UserId,
    pub caption: Option<String>,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
}

impl PermanentPost {
    /// Video wins over image; a post with neither reshares as text.
    pub fn story_kind(&self) -> ItemKind {
        if self.video_url.as_deref().is_some_and(|u| !u.is_empty()) {
            ItemKind::Video
        } else if self.image_url.as_deref().is_some_and(|u| !u.is_empty()) {
            ItemKind::Image
        } else {
            ItemKind::Text
        }
    }

    pub fn media_url(&self) -> Option<&str> {
        match self.story_kind() {
            ItemKind::Video => self.video_url.as_deref(),
            ItemKind::Image => self.image_url.as_deref(),
            ItemKind::Text => None,
        }
    }
}

/// One item as seen by a particular viewer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoryEntry {
    pub item: Item,
    pub post: Option<PermanentPost>,
    pub viewed: bool,
}

impl StoryEntry {
    /// Media to render: the item's own reference, else the linked post's.
    pub fn display_media(&self) -> Option<&str> {
        self.item
            .media_url
            .as_deref()
            .or_else(|| self.post.as_ref().and_then(|p| p.media_url()))
    }

    pub fn display_text(&self) -> Option<&str> {
        self.item
            .content
            .as_deref()
            .or_else(|| self.post.as_ref().and_then(|p| p.caption.as_deref()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthorGroup {
    pub author: Profile,
    pub items: Vec<StoryEntry>,
    pub fully_viewed: bool,
}

impl AuthorGroup {
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.items.last().map(|e| e.item.created_at)
    }

    /// First item the viewer has not seen yet, if any.
    pub fn first_unviewed(&self) -> Option<usize> {
        self.items.iter().position(|e| !e.viewed)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoryFeed {
    pub own: Option<AuthorGroup>,
    pub others: Vec<AuthorGroup>,
}

impl StoryFeed {
    pub fn is_empty(&self) -> bool {
        self.own.is_none() && self.others.is_empty()
    }

    /// Groups in playback order: own group first, then the ranked rest.
    pub fn playback_groups(&self) -> Vec<AuthorGroup> {
        self.own
            .iter()
            .chain(self.others.iter())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct View {
    pub item_id: ItemId,
    pub viewer_id: UserId,
    pub viewed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViewerEntry {
    pub viewer: Profile,
    pub viewed_at: DateTime<Utc>,
    pub liked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViewRoster {
    pub item_id: ItemId,
    pub count: i64,
    pub likes: i64,
    pub viewers: Vec<ViewerEntry>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NotificationKind {
    StoryLike,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::StoryLike => "story_like",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "story_like" => Some(NotificationKind::StoryLike),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub id: i64,
    pub recipient_id: UserId,
    pub actor_id: UserId,
    pub kind: NotificationKind,
    pub item_id: Option<ItemId>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}
