//! Turns a capture, typed text or a reshare into a persisted story item.
use crate::aggregator::visible_to;
use crate::db::Store;
use crate::error::StoryError;
use crate::model::{
    Background, Item, ItemId, ItemKind, NewItem, PostId, UserId, MAX_DURATION_SECS,
    MIN_DURATION_SECS,
};
use crate::social::SocialGraph;
use crate::storage::ObjectStore;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

static MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^\w@])@([A-Za-z0-9_.]{1,30})").expect("valid mention regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorySource {
    Media { bytes: Vec<u8>, file_name: String },
    Text { text: String },
    ReshareItem(ItemId),
    ResharePost(PostId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateInput {
    pub author: UserId,
    pub source: StorySource,
    pub caption: Option<String>,
    pub background: Option<Background>,
    pub mentions: Vec<UserId>,
    /// Image and text only; ignored for video.
    pub duration_secs: Option<i64>,
}

impl CreateInput {
    pub fn new(author: UserId, source: StorySource) -> Self {
        Self {
            author,
            source,
            caption: None,
            background: None,
            mentions: Vec::new(),
            duration_secs: None,
        }
    }

    pub fn text(author: UserId, text: impl Into<String>) -> Self {
        Self::new(author, StorySource::Text { text: text.into() })
    }

    pub fn media(author: UserId, bytes: Vec<u8>, file_name: impl Into<String>) -> Self {
        Self::new(
            author,
            StorySource::Media {
                bytes,
                file_name: file_name.into(),
            },
        )
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    pub fn with_background(mut self, background: Background) -> Self {
        self.background = Some(background);
        self
    }

    pub fn with_mentions(mut self, mentions: Vec<UserId>) -> Self {
        self.mentions = mentions;
        self
    }

    pub fn with_duration(mut self, secs: i64) -> Self {
        self.duration_secs = Some(secs);
        self
    }
}

/// Result of content inspection on uploaded bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
    pub kind: ItemKind,
    pub content_type: String,
    pub extension: String,
}

impl MediaType {
    fn new(kind: ItemKind, content_type: &str, extension: &str) -> Self {
        Self {
            kind,
            content_type: content_type.to_string(),
            extension: extension.to_string(),
        }
    }
}

/// Classify media by magic bytes, falling back to the file name.
/// `None` when it is neither an image nor a video.
pub fn sniff_media(data: &[u8], file_name: &str) -> Option<MediaType> {
    if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some(MediaType::new(ItemKind::Image, "image/png", "png"));
    }
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(MediaType::new(ItemKind::Image, "image/jpeg", "jpg"));
    }
    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return Some(MediaType::new(ItemKind::Image, "image/gif", "gif"));
    }
    if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return Some(MediaType::new(ItemKind::Image, "image/webp", "webp"));
    }
    // ISO base media: size, "ftyp", major brand
    if data.len() >= 12 && &data[4..8] == b"ftyp" {
        return Some(match &data[8..12] {
            b"heic" | b"heix" | b"mif1" => MediaType::new(ItemKind::Image, "image/heic", "heic"),
            b"avif" => MediaType::new(ItemKind::Image, "image/avif", "avif"),
            b"qt  " => MediaType::new(ItemKind::Video, "video/quicktime", "mov"),
            _ => MediaType::new(ItemKind::Video, "video/mp4", "mp4"),
        });
    }
    if data.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some(MediaType::new(ItemKind::Video, "video/webm", "webm"));
    }

    let mime = mime_guess::from_path(file_name).first()?;
    let kind = match mime.type_().as_str() {
        "image" => ItemKind::Image,
        "video" => ItemKind::Video,
        _ => return None,
    };
    let extension = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| "bin".to_string());
    Some(MediaType {
        kind,
        content_type: mime.essence_str().to_string(),
        extension,
    })
}

/// Lowercased `@handle` tokens, deduplicated, in first-seen order.
pub fn mention_handles(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    MENTION_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim_end_matches('.').to_ascii_lowercase())
        .filter(|h| !h.is_empty() && seen.insert(h.clone()))
        .collect()
}

#[derive(Clone)]
pub struct CreationPipeline {
    store: Store,
    graph: Arc<dyn SocialGraph>,
    objects: Arc<dyn ObjectStore>,
    bucket: String,
}

impl CreationPipeline {
    pub fn new(
        store: Store,
        graph: Arc<dyn SocialGraph>,
        objects: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            store,
            graph,
            objects,
            bucket: bucket.into(),
        }
    }

    #[instrument(skip_all, fields(author = input.author))]
    pub async fn create_item(
        &self,
        input: CreateInput,
        now: DateTime<Utc>,
    ) -> Result<Item, StoryError> {
        if let Some(secs) = input.duration_secs {
            if !(MIN_DURATION_SECS..=MAX_DURATION_SECS).contains(&secs) {
                return Err(StoryError::Invalid("duration must be between 1 and 60 seconds"));
            }
        }
        let caption = input
            .caption
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        // Resolved before any upload so a lookup failure leaves nothing behind.
        let mentions = self.resolve_mentions(&input, caption.as_deref()).await?;
        let background = input.background.clone().unwrap_or_default().encode();

        let mut draft = NewItem {
            author_id: input.author,
            kind: ItemKind::Text,
            content: caption.clone(),
            media_url: None,
            background,
            duration_secs: input.duration_secs,
            mentions,
            post_id: None,
            source_item_id: None,
            is_beam: false,
            created_at: now,
        };

        let mut uploaded = None;
        match input.source {
            StorySource::Text { text } => {
                let text = text.trim();
                if text.is_empty() {
                    return Err(StoryError::Invalid("text story is empty"));
                }
                draft.content = Some(text.to_string());
            }
            StorySource::Media { bytes, file_name } => {
                if bytes.is_empty() {
                    return Err(StoryError::Invalid("media file is empty"));
                }
                let media = sniff_media(&bytes, &file_name)
                    .ok_or(StoryError::Invalid("unsupported media type"))?;
                let name = format!("{}/{}.{}", input.author, Uuid::new_v4(), media.extension);
                let url = self
                    .objects
                    .upload(&self.bucket, &name, bytes, &media.content_type)
                    .await
                    .map_err(StoryError::Upload)?;
                draft.kind = media.kind;
                draft.media_url = Some(url.clone());
                uploaded = Some(url);
            }
            StorySource::ReshareItem(source_id) => {
                let source = self
                    .store
                    .live_item(source_id, now)
                    .await?
                    .ok_or_else(|| StoryError::NotFound(format!("story {}", source_id)))?;
                self.ensure_visible(input.author, source.author_id).await?;
                draft.kind = source.kind;
                draft.media_url = source.media_url;
                draft.content = caption.or(source.content);
                if input.background.is_none() {
                    draft.background = source.background;
                }
                draft.duration_secs = input.duration_secs.or(source.duration_secs);
                draft.post_id = source.post_id;
                draft.is_beam = source.is_beam;
                draft.source_item_id = Some(source_id);
            }
            StorySource::ResharePost(post_id) => {
                let post = self
                    .store
                    .post(post_id)
                    .await?
                    .ok_or_else(|| StoryError::NotFound(format!("post {}", post_id)))?;
                draft.kind = post.story_kind();
                draft.post_id = Some(post.id);
                draft.is_beam = true;
            }
        }
        if draft.kind == ItemKind::Video {
            draft.duration_secs = None;
        }

        let item = match self.store.insert_item(&draft).await {
            Ok(item) => item,
            Err(err) => {
                if let Some(url) = &uploaded {
                    warn!(%url, "story insert failed; uploaded media is orphaned");
                }
                return Err(StoryError::Store(err));
            }
        };
        info!(
            item_id = item.id,
            kind = item.kind.as_str(),
            is_beam = item.is_beam,
            "story created"
        );
        Ok(item)
    }

    /// A reshare copies media by reference, so the source must pass the same
    /// privacy rule as the tray.
    async fn ensure_visible(&self, resharer: UserId, author: UserId) -> Result<(), StoryError> {
        if resharer == author {
            return Ok(());
        }
        let authors = [author];
        let (profiles, following) = futures::try_join!(
            self.graph.profiles(&authors),
            self.graph.following(resharer),
        )?;
        let profile = profiles.iter().find(|p| p.id == author);
        if visible_to(resharer, author, profile, &following) {
            Ok(())
        } else {
            warn!(resharer, author, "reshare of a story the resharer cannot see");
            Err(StoryError::Forbidden("cannot reshare this story"))
        }
    }

    async fn resolve_mentions(
        &self,
        input: &CreateInput,
        caption: Option<&str>,
    ) -> Result<Vec<UserId>, StoryError> {
        let mut text = caption.unwrap_or_default().to_string();
        if let StorySource::Text { text: body } = &input.source {
            text.push(' ');
            text.push_str(body);
        }
        let handles = mention_handles(&text);

        let mut ids: BTreeSet<UserId> = input.mentions.iter().copied().collect();
        if !handles.is_empty() {
            let found = self.graph.profiles_by_handle(&handles).await?;
            ids.extend(found.into_iter().map(|p| p.id));
        }
        ids.remove(&input.author);
        Ok(ids.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_bytes_beat_file_name() {
        let png = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];
        let media = sniff_media(&png, "clip.mp4").unwrap();
        assert_eq!(media.kind, ItemKind::Image);
        assert_eq!(media.content_type, "image/png");

        let mut mp4 = vec![0, 0, 0, 0x18];
        mp4.extend_from_slice(b"ftypisom");
        mp4.extend_from_slice(&[0; 8]);
        let media = sniff_media(&mp4, "photo.jpg").unwrap();
        assert_eq!(media.kind, ItemKind::Video);
        assert_eq!(media.extension, "mp4");

        let mut mov = vec![0, 0, 0, 0x14];
        mov.extend_from_slice(b"ftypqt  ");
        assert_eq!(sniff_media(&mov, "x").unwrap().content_type, "video/quicktime");
    }

    #[test]
    fn file_name_is_the_fallback() {
        let media = sniff_media(b"????????????", "Holiday.MOV").unwrap();
        assert_eq!(media.kind, ItemKind::Video);
        assert_eq!(media.extension, "mov");

        assert_eq!(sniff_media(b"????", "pic.jpeg").unwrap().kind, ItemKind::Image);
        assert!(sniff_media(b"%PDF-1.7", "doc.pdf").is_none());
        assert!(sniff_media(b"hello", "notes").is_none());
    }

    #[test]
    fn mention_tokens() {
        assert_eq!(
            mention_handles("hey @Alice and @bob_99, also @alice. mail me at x@y.com"),
            vec!["alice".to_string(), "bob_99".to_string()]
        );
        assert!(mention_handles("no mentions here").is_empty());
        assert_eq!(mention_handles("@start"), vec!["start".to_string()]);
    }
}
