use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use storyline::aggregator::Aggregator;
use storyline::creation::{CreateInput, CreationPipeline, StorySource};
use storyline::db::{self, Store};
use storyline::model::{Background, ItemKind, PermanentPost, Profile, UserId};
use storyline::reply::{Messenger, ReplyBridge, SqliteMessenger};
use storyline::social::{SocialGraph, SqliteSocialGraph};
use storyline::storage::ObjectStore;
use storyline::StoryError;
use tokio::sync::Mutex;

const ALICE: UserId = 10;
const BOB: UserId = 20;

const PNG: [u8; 12] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    for (id, handle) in [(ALICE, "alice"), (BOB, "Bob")] {
        db::upsert_profile(
            &pool,
            &Profile {
                id,
                handle: handle.into(),
                avatar_url: None,
                is_private: false,
                is_admin: false,
            },
        )
        .await
        .unwrap();
    }
    pool
}

#[derive(Debug, Clone)]
struct UploadCall {
    bucket: String,
    name: String,
    size: usize,
    content_type: String,
}

#[derive(Clone, Default)]
struct RecordingObjects {
    responses: Arc<Mutex<VecDeque<Result<String>>>>,
    calls: Arc<Mutex<Vec<UploadCall>>>,
}

impl RecordingObjects {
    async fn push_response(&self, res: Result<String>) {
        self.responses.lock().await.push_back(res);
    }
}

#[async_trait]
impl ObjectStore for RecordingObjects {
    async fn upload(
        &self,
        bucket: &str,
        name: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        self.calls.lock().await.push(UploadCall {
            bucket: bucket.to_string(),
            name: name.to_string(),
            size: bytes.len(),
            content_type: content_type.to_string(),
        });
        match self.responses.lock().await.pop_front() {
            Some(res) => res,
            None => Ok(format!("https://cdn.test/{}/{}", bucket, name)),
        }
    }
}

fn pipeline(pool: &sqlx::SqlitePool, objects: &RecordingObjects) -> (Store, CreationPipeline) {
    let store = Store::new(pool.clone());
    let graph: Arc<dyn SocialGraph> = Arc::new(SqliteSocialGraph::new(pool.clone()));
    let pipeline =
        CreationPipeline::new(store.clone(), graph, Arc::new(objects.clone()), "stories");
    (store, pipeline)
}

#[tokio::test]
async fn media_story_is_uploaded_and_expires_in_a_day() {
    let pool = setup_pool().await;
    let objects = RecordingObjects::default();
    let (store, pipeline) = pipeline(&pool, &objects);
    let now = Utc::now();

    let input = CreateInput::media(ALICE, PNG.to_vec(), "clip.mp4")
        .with_caption("beach day")
        .with_duration(8);
    let item = pipeline.create_item(input, now).await.unwrap();

    assert_eq!(item.kind, ItemKind::Image);
    assert_eq!(item.content.as_deref(), Some("beach day"));
    assert_eq!(item.duration_secs, Some(8));
    assert_eq!(item.expires_at - item.created_at, chrono::Duration::hours(24));

    let calls = objects.calls.lock().await.clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].bucket, "stories");
    assert!(calls[0].name.starts_with("10/") && calls[0].name.ends_with(".png"));
    assert_eq!(calls[0].content_type, "image/png");
    assert_eq!(calls[0].size, PNG.len());
    assert_eq!(item.media_url, Some(format!("https://cdn.test/stories/{}", calls[0].name)));

    assert_eq!(store.live_items(now).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_upload_is_retryable_and_writes_nothing() {
    let pool = setup_pool().await;
    let objects = RecordingObjects::default();
    objects.push_response(Err(anyhow!("503 from object store"))).await;
    let (store, pipeline) = pipeline(&pool, &objects);

    let err = pipeline
        .create_item(CreateInput::media(ALICE, PNG.to_vec(), "a.png"), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, StoryError::Upload(_)));
    assert!(err.is_retryable());
    assert!(store.live_items(Utc::now()).await.unwrap().is_empty());
}

#[tokio::test]
async fn invalid_inputs_are_rejected_before_upload() {
    let pool = setup_pool().await;
    let objects = RecordingObjects::default();
    let (_, pipeline) = pipeline(&pool, &objects);
    let now = Utc::now();

    let cases = [
        CreateInput::text(ALICE, "   "),
        CreateInput::text(ALICE, "hi").with_duration(0),
        CreateInput::text(ALICE, "hi").with_duration(61),
        CreateInput::media(ALICE, b"%PDF-1.4 ......".to_vec(), "doc.pdf"),
        CreateInput::media(ALICE, Vec::new(), "a.png"),
    ];
    for input in cases {
        let err = pipeline.create_item(input, now).await.unwrap_err();
        assert!(matches!(err, StoryError::Invalid(_)), "{err:?}");
        assert!(!err.is_retryable());
    }
    assert!(objects.calls.lock().await.is_empty());
}

#[tokio::test]
async fn text_story_resolves_mentions() {
    let pool = setup_pool().await;
    let objects = RecordingObjects::default();
    let (_, pipeline) = pipeline(&pool, &objects);

    let input = CreateInput::text(ALICE, "lunch with @bob and @alice and @nobody")
        .with_background(Background::Gradient("sunset".into()))
        .with_mentions(vec![BOB, 77]);
    let item = pipeline.create_item(input, Utc::now()).await.unwrap();

    assert_eq!(item.kind, ItemKind::Text);
    assert_eq!(item.background, "gradient:sunset");
    assert_eq!(item.mentions, vec![BOB, 77]);
    assert!(objects.calls.lock().await.is_empty());
}

#[tokio::test]
async fn reshares_link_their_source() {
    let pool = setup_pool().await;
    let objects = RecordingObjects::default();
    let (_, pipeline) = pipeline(&pool, &objects);
    let now = Utc::now();

    db::insert_post(
        &pool,
        &PermanentPost {
            id: 7,
            author_id: BOB,
            caption: Some("trip".into()),
            image_url: Some("https://cdn/p7.jpg".into()),
            video_url: Some("https://cdn/p7.mp4".into()),
        },
    )
    .await
    .unwrap();
    let beam = pipeline
        .create_item(CreateInput::new(ALICE, StorySource::ResharePost(7)).with_duration(5), now)
        .await
        .unwrap();
    assert!(beam.is_beam);
    assert_eq!(beam.post_id, Some(7));
    assert_eq!(beam.kind, ItemKind::Video);
    assert_eq!(beam.media_url, None);
    assert_eq!(beam.duration_secs, None);

    let original = pipeline
        .create_item(CreateInput::media(BOB, PNG.to_vec(), "x.png"), now)
        .await
        .unwrap();
    let copy = pipeline
        .create_item(CreateInput::new(ALICE, StorySource::ReshareItem(original.id)), now)
        .await
        .unwrap();
    assert_eq!(copy.source_item_id, Some(original.id));
    assert_eq!(copy.kind, original.kind);
    assert_eq!(copy.media_url, original.media_url);
    // copied by reference, not re-uploaded
    assert_eq!(objects.calls.lock().await.len(), 1);

    let err = pipeline
        .create_item(CreateInput::new(ALICE, StorySource::ResharePost(404)), now)
        .await
        .unwrap_err();
    assert!(matches!(err, StoryError::NotFound(_)));
}

#[tokio::test]
async fn private_story_reshare_needs_a_follow() {
    const CAROL: UserId = 30;
    let pool = setup_pool().await;
    for (id, handle) in [(CAROL, "carol"), (1, "viewer")] {
        db::upsert_profile(
            &pool,
            &Profile {
                id,
                handle: handle.into(),
                avatar_url: None,
                is_private: id == CAROL,
                is_admin: false,
            },
        )
        .await
        .unwrap();
    }
    let objects = RecordingObjects::default();
    let (store, pipeline) = pipeline(&pool, &objects);
    let now = Utc::now();

    let secret = pipeline
        .create_item(CreateInput::media(CAROL, PNG.to_vec(), "secret.png"), now)
        .await
        .unwrap();
    let reshare = || CreateInput::new(ALICE, StorySource::ReshareItem(secret.id));

    let err = pipeline.create_item(reshare(), now).await.unwrap_err();
    assert!(matches!(err, StoryError::Forbidden(_)));
    assert_eq!(store.live_items(now).await.unwrap().len(), 1);

    // nothing from the private author leaks into a third party's tray
    let graph: Arc<dyn SocialGraph> = Arc::new(SqliteSocialGraph::new(pool.clone()));
    let feed = Aggregator::new(store.clone(), graph).load(1, now).await;
    assert!(feed.is_empty());

    db::follow(&pool, ALICE, CAROL).await.unwrap();
    let copy = pipeline.create_item(reshare(), now).await.unwrap();
    assert_eq!(copy.media_url, secret.media_url);

    // the author may always reshare their own story
    let own = CreateInput::new(CAROL, StorySource::ReshareItem(secret.id));
    assert!(pipeline.create_item(own, now).await.is_ok());
}

#[derive(Clone, Default)]
struct RecordingMessenger {
    conversation: Option<i64>,
    sent: Arc<Mutex<Vec<(i64, UserId, String, Option<String>)>>>,
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn find_conversation(&self, _a: UserId, _b: UserId) -> Result<Option<i64>> {
        Ok(self.conversation)
    }

    async fn send_message(
        &self,
        conversation: i64,
        sender: UserId,
        content: &str,
        media_ref: Option<&str>,
        _item_id: i64,
    ) -> Result<i64> {
        let mut sent = self.sent.lock().await;
        sent.push((conversation, sender, content.to_string(), media_ref.map(str::to_string)));
        Ok(sent.len() as i64)
    }
}

#[tokio::test]
async fn reply_needs_an_existing_conversation() {
    let pool = setup_pool().await;
    let objects = RecordingObjects::default();
    let (store, pipeline) = pipeline(&pool, &objects);
    let now = Utc::now();
    let item = pipeline
        .create_item(CreateInput::media(ALICE, PNG.to_vec(), "a.png"), now)
        .await
        .unwrap();

    let nobody = ReplyBridge::new(store.clone(), Arc::new(RecordingMessenger::default()));
    let err = nobody.send_reply(item.id, BOB, "nice!", now).await.unwrap_err();
    assert!(matches!(err, StoryError::ContactRequired));

    let messenger = RecordingMessenger {
        conversation: Some(3),
        ..Default::default()
    };
    let bridge = ReplyBridge::new(store.clone(), Arc::new(messenger.clone()));
    bridge.send_reply(item.id, BOB, "  nice!  ", now).await.unwrap();
    let sent = messenger.sent.lock().await.clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, 3);
    assert_eq!(sent[0].1, BOB);
    assert!(sent[0].2.contains("nice!"));
    assert_eq!(sent[0].3, item.media_url);

    for (viewer, text) in [(ALICE, "me"), (BOB, "   ")] {
        let err = bridge.send_reply(item.id, viewer, text, now).await.unwrap_err();
        assert!(matches!(err, StoryError::Invalid(_)));
    }
}

#[tokio::test]
async fn reply_is_stored_in_the_conversation() {
    let pool = setup_pool().await;
    let objects = RecordingObjects::default();
    let (store, pipeline) = pipeline(&pool, &objects);
    let now = Utc::now();
    let item = pipeline
        .create_item(CreateInput::text(ALICE, "ask me anything"), now)
        .await
        .unwrap();

    let conversation = db::get_or_create_conversation(&pool, BOB, ALICE).await.unwrap();
    let bridge = ReplyBridge::new(store, Arc::new(SqliteMessenger::new(pool.clone())));
    bridge.send_reply(item.id, BOB, "what's next?", now).await.unwrap();

    let messages = db::messages_in(&pool, conversation).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].sender_id, BOB);
    assert_eq!(messages[0].item_id, Some(item.id));
    assert_eq!(messages[0].media_url, None);

    // expired stories can no longer be replied to
    let later = now + chrono::Duration::hours(25);
    let err = bridge.send_reply(item.id, BOB, "hello?", later).await.unwrap_err();
    assert!(matches!(err, StoryError::Invalid(_)));

    let err = bridge.send_reply(9999, BOB, "hello?", now).await.unwrap_err();
    assert!(matches!(err, StoryError::NotFound(_)));
}
