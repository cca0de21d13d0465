use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use storyline::aggregator::{Aggregator, LiveFeed};
use storyline::config::{self, Config, StorageBackend};
use storyline::creation::{CreateInput, CreationPipeline, StorySource};
use storyline::db::{self, Store};
use storyline::engagement::{EngagementTracker, ViewRecorder};
use storyline::model::{Background, ItemId, PostId, UserId};
use storyline::player::{self, PlayerDeps};
use storyline::playback::PlaybackSession;
use storyline::probe::{self, FfprobeProbe, MediaProbe};
use storyline::reply::{ReplyBridge, SqliteMessenger};
use storyline::social::{SocialGraph, SqliteSocialGraph};
use storyline::storage::{self, LocalObjectStore};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Acting user id
    #[arg(long = "as", default_value_t = 1)]
    user: UserId,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the aggregated story tray, or one author's live stories
    Feed {
        #[arg(long)]
        author: Option<UserId>,
    },
    /// Post a text story
    PostText {
        text: String,
        /// `#rrggbb` or `gradient:<name>`
        #[arg(long)]
        background: Option<String>,
        #[arg(long)]
        duration: Option<i64>,
        #[arg(long = "mention")]
        mentions: Vec<UserId>,
    },
    /// Upload an image or video as a story
    PostMedia {
        file: PathBuf,
        #[arg(long)]
        caption: Option<String>,
        #[arg(long)]
        duration: Option<i64>,
        #[arg(long = "mention")]
        mentions: Vec<UserId>,
    },
    /// Reshare a live story or a permanent post
    Reshare {
        #[arg(long, conflicts_with = "post", required_unless_present = "post")]
        item: Option<ItemId>,
        #[arg(long)]
        post: Option<PostId>,
        #[arg(long)]
        caption: Option<String>,
    },
    /// Delete one of your stories
    Delete { item: ItemId },
    /// Record a view
    View { item: ItemId },
    /// Toggle your like on a story
    Like { item: ItemId },
    /// List who viewed one of your stories
    Roster {
        item: ItemId,
        /// Keep printing as views arrive
        #[arg(long)]
        follow: bool,
    },
    /// Reply to a story by direct message
    Reply { item: ItemId, text: String },
    /// List your notifications
    Notifications,
    /// Print the tray again on every change
    Watch,
    /// Play the tray from an author group to the end
    Play {
        #[arg(long, default_value_t = 0)]
        start: usize,
    },
    /// Print an example config file
    ExampleConfig,
}

struct Services {
    cfg: Config,
    store: Store,
    aggregator: Aggregator,
    tracker: EngagementTracker,
    pipeline: CreationPipeline,
    replies: ReplyBridge,
}

impl Services {
    async fn open(cfg: Config) -> Result<Self> {
        cfg.ensure_dirs()?;
        let pool = db::init_pool(&cfg.database_url()).await?;
        db::run_migrations(&pool).await?;

        let store = Store::new(pool.clone());
        let graph: Arc<dyn SocialGraph> = Arc::new(SqliteSocialGraph::new(pool.clone()));
        let objects = storage::from_config(&cfg.storage, &cfg.app.data_dir)?;
        Ok(Self {
            aggregator: Aggregator::new(store.clone(), Arc::clone(&graph)),
            tracker: EngagementTracker::new(store.clone(), Arc::clone(&graph)),
            pipeline: CreationPipeline::new(
                store.clone(),
                graph,
                objects,
                cfg.storage.bucket.clone(),
            ),
            replies: ReplyBridge::new(store.clone(), Arc::new(SqliteMessenger::new(pool))),
            store,
            cfg,
        })
    }

    fn media_probe(&self) -> Arc<dyn MediaProbe> {
        let local = (self.cfg.storage.backend == StorageBackend::Local).then(|| {
            LocalObjectStore::new(
                Path::new(&self.cfg.app.data_dir).join("media"),
                self.cfg.storage.public_base_url.clone(),
            )
        });
        Arc::new(FfprobeProbe::new(local))
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if let Command::ExampleConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    let svc = Services::open(cfg).await?;
    let me = args.user;

    match args.command {
        Command::Feed { author: None } => print_json(&svc.aggregator.load(me, Utc::now()).await)?,
        Command::Feed { author: Some(author) } => {
            print_json(&svc.store.live_items_by_author(author, Utc::now()).await?)?
        }
        Command::PostText {
            text,
            background,
            duration,
            mentions,
        } => {
            let mut input = CreateInput::text(me, text).with_mentions(mentions);
            if let Some(bg) = background {
                let bg = Background::parse(&bg)
                    .ok_or_else(|| anyhow!("invalid background: {}", bg))?;
                input = input.with_background(bg);
            }
            if let Some(secs) = duration {
                input = input.with_duration(secs);
            }
            print_json(&svc.pipeline.create_item(input, Utc::now()).await?)?;
        }
        Command::PostMedia {
            file,
            caption,
            duration,
            mentions,
        } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let mut input = CreateInput::media(me, bytes, name).with_mentions(mentions);
            input.caption = caption;
            input.duration_secs = duration;
            print_json(&svc.pipeline.create_item(input, Utc::now()).await?)?;
        }
        Command::Reshare { item, post, caption } => {
            let source = match (item, post) {
                (Some(id), _) => StorySource::ReshareItem(id),
                (None, Some(id)) => StorySource::ResharePost(id),
                (None, None) => return Err(anyhow!("either --item or --post is required")),
            };
            let mut input = CreateInput::new(me, source);
            input.caption = caption;
            print_json(&svc.pipeline.create_item(input, Utc::now()).await?)?;
        }
        Command::Delete { item } => {
            svc.store.delete_item(item, me).await?;
            info!(item, "story deleted");
        }
        Command::View { item } => {
            let inserted = svc.tracker.record_view(item, me).await;
            println!("{}", if inserted { "viewed" } else { "already viewed" });
        }
        Command::Like { item } => {
            let story = svc
                .store
                .live_item(item, Utc::now())
                .await?
                .ok_or_else(|| anyhow!("story {} not found", item))?;
            let mut state = svc.tracker.like_state(item, me).await;
            let ack = svc.tracker.toggle_like(&mut state, &story, me).await;
            println!("{}", if ack.liked { "liked" } else { "unliked" });
        }
        Command::Roster { item, follow } => {
            if !follow {
                print_json(&svc.tracker.view_roster(item, me).await?)?;
            } else {
                let mut watch = svc.tracker.watch_roster(item, me).await?;
                print_json(watch.current())?;
                while let Some(roster) = watch.next().await {
                    print_json(roster?)?;
                }
            }
        }
        Command::Reply { item, text } => {
            let id = svc.replies.send_reply(item, me, &text, Utc::now()).await?;
            println!("message {}", id);
        }
        Command::Notifications => print_json(&svc.store.notifications(me).await?)?,
        Command::Watch => {
            let mut feed = LiveFeed::open(svc.aggregator.clone(), me).await;
            print_json(feed.snapshot())?;
            while let Some(snapshot) = feed.next_update().await {
                print_json(snapshot)?;
            }
        }
        Command::Play { start } => play(&svc, me, start).await?,
        Command::ExampleConfig => {}
    }
    Ok(())
}

async fn play(svc: &Services, me: UserId, start: usize) -> Result<()> {
    if let Err(err) = probe::ensure_ffprobe_available().await {
        warn!(?err, "video durations will use the configured default");
    }
    let mut feed = LiveFeed::open(svc.aggregator.clone(), me).await;
    let groups = feed.snapshot().playback_groups();
    let session = PlaybackSession::open(groups, start, me, svc.cfg.playback_config())?;

    feed.hold();
    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
    let views: Arc<dyn ViewRecorder> = Arc::new(svc.tracker.clone());
    let handle = player::spawn(
        session,
        PlayerDeps {
            views: Some(views),
            probe: Some(svc.media_probe()),
            events: Some(ev_tx),
        },
    );
    while let Some(event) = ev_rx.recv().await {
        println!("{}", serde_json::to_string(&event)?);
    }
    // Returns once pending view writes have landed, so the refreshed tray
    // below reflects them.
    let cursor = handle.join().await?;
    info!(group = cursor.group, item = cursor.item, "session finished");

    let feed = feed.release().await;
    print_json(feed)?;
    Ok(())
}
