//! Tokio driver for a [`PlaybackSession`].
//!
//! The task owns the session, ticks it on an interval and applies gestures
//! from an mpsc channel. View writes and duration probes run in their own
//! tasks so a tick never waits on I/O. Once the session closes the task waits
//! for outstanding view writes, then returns the final cursor through the join
//! handle.
use crate::engagement::ViewRecorder;
use crate::model::{ItemId, ItemKind};
use crate::playback::{PlaybackCursor, PlaybackEvent, PlaybackSession};
use crate::probe::MediaProbe;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Next,
    Previous,
    Hold,
    Release,
    Close,
}

pub struct PlayerHandle {
    controls: mpsc::UnboundedSender<Control>,
    task: JoinHandle<PlaybackCursor>,
}

impl PlayerHandle {
    /// Returns false once the session has closed.
    pub fn send(&self, control: Control) -> bool {
        self.controls.send(control).is_ok()
    }

    pub fn controls(&self) -> mpsc::UnboundedSender<Control> {
        self.controls.clone()
    }

    /// Wait for the session to close and take its final cursor.
    pub async fn join(self) -> Result<PlaybackCursor> {
        self.task.await.context("player task failed")
    }

    pub async fn close(self) -> Result<PlaybackCursor> {
        let _ = self.controls.send(Control::Close);
        self.join().await
    }
}

#[derive(Clone, Default)]
pub struct PlayerDeps {
    pub views: Option<Arc<dyn ViewRecorder>>,
    pub probe: Option<Arc<dyn MediaProbe>>,
    /// Every event the session emits is forwarded here.
    pub events: Option<mpsc::UnboundedSender<PlaybackEvent>>,
}

/// Spawn the driver. Dropping every control sender closes the session.
pub fn spawn(session: PlaybackSession, deps: PlayerDeps) -> PlayerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(session, deps, rx));
    PlayerHandle { controls: tx, task }
}

async fn run(
    mut session: PlaybackSession,
    deps: PlayerDeps,
    mut controls: mpsc::UnboundedReceiver<Control>,
) -> PlaybackCursor {
    let period = session.config().tick;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let (dur_tx, mut durations) = mpsc::unbounded_channel::<(ItemId, Duration)>();

    info!(viewer = session.viewer(), groups = session.groups().len(), "playback opened");
    let mut writes = JoinSet::new();
    let initial = session.take_events();
    let mut closed = dispatch(&session, &deps, &dur_tx, &mut writes, initial);

    while !closed {
        // Gestures win over a tick that is ready at the same time.
        let events = tokio::select! {
            biased;

            control = controls.recv() => match control {
                Some(Control::Next) => session.next(),
                Some(Control::Previous) => session.previous(),
                Some(Control::Hold) => session.hold(),
                Some(Control::Release) => session.release(),
                Some(Control::Close) | None => session.close(),
            },
            Some((item_id, duration)) = durations.recv() => {
                debug!(item_id, ?duration, "video duration resolved");
                session.resolve_video_duration(item_id, duration);
                Vec::new()
            }
            _ = ticker.tick() => session.tick(period),
        };
        closed = dispatch(&session, &deps, &dur_tx, &mut writes, events);
    }

    while let Some(res) = writes.join_next().await {
        if let Err(err) = res {
            warn!(?err, "view write task failed");
        }
    }

    let cursor = session.cursor();
    info!(group = cursor.group, item = cursor.item, "playback closed");
    cursor
}

/// Act on session events. Returns true once `Closed` has been seen.
fn dispatch(
    session: &PlaybackSession,
    deps: &PlayerDeps,
    durations: &mpsc::UnboundedSender<(ItemId, Duration)>,
    writes: &mut JoinSet<()>,
    events: Vec<PlaybackEvent>,
) -> bool {
    let mut closed = false;
    for event in events {
        match &event {
            PlaybackEvent::ItemStarted { item_id, .. } => {
                let entry = session.current_entry();
                if entry.item.kind == ItemKind::Video && entry.item.id == *item_id {
                    if let (Some(probe), Some(media)) = (&deps.probe, entry.display_media()) {
                        let probe = Arc::clone(probe);
                        spawn_probe(probe, *item_id, media.to_string(), durations.clone());
                    }
                }
            }
            PlaybackEvent::RecordView { item_id } => {
                if let Some(views) = &deps.views {
                    let views = Arc::clone(views);
                    let (item_id, viewer) = (*item_id, session.viewer());
                    writes.spawn(async move {
                        views.record_view(item_id, viewer).await;
                    });
                }
            }
            PlaybackEvent::Closed { .. } => closed = true,
        }
        if let Some(events) = &deps.events {
            let _ = events.send(event);
        }
    }
    closed
}

fn spawn_probe(
    probe: Arc<dyn MediaProbe>,
    item_id: ItemId,
    media: String,
    durations: mpsc::UnboundedSender<(ItemId, Duration)>,
) {
    tokio::spawn(async move {
        match probe.video_duration(&media).await {
            Ok(duration) => {
                let _ = durations.send((item_id, duration));
            }
            Err(err) => warn!(?err, item_id, "video duration unavailable; keeping default"),
        }
    });
}
