//! Full-screen story playback as an explicit state machine.
//!
//! A [`PlaybackSession`] owns a snapshot of the author groups it was opened
//! with and never reorders it. The host feeds it ticks and gestures and acts
//! on the [`PlaybackEvent`]s it returns; the session itself does no I/O.
use crate::error::StoryError;
use crate::model::{AuthorGroup, ItemId, ItemKind, StoryEntry, UserId};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackConfig {
    pub tick: Duration,
    pub default_image: Duration,
    pub default_video: Duration,
    /// How long an item must stay on screen before it counts as viewed.
    pub view_dwell: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(50),
            default_image: Duration::from_secs(5),
            default_video: Duration::from_secs(15),
            view_dwell: Duration::from_millis(1500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlaybackState {
    Playing,
    Paused,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlaybackCursor {
    pub group: usize,
    pub item: usize,
    /// Fraction of the current item's duration already shown, 0.0..=1.0.
    pub elapsed: f64,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PlaybackEvent {
    ItemStarted {
        group: usize,
        item: usize,
        item_id: ItemId,
    },
    /// Persist a view for this item. Emitted at most once per item.
    RecordView { item_id: ItemId },
    /// Terminal; emitted exactly once. The host should refresh its feed.
    Closed { cursor: PlaybackCursor },
}

/// Two-phase duration: a default until the real media length is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemDuration {
    Provisional(Duration),
    Resolved(Duration),
}

impl ItemDuration {
    pub fn get(&self) -> Duration {
        match *self {
            ItemDuration::Provisional(d) | ItemDuration::Resolved(d) => d,
        }
    }
}

pub struct PlaybackSession {
    groups: Vec<AuthorGroup>,
    viewer: UserId,
    config: PlaybackConfig,
    cursor: PlaybackCursor,
    state: PlaybackState,
    video_durations: HashMap<ItemId, Duration>,
    dwell: Duration,
    scheduled: HashSet<ItemId>,
    pending: Vec<PlaybackEvent>,
}

impl PlaybackSession {
    pub fn open(
        groups: Vec<AuthorGroup>,
        start: usize,
        viewer: UserId,
        config: PlaybackConfig,
    ) -> Result<Self, StoryError> {
        if groups.is_empty() {
            return Err(StoryError::Invalid("nothing to play"));
        }
        if start >= groups.len() {
            return Err(StoryError::Invalid("start group out of range"));
        }
        if groups.iter().any(|g| g.items.is_empty()) {
            return Err(StoryError::Invalid("author group without items"));
        }

        let mut session = Self {
            groups,
            viewer,
            config,
            cursor: PlaybackCursor {
                group: start,
                item: 0,
                elapsed: 0.0,
                paused: false,
            },
            state: PlaybackState::Playing,
            video_durations: HashMap::new(),
            dwell: Duration::ZERO,
            scheduled: HashSet::new(),
            pending: Vec::new(),
        };
        session.enter_item();
        Ok(session)
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn cursor(&self) -> PlaybackCursor {
        self.cursor
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    pub fn viewer(&self) -> UserId {
        self.viewer
    }

    pub fn groups(&self) -> &[AuthorGroup] {
        &self.groups
    }

    pub fn current_group(&self) -> &AuthorGroup {
        &self.groups[self.cursor.group]
    }

    pub fn current_entry(&self) -> &StoryEntry {
        &self.groups[self.cursor.group].items[self.cursor.item]
    }

    pub fn is_closed(&self) -> bool {
        self.state == PlaybackState::Closed
    }

    /// Events produced since the last call.
    pub fn take_events(&mut self) -> Vec<PlaybackEvent> {
        std::mem::take(&mut self.pending)
    }

    /// Duration of an item in this session, provisional for unprobed video.
    pub fn item_duration(&self, entry: &StoryEntry) -> ItemDuration {
        match entry.item.kind {
            ItemKind::Video => match self.video_durations.get(&entry.item.id) {
                Some(d) => ItemDuration::Resolved(*d),
                None => ItemDuration::Provisional(self.config.default_video),
            },
            ItemKind::Image | ItemKind::Text => match entry.item.duration_secs {
                Some(secs) if secs > 0 => ItemDuration::Resolved(Duration::from_secs(secs as u64)),
                _ => ItemDuration::Provisional(self.config.default_image),
            },
        }
    }

    /// Second phase of the duration resolver: the media length arrived.
    /// Elapsed fraction is kept; only the rate of progress changes.
    pub fn resolve_video_duration(&mut self, item_id: ItemId, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let is_video = self
            .groups
            .iter()
            .flat_map(|g| g.items.iter())
            .any(|e| e.item.id == item_id && e.item.kind == ItemKind::Video);
        if is_video {
            self.video_durations.insert(item_id, duration);
        }
    }

    /// Per-item progress for the current group's segmented bar.
    pub fn progress(&self) -> Vec<f64> {
        let current = self.cursor.item;
        (0..self.current_group().items.len())
            .map(|i| match i.cmp(&current) {
                std::cmp::Ordering::Less => 1.0,
                std::cmp::Ordering::Equal => self.cursor.elapsed.clamp(0.0, 1.0),
                std::cmp::Ordering::Greater => 0.0,
            })
            .collect()
    }

    pub fn tick(&mut self, dt: Duration) -> Vec<PlaybackEvent> {
        if self.state == PlaybackState::Playing {
            let duration = self.item_duration(self.current_entry()).get();
            let step = dt.as_secs_f64() / duration.as_secs_f64().max(f64::EPSILON);
            self.cursor.elapsed = (self.cursor.elapsed + step).min(1.0);
            self.dwell += dt;

            // An item shorter than the dwell still counts once it plays out.
            let finished = self.cursor.elapsed >= 1.0;
            if finished || self.dwell >= self.config.view_dwell {
                self.schedule_view();
            }
            if finished {
                self.advance();
            }
        }
        self.take_events()
    }

    pub fn next(&mut self) -> Vec<PlaybackEvent> {
        if !self.is_closed() {
            self.advance();
        }
        self.take_events()
    }

    pub fn previous(&mut self) -> Vec<PlaybackEvent> {
        if !self.is_closed() {
            if self.cursor.item > 0 {
                self.cursor.item -= 1;
                self.enter_item();
            } else if self.cursor.group > 0 {
                self.cursor.group -= 1;
                self.cursor.item = self.groups[self.cursor.group].items.len() - 1;
                self.enter_item();
            }
        }
        self.take_events()
    }

    pub fn hold(&mut self) -> Vec<PlaybackEvent> {
        if self.state == PlaybackState::Playing {
            self.state = PlaybackState::Paused;
            self.cursor.paused = true;
        }
        self.take_events()
    }

    pub fn release(&mut self) -> Vec<PlaybackEvent> {
        if self.state == PlaybackState::Paused {
            self.state = PlaybackState::Playing;
            self.cursor.paused = false;
        }
        self.take_events()
    }

    pub fn close(&mut self) -> Vec<PlaybackEvent> {
        self.finish();
        self.take_events()
    }

    fn advance(&mut self) {
        let group_len = self.groups[self.cursor.group].items.len();
        if self.cursor.item + 1 < group_len {
            self.cursor.item += 1;
            self.enter_item();
        } else if self.cursor.group + 1 < self.groups.len() {
            self.cursor.group += 1;
            self.cursor.item = 0;
            self.enter_item();
        } else {
            self.finish();
        }
    }

    fn enter_item(&mut self) {
        self.cursor.elapsed = 0.0;
        self.dwell = Duration::ZERO;
        let item_id = self.current_entry().item.id;
        self.pending.push(PlaybackEvent::ItemStarted {
            group: self.cursor.group,
            item: self.cursor.item,
            item_id,
        });
    }

    fn schedule_view(&mut self) {
        let viewer = self.viewer;
        let (group, item) = (self.cursor.group, self.cursor.item);
        let entry = &mut self.groups[group].items[item];
        if entry.item.author_id == viewer
            || entry.viewed
            || self.scheduled.contains(&entry.item.id)
        {
            return;
        }
        // Local, provisional: the next feed load is authoritative.
        entry.viewed = true;
        self.scheduled.insert(entry.item.id);
        self.pending.push(PlaybackEvent::RecordView {
            item_id: entry.item.id,
        });
    }

    fn finish(&mut self) {
        if self.state == PlaybackState::Closed {
            return;
        }
        self.state = PlaybackState::Closed;
        self.pending.push(PlaybackEvent::Closed {
            cursor: self.cursor,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Item, Profile};
    use chrono::Utc;

    const VIEWER: UserId = 1;

    fn entry(id: ItemId, author_id: UserId, kind: ItemKind, secs: Option<i64>) -> StoryEntry {
        let now = Utc::now();
        StoryEntry {
            item: Item {
                id,
                author_id,
                kind,
                content: None,
                media_url: None,
                background: "#000000".into(),
                duration_secs: secs,
                mentions: Vec::new(),
                post_id: None,
                source_item_id: None,
                is_beam: false,
                created_at: now,
                expires_at: now + chrono::Duration::hours(24),
            },
            post: None,
            viewed: false,
        }
    }

    fn group(author: UserId, entries: Vec<StoryEntry>) -> AuthorGroup {
        AuthorGroup {
            author: Profile::unknown(author),
            items: entries,
            fully_viewed: false,
        }
    }

    fn config() -> PlaybackConfig {
        PlaybackConfig {
            tick: Duration::from_millis(100),
            default_image: Duration::from_secs(1),
            default_video: Duration::from_secs(2),
            view_dwell: Duration::from_millis(300),
        }
    }

    /// Author 10 has items 1,2; author 20 has item 3.
    fn two_groups() -> Vec<AuthorGroup> {
        vec![
            group(
                10,
                vec![
                    entry(1, 10, ItemKind::Image, None),
                    entry(2, 10, ItemKind::Text, None),
                ],
            ),
            group(20, vec![entry(3, 20, ItemKind::Image, None)]),
        ]
    }

    fn started(events: &[PlaybackEvent]) -> Vec<ItemId> {
        events
            .iter()
            .filter_map(|e| match e {
                PlaybackEvent::ItemStarted { item_id, .. } => Some(*item_id),
                _ => None,
            })
            .collect()
    }

    fn closes(events: &[PlaybackEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, PlaybackEvent::Closed { .. }))
            .count()
    }

    #[test]
    fn open_validates_input() {
        assert!(PlaybackSession::open(Vec::new(), 0, VIEWER, config()).is_err());
        assert!(PlaybackSession::open(two_groups(), 2, VIEWER, config()).is_err());
        assert!(PlaybackSession::open(vec![group(10, Vec::new())], 0, VIEWER, config()).is_err());

        let mut s = PlaybackSession::open(two_groups(), 1, VIEWER, config()).unwrap();
        assert_eq!(s.state(), PlaybackState::Playing);
        assert_eq!(s.cursor().group, 1);
        assert_eq!(started(&s.take_events()), vec![3]);
    }

    #[test]
    fn ticks_advance_across_items_and_groups_then_close_once() {
        let mut s = PlaybackSession::open(two_groups(), 0, VIEWER, config()).unwrap();
        let mut events = s.take_events();
        for _ in 0..100 {
            events.extend(s.tick(Duration::from_millis(100)));
        }
        assert_eq!(started(&events), vec![1, 2, 3]);
        assert_eq!(closes(&events), 1);
        assert_eq!(s.state(), PlaybackState::Closed);

        // no re-entry
        assert!(s.next().is_empty());
        assert!(s.previous().is_empty());
        assert!(s.close().is_empty());
        assert!(s.tick(Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn elapsed_grows_by_interval_over_duration() {
        let mut s = PlaybackSession::open(two_groups(), 0, VIEWER, config()).unwrap();
        s.tick(Duration::from_millis(250));
        assert!((s.cursor().elapsed - 0.25).abs() < 1e-9);
        assert_eq!(s.progress(), vec![0.25, 0.0]);
        s.next();
        assert_eq!(s.progress(), vec![1.0, 0.0]);
    }

    #[test]
    fn configured_duration_overrides_default() {
        let groups = vec![group(10, vec![entry(1, 10, ItemKind::Image, Some(4))])];
        let mut s = PlaybackSession::open(groups, 0, VIEWER, config()).unwrap();
        s.tick(Duration::from_secs(1));
        assert!((s.cursor().elapsed - 0.25).abs() < 1e-9);
        assert_eq!(
            s.item_duration(s.current_entry()),
            ItemDuration::Resolved(Duration::from_secs(4))
        );
    }

    #[test]
    fn video_duration_is_provisional_until_resolved() {
        let groups = vec![group(10, vec![entry(1, 10, ItemKind::Video, Some(99))])];
        let mut s = PlaybackSession::open(groups, 0, VIEWER, config()).unwrap();
        assert_eq!(
            s.item_duration(s.current_entry()),
            ItemDuration::Provisional(Duration::from_secs(2))
        );
        s.tick(Duration::from_millis(500));
        assert!((s.cursor().elapsed - 0.25).abs() < 1e-9);

        s.resolve_video_duration(1, Duration::from_secs(10));
        assert_eq!(
            s.item_duration(s.current_entry()),
            ItemDuration::Resolved(Duration::from_secs(10))
        );
        s.tick(Duration::from_secs(1));
        assert!((s.cursor().elapsed - 0.35).abs() < 1e-9);
    }

    #[test]
    fn previous_moves_back_across_groups_and_stops_at_start() {
        let mut s = PlaybackSession::open(two_groups(), 1, VIEWER, config()).unwrap();
        s.take_events();
        assert_eq!(started(&s.previous()), vec![2]);
        assert_eq!((s.cursor().group, s.cursor().item), (0, 1));
        assert_eq!(started(&s.previous()), vec![1]);
        assert!(s.previous().is_empty());
        assert_eq!((s.cursor().group, s.cursor().item), (0, 0));
        assert_eq!(s.state(), PlaybackState::Playing);
    }

    #[test]
    fn next_past_the_end_closes() {
        let mut s = PlaybackSession::open(two_groups(), 1, VIEWER, config()).unwrap();
        s.take_events();
        let events = s.next();
        assert_eq!(closes(&events), 1);
        assert!(s.is_closed());
    }

    #[test]
    fn hold_stops_progress() {
        let mut s = PlaybackSession::open(two_groups(), 0, VIEWER, config()).unwrap();
        s.tick(Duration::from_millis(200));
        s.hold();
        assert_eq!(s.state(), PlaybackState::Paused);
        assert!(s.cursor().paused);
        for _ in 0..50 {
            assert!(s.tick(Duration::from_millis(100)).is_empty());
        }
        assert!((s.cursor().elapsed - 0.2).abs() < 1e-9);
        s.release();
        assert_eq!(s.state(), PlaybackState::Playing);
        s.tick(Duration::from_millis(100));
        assert!((s.cursor().elapsed - 0.3).abs() < 1e-9);
    }

    #[test]
    fn views_are_scheduled_once_after_dwell_and_never_for_own_items() {
        let groups = vec![
            group(VIEWER, vec![entry(1, VIEWER, ItemKind::Image, None)]),
            group(
                20,
                vec![
                    entry(2, 20, ItemKind::Image, None),
                    entry(3, 20, ItemKind::Image, None),
                ],
            ),
        ];
        let mut s = PlaybackSession::open(groups, 0, VIEWER, config()).unwrap();
        let mut events = Vec::new();
        for _ in 0..40 {
            events.extend(s.tick(Duration::from_millis(100)));
        }
        let views: Vec<ItemId> = events
            .iter()
            .filter_map(|e| match e {
                PlaybackEvent::RecordView { item_id } => Some(*item_id),
                _ => None,
            })
            .collect();
        assert_eq!(views, vec![2, 3]);
    }

    #[test]
    fn item_shorter_than_dwell_counts_when_it_plays_out() {
        let groups = vec![group(
            20,
            vec![
                entry(1, 20, ItemKind::Image, Some(1)),
                entry(2, 20, ItemKind::Text, Some(1)),
            ],
        )];
        let cfg = PlaybackConfig::default();
        assert!(cfg.view_dwell > Duration::from_secs(1));
        let mut s = PlaybackSession::open(groups, 0, VIEWER, cfg).unwrap();

        let mut events = s.take_events();
        while !s.is_closed() {
            events.extend(s.tick(cfg.tick));
        }
        let views: Vec<ItemId> = events
            .iter()
            .filter_map(|e| match e {
                PlaybackEvent::RecordView { item_id } => Some(*item_id),
                _ => None,
            })
            .collect();
        assert_eq!(views, vec![1, 2]);
        assert_eq!(closes(&events), 1);
        assert!(s.groups()[0].items.iter().all(|e| e.viewed));
    }

    #[test]
    fn short_probed_video_counts_when_it_plays_out() {
        let groups = vec![group(20, vec![entry(7, 20, ItemKind::Video, None)])];
        let mut s = PlaybackSession::open(groups, 0, VIEWER, config()).unwrap();
        s.resolve_video_duration(7, Duration::from_millis(200));
        let mut events = s.take_events();
        events.extend(s.tick(Duration::from_millis(100)));
        events.extend(s.tick(Duration::from_millis(100)));
        assert!(events.contains(&PlaybackEvent::RecordView { item_id: 7 }));
        assert!(s.is_closed());
    }

    #[test]
    fn flicking_past_does_not_count_as_view() {
        let mut s = PlaybackSession::open(two_groups(), 0, VIEWER, config()).unwrap();
        let mut events = s.tick(Duration::from_millis(100));
        events.extend(s.next());
        events.extend(s.tick(Duration::from_millis(100)));
        events.extend(s.previous());
        events.extend(s.tick(Duration::from_millis(100)));
        assert!(!events
            .iter()
            .any(|e| matches!(e, PlaybackEvent::RecordView { .. })));
    }

    #[test]
    fn revisiting_an_item_does_not_schedule_twice() {
        let mut s = PlaybackSession::open(two_groups(), 0, VIEWER, config()).unwrap();
        let mut events = Vec::new();
        for _ in 0..4 {
            events.extend(s.tick(Duration::from_millis(100)));
        }
        events.extend(s.next());
        events.extend(s.previous());
        for _ in 0..4 {
            events.extend(s.tick(Duration::from_millis(100)));
        }
        let views = events
            .iter()
            .filter(|e| matches!(e, PlaybackEvent::RecordView { item_id: 1 }))
            .count();
        assert_eq!(views, 1);
    }

    #[test]
    fn independent_sessions_do_not_share_state() {
        let mut a = PlaybackSession::open(two_groups(), 0, VIEWER, config()).unwrap();
        let b = PlaybackSession::open(two_groups(), 0, VIEWER, config()).unwrap();
        a.next();
        a.close();
        assert!(a.is_closed());
        assert_eq!(b.state(), PlaybackState::Playing);
        assert_eq!(b.cursor().item, 0);
    }
}
