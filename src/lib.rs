//! Ephemeral 24-hour stories: aggregation, playback, engagement and creation.
pub mod aggregator;
pub mod changes;
pub mod config;
pub mod creation;
pub mod db;
pub mod engagement;
pub mod error;
pub mod model;
pub mod player;
pub mod playback;
pub mod probe;
pub mod reply;
pub mod social;
pub mod storage;

pub use error::StoryError;
