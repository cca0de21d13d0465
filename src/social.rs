//! Read-side port onto the social graph.
use crate::db::{self, Pool};
use crate::model::{Profile, UserId};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;

#[async_trait]
pub trait SocialGraph: Send + Sync {
    /// Profiles for the given ids. Unknown ids are simply absent.
    async fn profiles(&self, ids: &[UserId]) -> Result<Vec<Profile>>;

    /// Case-insensitive handle lookup, used to resolve `@mentions`.
    async fn profiles_by_handle(&self, handles: &[String]) -> Result<Vec<Profile>>;

    /// Everyone `viewer` follows.
    async fn following(&self, viewer: UserId) -> Result<HashSet<UserId>>;
}

/// Social graph read from the `profiles` and `follows` tables.
#[derive(Debug, Clone)]
pub struct SqliteSocialGraph {
    pool: Pool,
}

impl SqliteSocialGraph {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SocialGraph for SqliteSocialGraph {
    async fn profiles(&self, ids: &[UserId]) -> Result<Vec<Profile>> {
        db::profiles_by_ids(&self.pool, ids).await
    }

    async fn profiles_by_handle(&self, handles: &[String]) -> Result<Vec<Profile>> {
        db::profiles_by_handles(&self.pool, handles).await
    }

    async fn following(&self, viewer: UserId) -> Result<HashSet<UserId>> {
        db::following_ids(&self.pool, viewer).await
    }
}
