use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SocialError};

use super::list::List;
use super::post::{Post, PostQuery};
use super::protocol;

/// Cache key of the workspace's own lists.
pub const LOCAL_KEY: &str = "";

/// What [`ContentCache::refresh`] drops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshScope {
    /// List ids, `url#list:id` refs, or `"*"` for everything.
    pub lists: Vec<String>,
    /// `url#branch:name` keys (a bare url means its default-named branch).
    pub repositories: Vec<String>,
    pub all: bool,
}

impl RefreshScope {
    pub fn everything() -> Self {
        Self {
            all: true,
            ..Default::default()
        }
    }

    pub fn list(id: &str) -> Self {
        Self {
            lists: vec![id.to_string()],
            ..Default::default()
        }
    }

    pub fn repository(key: &str) -> Self {
        Self {
            repositories: vec![key.to_string()],
            ..Default::default()
        }
    }

    fn clears_everything(&self) -> bool {
        self.all || self.lists.iter().any(|l| l == "*")
    }
}

#[derive(Debug, Default)]
struct CacheState {
    posts: HashMap<String, Post>,
    by_repository: HashMap<String, BTreeSet<String>>,
    /// repository key → oldest instant materialized for it
    coverage: HashMap<String, DateTime<Utc>>,
    covered_since: Option<DateTime<Utc>>,
    /// repository key (normalized url, [`LOCAL_KEY`] for the workspace) → lists by id
    lists: HashMap<String, HashMap<String, List>>,
    /// repository keys whose full list set is present
    complete_lists: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct ContentCache {
    state: RwLock<CacheState>,
}

/// Normalized `url#branch:name` for a repository key given in any accepted form.
pub fn repository_key(key: &str) -> String {
    protocol::parse_repository_id(key).id()
}

fn list_key(repository: &str) -> String {
    if repository.is_empty() {
        LOCAL_KEY.to_string()
    } else {
        protocol::base_url(repository)
    }
}

impl ContentCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, CacheState>> {
        self.state
            .read()
            .map_err(|e| SocialError::Internal(format!("cache lock poisoned: {e}")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, CacheState>> {
        self.state
            .write()
            .map_err(|e| SocialError::Internal(format!("cache lock poisoned: {e}")))
    }

    /// True when content has been materialized at least back to `since`.
    pub fn is_cache_range_covered(&self, since: DateTime<Utc>) -> Result<bool> {
        Ok(self.read()?.covered_since.is_some_and(|c| c <= since))
    }

    pub fn covered_since(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.read()?.covered_since)
    }

    /// Record that every tracked repository is materialized back to `since`.
    pub fn extend_coverage(&self, since: DateTime<Utc>) -> Result<()> {
        let mut state = self.write()?;
        state.covered_since = Some(state.covered_since.map_or(since, |c| c.min(since)));
        Ok(())
    }

    pub fn is_repository_covered(&self, key: &str, since: DateTime<Utc>) -> Result<bool> {
        let key = repository_key(key);
        Ok(self.read()?.coverage.get(&key).is_some_and(|c| *c <= since))
    }

    /// Store posts for one repository and note how far back they reach.
    pub fn insert_posts(&self, key: &str, since: DateTime<Utc>, posts: Vec<Post>) -> Result<()> {
        let key = repository_key(key);
        let mut state = self.write()?;
        let coverage = state.coverage.entry(key.clone()).or_insert(since);
        *coverage = (*coverage).min(since);
        for post in posts {
            state
                .by_repository
                .entry(key.clone())
                .or_default()
                .insert(post.id.clone());
            state.posts.insert(post.id.clone(), post);
        }
        Ok(())
    }

    /// Cached posts accepted by `include` and `query`, newest first.
    pub fn posts<F>(&self, include: F, query: &PostQuery) -> Result<Vec<Post>>
    where
        F: Fn(&Post) -> bool,
    {
        let state = self.read()?;
        let mut posts: Vec<Post> = state
            .posts
            .values()
            .filter(|post| query.matches(post) && include(post))
            .cloned()
            .collect();
        posts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = query.limit {
            posts.truncate(limit);
        }
        Ok(posts)
    }

    pub fn post_count(&self) -> Result<usize> {
        Ok(self.read()?.posts.len())
    }

    pub fn list(&self, repository: &str, id: &str) -> Result<Option<List>> {
        let state = self.read()?;
        Ok(state
            .lists
            .get(&list_key(repository))
            .and_then(|lists| lists.get(id))
            .cloned())
    }

    /// Every list of `repository`, only when the full set was cached.
    pub fn lists(&self, repository: &str) -> Result<Option<Vec<List>>> {
        let key = list_key(repository);
        let state = self.read()?;
        if !state.complete_lists.contains(&key) {
            return Ok(None);
        }
        let mut lists: Vec<List> = state
            .lists
            .get(&key)
            .map(|lists| lists.values().cloned().collect())
            .unwrap_or_default();
        lists.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(Some(lists))
    }

    /// Replace the cached list set of `repository`.
    pub fn put_lists(&self, repository: &str, lists: &[List]) -> Result<()> {
        let key = list_key(repository);
        let mut state = self.write()?;
        state.lists.insert(
            key.clone(),
            lists.iter().map(|l| (l.id.clone(), l.clone())).collect(),
        );
        state.complete_lists.insert(key);
        Ok(())
    }

    /// Add or replace one list without touching the rest of the set.
    pub fn insert_list(&self, repository: &str, list: &List) -> Result<()> {
        let mut state = self.write()?;
        state
            .lists
            .entry(list_key(repository))
            .or_default()
            .insert(list.id.clone(), list.clone());
        Ok(())
    }

    /// Drop one cached list. The repository's list set is no longer complete.
    pub fn invalidate_list(&self, repository: &str, id: &str) -> Result<()> {
        let key = list_key(repository);
        let mut state = self.write()?;
        if let Some(lists) = state.lists.get_mut(&key) {
            lists.remove(id);
        }
        state.complete_lists.remove(&key);
        Ok(())
    }

    /// Drop every cached list of `repository`.
    pub fn invalidate_lists(&self, repository: &str) -> Result<()> {
        let key = list_key(repository);
        let mut state = self.write()?;
        state.lists.remove(&key);
        state.complete_lists.remove(&key);
        Ok(())
    }

    /// Drop everything cached for one repository: its posts, coverage and lists.
    pub fn invalidate_repository(&self, key: &str) -> Result<()> {
        let key = repository_key(key);
        let lists = list_key(&key);
        let mut state = self.write()?;
        if let Some(ids) = state.by_repository.remove(&key) {
            for id in ids {
                state.posts.remove(&id);
            }
        }
        state.coverage.remove(&key);
        // Coverage is only as good as its least covered repository
        state.covered_since = None;
        state.lists.remove(&lists);
        state.complete_lists.remove(&lists);
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        *self.write()? = CacheState::default();
        Ok(())
    }

    pub fn refresh(&self, scope: &RefreshScope) -> Result<()> {
        if scope.clears_everything() {
            debug!("clearing content cache");
            return self.clear();
        }
        for list in &scope.lists {
            match protocol::try_parse_ref(list) {
                Ok(entity) if entity.kind == protocol::EntityKind::List => {
                    self.invalidate_list(&entity.repository, &entity.value)?;
                }
                _ => self.invalidate_list(LOCAL_KEY, list)?,
            }
        }
        for repository in &scope.repositories {
            self.invalidate_repository(repository)?;
        }
        Ok(())
    }
}
