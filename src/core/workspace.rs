use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::types::SocialConfig;
use crate::error::{Result, SocialError};

use super::cache::{ContentCache, RefreshScope, LOCAL_KEY};
use super::git_ops;
use super::list::{List, ListPatch, ListVersion};
use super::list_store::{ListStore, SyncReport};
use super::log::{GitRefLog, SnapshotLog};
use super::post::{CommitPostSource, Post, PostQuery, PostSource, Scope};
use super::protocol::{self, RepositoryId};
use super::social::{self, FollowerScan, Notification, ScanFailure};
use super::storage::{CleanupReport, EnsureOptions, FetchOptions, StorageManager};
use super::transport::Transport;

/// Result of materializing posts for a set of repositories.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    /// Repositories read, the workspace included.
    pub repositories: usize,
    pub posts: usize,
    pub failures: Vec<ScanFailure>,
    /// Nothing was done because the cache already reached `since`.
    pub skipped: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NotificationReport {
    pub notifications: Vec<Notification>,
    pub failures: Vec<ScanFailure>,
}

/// One session over a local repository. Every list write and every fetch
/// that reached the network invalidates the affected cache keys before
/// returning.
pub struct Workspace {
    workdir: PathBuf,
    config: SocialConfig,
    storage: Arc<StorageManager>,
    lists: ListStore,
    cache: ContentCache,
    posts: Arc<dyn PostSource>,
}

impl Workspace {
    /// Open the repository at `workdir`, keeping clones under the configured
    /// storage base.
    pub fn open(
        workdir: impl Into<PathBuf>,
        config: SocialConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let workdir = workdir.into();
        let storage = Arc::new(StorageManager::new(
            config.storage.base.clone(),
            &config,
            transport,
        ));
        let log = Arc::new(GitRefLog::new(&config.lists.namespace));
        Self::with_parts(workdir, config, storage, log, Arc::new(CommitPostSource))
    }

    /// Assemble a workspace from explicit collaborators.
    pub fn with_parts(
        workdir: impl Into<PathBuf>,
        config: SocialConfig,
        storage: Arc<StorageManager>,
        log: Arc<dyn SnapshotLog>,
        posts: Arc<dyn PostSource>,
    ) -> Result<Self> {
        let workdir = workdir.into();
        if git2::Repository::open(&workdir).is_err() {
            return Err(SocialError::NotInitialized(workdir.display().to_string()));
        }
        Ok(Self {
            lists: ListStore::new(log, storage.clone()),
            workdir,
            config,
            storage,
            cache: ContentCache::new(),
            posts,
        })
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn config(&self) -> &SocialConfig {
        &self.config
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    pub fn list_store(&self) -> &ListStore {
        &self.lists
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    /// Normalized url of the workspace's `origin`.
    pub fn origin_url(&self) -> Result<String> {
        git_ops::origin_url(&self.workdir)
    }

    fn branch(&self) -> String {
        git_ops::open_repo(&self.workdir)
            .ok()
            .and_then(|repo| git_ops::detect_default_branch(&repo))
            .unwrap_or_else(|| protocol::DEFAULT_BRANCH.to_string())
    }

    /// How the workspace's own posts are labelled: its origin, else its path.
    fn local_repository(&self) -> String {
        self.origin_url()
            .unwrap_or_else(|_| self.workdir.display().to_string())
    }

    fn default_since(&self) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::days(self.config.fetch.default_window_days)
    }

    // Lists

    pub async fn create_list(&self, id: &str, name: Option<&str>) -> Result<List> {
        let list = self.lists.create(&self.workdir, id, name).await?;
        self.cache.insert_list(LOCAL_KEY, &list)?;
        Ok(list)
    }

    pub fn get_list(&self, id: &str) -> Result<Option<List>> {
        if let Some(list) = self.cache.list(LOCAL_KEY, id)? {
            return Ok(Some(list));
        }
        let list = self.lists.read(&self.workdir, id)?;
        if let Some(list) = &list {
            self.cache.insert_list(LOCAL_KEY, list)?;
        }
        Ok(list)
    }

    pub fn get_lists(&self) -> Result<Vec<List>> {
        if let Some(lists) = self.cache.lists(LOCAL_KEY)? {
            return Ok(lists);
        }
        let lists = self.lists.get_all(&self.workdir)?;
        self.cache.put_lists(LOCAL_KEY, &lists)?;
        Ok(lists)
    }

    pub async fn update_list(&self, id: &str, patch: ListPatch) -> Result<List> {
        let result = self.lists.update(&self.workdir, id, patch).await;
        self.cache.invalidate_list(LOCAL_KEY, id)?;
        result
    }

    pub async fn delete_list(&self, id: &str) -> Result<()> {
        let result = self.lists.delete(&self.workdir, id).await;
        self.cache.invalidate_list(LOCAL_KEY, id)?;
        result
    }

    /// Add `url` to list `list_id` and keep a persistent clone of it.
    pub async fn add_repository(&self, list_id: &str, url: &str) -> Result<List> {
        let result = self.lists.add_repository(&self.workdir, list_id, url).await;
        self.cache.invalidate_list(LOCAL_KEY, list_id)?;
        let list = result?;

        let Some(entry) = list.position_of(url).map(|i| list.repositories[i].clone()) else {
            return Ok(list);
        };
        let id = protocol::parse_repository_id(&entry);
        let persistent = EnsureOptions {
            persistent: true,
            force: false,
        };
        if let Err(e) = self.storage.ensure(&id.repository, &id.branch, persistent).await {
            warn!(url = %id.repository, error = %e, "could not clone list member yet");
        }
        Ok(list)
    }

    pub async fn remove_repository(&self, list_id: &str, url: &str) -> Result<List> {
        let result = self
            .lists
            .remove_repository(&self.workdir, list_id, url)
            .await;
        self.cache.invalidate_list(LOCAL_KEY, list_id)?;
        result
    }

    pub fn get_list_history(
        &self,
        id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<ListVersion>> {
        self.lists.get_history(&self.workdir, id, since, until)
    }

    /// Lists published by a remote repository, flagged when a local list
    /// follows them.
    pub async fn get_remote_lists(&self, url: &str) -> Result<Vec<List>> {
        let base = protocol::base_url(url);
        let mut lists = match self.cache.lists(&base)? {
            Some(lists) => lists,
            None => {
                let branch = self.lists.branch_for(url).await?;
                let lists = self.lists.get_all_remote(&base, &branch).await?;
                self.cache.put_lists(&base, &lists)?;
                lists
            }
        };
        let followed: HashSet<String> = self
            .get_lists()?
            .into_iter()
            .filter_map(|list| list.source)
            .collect();
        for list in &mut lists {
            let source = List::source_ref(&base, &list.id);
            list.is_followed_locally = Some(followed.contains(&source));
        }
        Ok(lists)
    }

    pub async fn follow_list(
        &self,
        source_url: &str,
        source_list_id: &str,
        target_id: Option<&str>,
    ) -> Result<List> {
        let result = self
            .lists
            .follow(&self.workdir, source_url, source_list_id, target_id)
            .await;
        self.cache.invalidate_lists(source_url)?;
        let list = result?;
        self.cache.insert_list(LOCAL_KEY, &list)?;
        Ok(list)
    }

    pub async fn sync_list(&self, id: &str) -> Result<SyncReport> {
        let source = self
            .get_list(id)?
            .and_then(|list| list.source)
            .map(|source| protocol::parse_ref(&source).repository);
        let result = self.lists.sync(&self.workdir, id).await;
        self.cache.invalidate_list(LOCAL_KEY, id)?;
        if let Some(source) = source.filter(|s| !s.is_empty()) {
            self.cache.invalidate_lists(&source)?;
        }
        result
    }

    pub async fn unfollow_list(&self, id: &str) -> Result<List> {
        let result = self.lists.unfollow(&self.workdir, id).await;
        self.cache.invalidate_list(LOCAL_KEY, id)?;
        result
    }

    /// Every repository named by a workspace list, first appearance wins.
    pub fn followed_repositories(&self) -> Result<Vec<RepositoryId>> {
        let mut seen = HashSet::new();
        let mut followed = Vec::new();
        for list in self.get_lists()? {
            for entry in &list.repositories {
                let id = protocol::parse_repository_id(entry);
                if seen.insert(id.repository.clone()) {
                    followed.push(id);
                }
            }
        }
        Ok(followed)
    }

    // Posts

    /// Fetch and materialize one repository back to `since`.
    async fn load_into(&self, url: &str, branch: &str, since: DateTime<Utc>) -> Result<usize> {
        let key = protocol::repository_id(url, branch);
        let backfill = self
            .storage
            .fetch(url, branch, FetchOptions { since: Some(since) })
            .await?;
        let fetched = if backfill.skipped {
            !self
                .storage
                .fetch(url, branch, FetchOptions::default())
                .await?
                .skipped
        } else {
            true
        };
        if fetched {
            self.cache.invalidate_repository(&key)?;
        } else if self.cache.is_repository_covered(&key, since)? {
            return Ok(0);
        }
        let posts = self
            .posts
            .posts(&backfill.path, url, branch, Some(since), None)?;
        let count = posts.len();
        self.cache.insert_posts(&key, since, posts)?;
        debug!(url, count, "materialized repository posts");
        Ok(count)
    }

    fn load_local(&self, since: DateTime<Utc>) -> Result<usize> {
        let local = self.local_repository();
        let branch = self.branch();
        let posts = self
            .posts
            .posts(&self.workdir, &local, &branch, Some(since), None)?;
        let count = posts.len();
        self.cache
            .insert_posts(&protocol::repository_id(&local, &branch), since, posts)?;
        Ok(count)
    }

    /// Materialize a single repository into the cache.
    pub async fn load_repository_posts(&self, url: &str, branch: &str) -> Result<usize> {
        let since = self
            .cache
            .covered_since()?
            .unwrap_or_else(|| self.default_since());
        self.load_into(&protocol::normalize(url), branch, since).await
    }

    /// Extend cached coverage back to `since` for the workspace and every
    /// followed repository. A no-op when already covered. A followed
    /// repository that fails lands in the report; only reading the
    /// workspace itself can fail the call.
    pub async fn load_additional_posts(&self, since: DateTime<Utc>) -> Result<LoadReport> {
        if self.cache.is_cache_range_covered(since)? {
            return Ok(LoadReport {
                skipped: true,
                ..Default::default()
            });
        }
        let mut report = LoadReport {
            repositories: 1,
            posts: self.load_local(since)?,
            ..Default::default()
        };

        let followed = self.followed_repositories()?;
        let mut loads = std::pin::pin!(
            futures::stream::iter(followed)
                .map(|id| async move {
                    let result = self.load_into(&id.repository, &id.branch, since).await;
                    (id, result)
                })
                .buffer_unordered(self.config.fetch.concurrency.max(1))
        );
        while let Some((id, result)) = loads.next().await {
            match result {
                Ok(count) => {
                    report.repositories += 1;
                    report.posts += count;
                }
                Err(e) => {
                    warn!(repository = %id.repository, error = %e, "skipping repository");
                    report.failures.push(ScanFailure {
                        repository: id.id(),
                        code: e.code(),
                        message: e.to_string(),
                    });
                }
            }
        }
        if report.failures.is_empty() {
            self.cache.extend_coverage(since)?;
        }
        info!(since = %since, posts = report.posts, failures = report.failures.len(), "loaded posts");
        Ok(report)
    }

    /// Posts in `scope`, materializing whatever the cache lacks first.
    pub async fn get_posts(&self, scope: &Scope, query: &PostQuery) -> Result<Vec<Post>> {
        let since = query.since.unwrap_or_else(|| self.default_since());
        match scope {
            Scope::Repository(id) => {
                let id = protocol::parse_repository_id(id);
                let key = id.id();
                if query.skip_cache {
                    self.cache.invalidate_repository(&key)?;
                }
                if !self.cache.is_repository_covered(&key, since)? {
                    if protocol::same_repository(&id.repository, &self.local_repository()) {
                        self.load_local(since)?;
                    } else {
                        self.load_into(&id.repository, &id.branch, since).await?;
                    }
                }
            }
            _ => {
                if query.skip_cache {
                    self.cache.refresh(&RefreshScope {
                        repositories: self.followed_repositories()?.iter().map(RepositoryId::id).collect(),
                        ..Default::default()
                    })?;
                }
                self.load_additional_posts(since).await?;
            }
        }

        let local = self.local_repository();
        let members: Option<HashSet<String>> = match scope {
            Scope::All => None,
            Scope::Repository(id) => Some(HashSet::from([protocol::base_url(id)])),
            Scope::Timeline => {
                let mut members: HashSet<String> = self
                    .followed_repositories()?
                    .into_iter()
                    .map(|id| id.repository)
                    .collect();
                members.insert(protocol::base_url(&local));
                Some(members)
            }
            Scope::List(list_id) => {
                let list = self
                    .get_list(list_id)?
                    .ok_or_else(|| SocialError::ListNotFound(list_id.clone()))?;
                Some(list.repository_urls().into_iter().collect())
            }
        };
        self.cache.posts(
            |post| {
                members
                    .as_ref()
                    .is_none_or(|m| m.contains(&protocol::base_url(&post.repository)))
            },
            query,
        )
    }

    pub fn refresh(&self, scope: &RefreshScope) -> Result<()> {
        self.cache.refresh(scope)
    }

    // Social

    /// Followed repositories that list this workspace's origin in one of their lists.
    pub async fn get_followers(&self, limit: Option<usize>, cancel: &CancellationToken) -> Result<FollowerScan> {
        let local = self.origin_url()?;
        let followed = self.followed_repositories()?;
        let scan = social::get_followers(
            &self.lists,
            &local,
            followed.clone(),
            limit,
            self.config.fetch.concurrency,
            cancel,
        )
        .await;
        // Any of them may have had its list refs refetched
        for id in &followed {
            self.cache.invalidate_lists(&id.repository)?;
        }
        Ok(scan)
    }

    pub async fn is_follower(&self, url: &str) -> Result<bool> {
        let local = self.origin_url()?;
        let follower = social::is_follower(&self.lists, &local, url).await;
        self.cache.invalidate_lists(url)?;
        Ok(follower)
    }

    /// Follow events and interactions newer than `since`, newest first.
    pub async fn get_notifications(
        &self,
        since: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<NotificationReport> {
        let local = self.origin_url()?;
        let scan = self.get_followers(None, cancel).await?;
        let mut report = NotificationReport {
            failures: scan.failures,
            ..Default::default()
        };

        for follower in &scan.followers {
            match self
                .lists
                .get_remote_history(&follower.repository.url, &follower.list_id, None, None)
            {
                Ok(history) => report
                    .notifications
                    .extend(social::follow_notification(&history, &local)),
                Err(e) => report.failures.push(ScanFailure {
                    repository: follower.repository.id.clone(),
                    code: e.code(),
                    message: e.to_string(),
                }),
            }
        }

        let query = PostQuery {
            since,
            ..Default::default()
        };
        let posts = self.cache.posts(|_| true, &query)?;
        report
            .notifications
            .extend(social::derive_interactions(&posts, &local));

        report
            .notifications
            .retain(|n| since.is_none_or(|s| n.timestamp().is_none_or(|t| t >= s)));
        report
            .notifications
            .sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
        Ok(report)
    }

    pub async fn cleanup(&self) -> CleanupReport {
        self.storage.cleanup().await
    }
}
