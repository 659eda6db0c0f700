use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::error::{ErrorCode, Result, SocialError};

use super::list::{self, List, ListPatch, ListVersion};
use super::log::{Snapshot, SnapshotLog};
use super::protocol::{self, EntityKind};
use super::storage::{self, CloneMetadata, StorageManager};

/// Membership change applied by [`ListStore::sync`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub added: usize,
    pub removed: usize,
    pub list: List,
}

pub struct ListStore {
    log: Arc<dyn SnapshotLog>,
    storage: Arc<StorageManager>,
    writes: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

fn decode(snapshot: &Snapshot, key: &str) -> Option<List> {
    match serde_json::from_str::<List>(&snapshot.payload) {
        Ok(mut list) => {
            list.id = key.to_string();
            Some(list)
        }
        Err(e) => {
            warn!(list = key, commit = %snapshot.id, error = %e, "skipping corrupt list record");
            None
        }
    }
}

fn read_from(log: &dyn SnapshotLog, repo: &Path, id: &str) -> Result<Option<List>> {
    let Some(snapshot) = log.latest(repo, id)? else {
        return Ok(None);
    };
    Ok(decode(&snapshot, id).map(|mut list| {
        list.is_unpushed = log.is_unpushed(repo, id).ok();
        list
    }))
}

fn all_from(log: &dyn SnapshotLog, repo: &Path) -> Result<Vec<List>> {
    let mut lists = Vec::new();
    for key in log.keys(repo)? {
        if let Some(list) = read_from(log, repo, &key)? {
            lists.push(list);
        }
    }
    Ok(lists)
}

fn history_from(
    log: &dyn SnapshotLog,
    repo: &Path,
    id: &str,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
) -> Result<Vec<ListVersion>> {
    Ok(log
        .history(repo, id, since, until)?
        .into_iter()
        .filter_map(|snapshot| {
            let list = decode(&snapshot, id)?;
            Some(ListVersion {
                commit_id: snapshot.id,
                author: snapshot.author,
                email: snapshot.email,
                timestamp: snapshot.timestamp,
                list,
            })
        })
        .collect())
}

impl ListStore {
    pub fn new(log: Arc<dyn SnapshotLog>, storage: Arc<StorageManager>) -> Self {
        Self {
            log,
            storage,
            writes: Mutex::new(HashMap::new()),
        }
    }

    pub fn log(&self) -> &Arc<dyn SnapshotLog> {
        &self.log
    }

    /// Serialize read-modify-write cycles per repository.
    async fn write_lock(&self, repo: &Path) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut writes = self
                .writes
                .lock()
                .map_err(|e| SocialError::Internal(format!("lock poisoned: {e}")))?;
            writes.retain(|_, lock| Arc::strong_count(lock) > 1);
            writes.entry(repo.to_path_buf()).or_default().clone()
        };
        Ok(lock.lock_owned().await)
    }

    fn persist(&self, repo: &Path, mut list: List) -> Result<List> {
        let payload = serde_json::to_string(&list)?;
        self.log.append(repo, &list.id, &payload)?;
        list.is_unpushed = self.log.is_unpushed(repo, &list.id).ok();
        Ok(list)
    }

    fn require(&self, repo: &Path, id: &str) -> Result<List> {
        self.read(repo, id)?
            .ok_or_else(|| SocialError::ListNotFound(id.to_string()))
    }

    /// Current state of list `id`, `None` when it was never written or its
    /// newest record is unreadable.
    pub fn read(&self, repo: &Path, id: &str) -> Result<Option<List>> {
        read_from(self.log.as_ref(), repo, id)
    }

    pub async fn create(&self, repo: &Path, id: &str, name: Option<&str>) -> Result<List> {
        list::validate_list_id(id)?;
        let _guard = self.write_lock(repo).await?;
        if self.read(repo, id)?.is_some() {
            return Err(SocialError::ListExists(id.to_string()));
        }
        let created = self.persist(repo, List::new(id, name))?;
        info!(list = id, repo = %repo.display(), "created list");
        Ok(created)
    }

    /// Merge `patch` over list `id`. Version and id are never touched.
    /// Replacement members are qualified like [`ListStore::add_repository`]
    /// and repeated repositories keep their first entry.
    pub async fn update(&self, repo: &Path, id: &str, mut patch: ListPatch) -> Result<List> {
        if let Some(entries) = patch.repositories.take() {
            let mut seen = HashSet::new();
            let mut qualified = Vec::with_capacity(entries.len());
            for entry in &entries {
                let entry = self.qualify(entry).await?;
                if seen.insert(protocol::base_url(&entry)) {
                    qualified.push(entry);
                }
            }
            patch.repositories = Some(qualified);
        }
        let _guard = self.write_lock(repo).await?;
        let mut current = self.require(repo, id)?;
        patch.apply(&mut current);
        self.persist(repo, current)
    }

    pub async fn delete(&self, repo: &Path, id: &str) -> Result<()> {
        let _guard = self.write_lock(repo).await?;
        if !self.log.remove(repo, id)? {
            return Err(SocialError::ListNotFound(id.to_string()));
        }
        info!(list = id, repo = %repo.display(), "deleted list");
        Ok(())
    }

    /// Branch-qualified form of `url`, asking the remote for its default
    /// branch when `url` does not name one.
    pub async fn qualify(&self, url: &str) -> Result<String> {
        let base = protocol::normalize(url);
        if let Some(branch) = protocol::explicit_branch(url) {
            return Ok(protocol::repository_id(&base, &branch));
        }
        let location = storage::remote_location(url);
        let detect = self.storage.transport().default_branch(&location);
        let branch = match tokio::time::timeout(self.storage.timeout(), detect).await {
            Ok(Ok(branch)) => branch,
            Ok(Err(e)) if e.code() == ErrorCode::BranchDetectionFailed => return Err(e),
            Ok(Err(e)) => {
                return Err(SocialError::BranchDetection {
                    url: base,
                    message: e.to_string(),
                });
            }
            Err(_) => {
                return Err(SocialError::BranchDetection {
                    url: base,
                    message: format!("timed out after {}s", self.storage.timeout().as_secs()),
                });
            }
        };
        debug!(url = %base, %branch, "detected default branch");
        Ok(protocol::repository_id(&base, &branch))
    }

    pub async fn add_repository(&self, repo: &Path, list_id: &str, url: &str) -> Result<List> {
        let duplicate = |list: &List| SocialError::RepositoryExists {
            list: list.id.clone(),
            url: protocol::base_url(url),
        };
        let current = self.require(repo, list_id)?;
        if current.contains_repository(url) {
            return Err(duplicate(&current));
        }
        let entry = self.qualify(url).await?;

        let _guard = self.write_lock(repo).await?;
        let mut current = self.require(repo, list_id)?;
        if current.contains_repository(&entry) {
            return Err(duplicate(&current));
        }
        current.repositories.push(entry);
        self.persist(repo, current)
    }

    /// Remove the entry for `url`'s repository whatever branch either side names.
    pub async fn remove_repository(&self, repo: &Path, list_id: &str, url: &str) -> Result<List> {
        let _guard = self.write_lock(repo).await?;
        let mut current = self.require(repo, list_id)?;
        let Some(index) = current.position_of(url) else {
            return Err(SocialError::RepositoryNotFound(protocol::base_url(url)));
        };
        current.repositories.remove(index);
        self.persist(repo, current)
    }

    /// Every readable list of the repository at `repo`, ordered by id.
    pub fn get_all(&self, repo: &Path) -> Result<Vec<List>> {
        all_from(self.log.as_ref(), repo)
    }

    /// Lists of a remote repository, read from its clone after refreshing
    /// the list refs. A clone lost to a lock file reads as empty.
    pub async fn get_all_remote(&self, url: &str, branch: &str) -> Result<Vec<List>> {
        let path = match self.storage.fetch_lists(url, branch).await {
            Ok(path) => path,
            Err(e) if e.code() == ErrorCode::LockFileError => {
                warn!(url, error = %e, "clone discarded, treating lists as absent");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        match all_from(self.storage.list_log(), &path) {
            Ok(lists) => Ok(lists
                .into_iter()
                .map(|mut list| {
                    list.is_unpushed = None;
                    list
                })
                .collect()),
            Err(e) if e.code() == ErrorCode::LockFileError => {
                warn!(url, error = %e, "lock file while reading lists");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Versions of list `id`, newest first, restricted to `[since, until]`.
    pub fn get_history(
        &self,
        repo: &Path,
        id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<ListVersion>> {
        history_from(self.log.as_ref(), repo, id, since, until)
    }

    /// History of a remote repository's list as last fetched into its clone.
    /// Empty when no clone exists.
    pub fn get_remote_history(
        &self,
        url: &str,
        id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<ListVersion>> {
        match self.storage.existing_clone(url) {
            Some(path) => history_from(self.storage.list_log(), &path, id, since, until),
            None => Ok(Vec::new()),
        }
    }

    /// Branch a remote is followed on: explicit selector, then the branch an
    /// existing clone was made for, then the remote's default.
    pub async fn branch_for(&self, url: &str) -> Result<String> {
        if let Some(branch) = protocol::explicit_branch(url) {
            return Ok(branch);
        }
        if let Some(path) = self.storage.existing_clone(url) {
            if let Ok(metadata) = CloneMetadata::load(&path) {
                return Ok(metadata.branch);
            }
        }
        let qualified = self.qualify(url).await?;
        Ok(protocol::parse_repository_id(&qualified).branch)
    }

    async fn source_list(&self, source_url: &str, source_list_id: &str) -> Result<List> {
        let repository = protocol::base_url(source_url);
        let branch = self.branch_for(source_url).await?;
        self.get_all_remote(&repository, &branch)
            .await?
            .into_iter()
            .find(|list| list.id == source_list_id)
            .ok_or_else(|| {
                SocialError::SourceNotFound(List::source_ref(&repository, source_list_id))
            })
    }

    /// Copy a remote list into a new local list that remembers its source.
    pub async fn follow(
        &self,
        repo: &Path,
        source_url: &str,
        source_list_id: &str,
        target_id: Option<&str>,
    ) -> Result<List> {
        let target = target_id.unwrap_or(source_list_id);
        list::validate_list_id(target)?;
        let source = self.source_list(source_url, source_list_id).await?;

        let _guard = self.write_lock(repo).await?;
        if self.read(repo, target)?.is_some() {
            return Err(SocialError::ListExists(target.to_string()));
        }
        let mut followed = List::new(target, Some(&source.name));
        followed.repositories = source.repositories;
        followed.source = Some(List::source_ref(
            &protocol::base_url(source_url),
            source_list_id,
        ));
        let followed = self.persist(repo, followed)?;
        info!(list = target, source = ?followed.source, "following list");
        Ok(followed)
    }

    /// Re-copy a followed list from its source, counting membership changes
    /// by repository.
    pub async fn sync(&self, repo: &Path, list_id: &str) -> Result<SyncReport> {
        let current = self.require(repo, list_id)?;
        let source_ref = current
            .source
            .clone()
            .ok_or_else(|| SocialError::ListNotFollowed(list_id.to_string()))?;
        let source = protocol::try_parse_ref(&source_ref)?;
        if source.kind != EntityKind::List || source.is_local() {
            return Err(SocialError::InvalidRef(source_ref));
        }
        let upstream = self.source_list(&source.repository, &source.value).await?;

        let _guard = self.write_lock(repo).await?;
        let mut current = self.require(repo, list_id)?;
        let before: BTreeSet<String> = current.repository_urls().into_iter().collect();
        let after: BTreeSet<String> = upstream.repository_urls().into_iter().collect();
        let added = after.difference(&before).count();
        let removed = before.difference(&after).count();

        if current.repositories != upstream.repositories {
            current.repositories = upstream.repositories;
            current = self.persist(repo, current)?;
        }
        info!(list = list_id, added, removed, "synced followed list");
        Ok(SyncReport {
            added,
            removed,
            list: current,
        })
    }

    /// Stop following a source, keeping the list and its members.
    pub async fn unfollow(&self, repo: &Path, list_id: &str) -> Result<List> {
        let _guard = self.write_lock(repo).await?;
        let mut current = self.require(repo, list_id)?;
        if current.source.is_none() {
            return Err(SocialError::ListNotFollowed(list_id.to_string()));
        }
        current.source = None;
        self.persist(repo, current)
    }
}
