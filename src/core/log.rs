use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, TimeZone, Utc};
use git2::{Commit, ErrorCode, Oid, Repository, Signature};

use crate::error::{Result, SocialError};

use super::git_ops;

/// One entry of a snapshot log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: String,
    pub author: String,
    pub email: String,
    pub timestamp: DateTime<Utc>,
    pub payload: String,
}

/// Storage backend for versioned records, one keyspace per repository.
pub trait SnapshotLog: Send + Sync {
    /// Newest snapshot for `key`, `Ok(None)` when the key was never written.
    fn latest(&self, repo: &Path, key: &str) -> Result<Option<Snapshot>>;

    /// Record a new snapshot on top of the current one.
    fn append(&self, repo: &Path, key: &str, payload: &str) -> Result<Snapshot>;

    /// Snapshots newest first, restricted to `[since, until]` when given.
    fn history(
        &self,
        repo: &Path,
        key: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<Snapshot>>;

    /// Every key with at least one snapshot, sorted.
    fn keys(&self, repo: &Path) -> Result<Vec<String>>;

    /// Drop a key and its history. Returns whether it existed.
    fn remove(&self, repo: &Path, key: &str) -> Result<bool>;

    /// Whether the newest snapshot differs from what `origin` last advertised.
    fn is_unpushed(&self, _repo: &Path, _key: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Snapshot log stored as refs under `refs/<namespace>/lists/`.
#[derive(Debug, Clone)]
pub struct GitRefLog {
    namespace: String,
}

impl GitRefLog {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.trim_matches('/').to_string(),
        }
    }

    pub fn ref_prefix(&self) -> String {
        format!("refs/{}/lists/", self.namespace)
    }

    pub fn ref_name(&self, key: &str) -> String {
        format!("{}{}", self.ref_prefix(), key)
    }

    /// Refspec mirroring every list ref of a remote into the same namespace.
    pub fn fetch_refspec(&self) -> String {
        let prefix = self.ref_prefix();
        format!("+{prefix}*:{prefix}*")
    }

    fn remote_ref_name(&self, key: &str) -> String {
        format!("refs/remotes/origin/{}/lists/{}", self.namespace, key)
    }
}

fn open(path: &Path) -> Result<Repository> {
    Repository::open(path).map_err(|e| git_ops::map_git_error(path, e))
}

fn resolve(repo: &Repository, path: &Path, name: &str) -> Result<Option<Oid>> {
    match repo.refname_to_id(name) {
        Ok(oid) => Ok(Some(oid)),
        Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
        Err(e) => Err(git_ops::map_git_error(path, e)),
    }
}

fn snapshot_of(commit: &Commit<'_>) -> Snapshot {
    let author = commit.author();
    Snapshot {
        id: commit.id().to_string(),
        author: author.name().unwrap_or("").to_string(),
        email: author.email().unwrap_or("").to_string(),
        timestamp: Utc
            .timestamp_opt(commit.time().seconds(), 0)
            .single()
            .unwrap_or_default(),
        payload: commit.message().unwrap_or("").to_string(),
    }
}

fn signature(repo: &Repository) -> std::result::Result<Signature<'static>, git2::Error> {
    repo.signature()
        .or_else(|_| Signature::now("gitsocial", "gitsocial@localhost"))
}

impl SnapshotLog for GitRefLog {
    fn latest(&self, path: &Path, key: &str) -> Result<Option<Snapshot>> {
        let repo = open(path)?;
        let Some(oid) = resolve(&repo, path, &self.ref_name(key))? else {
            return Ok(None);
        };
        let commit = repo
            .find_commit(oid)
            .map_err(|e| git_ops::map_git_error(path, e))?;
        Ok(Some(snapshot_of(&commit)))
    }

    fn append(&self, path: &Path, key: &str, payload: &str) -> Result<Snapshot> {
        let repo = open(path)?;
        let name = self.ref_name(key);
        let git_err = |e: git2::Error| git_ops::map_git_error(path, e);

        let parent = match resolve(&repo, path, &name)? {
            Some(oid) => Some(repo.find_commit(oid).map_err(git_err)?),
            None => None,
        };
        let tree_id = repo
            .treebuilder(None)
            .and_then(|builder| builder.write())
            .map_err(git_err)?;
        let tree = repo.find_tree(tree_id).map_err(git_err)?;
        let sig = signature(&repo).map_err(git_err)?;
        let parents: Vec<&Commit<'_>> = parent.iter().collect();

        let oid = repo
            .commit(Some(&name), &sig, &sig, payload, &tree, &parents)
            .map_err(git_err)?;
        let commit = repo.find_commit(oid).map_err(git_err)?;
        Ok(snapshot_of(&commit))
    }

    fn history(
        &self,
        path: &Path,
        key: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<Snapshot>> {
        let repo = open(path)?;
        let Some(oid) = resolve(&repo, path, &self.ref_name(key))? else {
            return Ok(Vec::new());
        };
        let mut current = Some(
            repo.find_commit(oid)
                .map_err(|e| git_ops::map_git_error(path, e))?,
        );
        let mut snapshots = Vec::new();
        while let Some(commit) = current {
            let snapshot = snapshot_of(&commit);
            if since.is_some_and(|s| snapshot.timestamp < s) {
                break;
            }
            if until.is_none_or(|u| snapshot.timestamp <= u) {
                snapshots.push(snapshot);
            }
            current = commit.parent(0).ok();
        }
        Ok(snapshots)
    }

    fn keys(&self, path: &Path) -> Result<Vec<String>> {
        let repo = open(path)?;
        let prefix = self.ref_prefix();
        let refs = repo
            .references_glob(&format!("{prefix}*"))
            .map_err(|e| git_ops::map_git_error(path, e))?;
        let mut keys: Vec<String> = refs
            .flatten()
            .filter_map(|r| r.name().and_then(|n| n.strip_prefix(&prefix)).map(String::from))
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn remove(&self, path: &Path, key: &str) -> Result<bool> {
        let repo = open(path)?;
        match repo.find_reference(&self.ref_name(key)) {
            Ok(mut reference) => {
                reference
                    .delete()
                    .map_err(|e| git_ops::map_git_error(path, e))?;
                Ok(true)
            }
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(git_ops::map_git_error(path, e)),
        }
    }

    fn is_unpushed(&self, path: &Path, key: &str) -> Result<bool> {
        let repo = open(path)?;
        let local = resolve(&repo, path, &self.ref_name(key))?;
        let remote = resolve(&repo, path, &self.remote_ref_name(key))?;
        Ok(local.is_some() && local != remote)
    }
}

/// In-process snapshot log. Nothing survives the value being dropped.
#[derive(Debug, Default)]
pub struct MemoryLog {
    entries: RwLock<HashMap<(PathBuf, String), Vec<Snapshot>>>,
    counter: RwLock<u64>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append with an explicit author and timestamp.
    pub fn append_as(
        &self,
        repo: &Path,
        key: &str,
        payload: &str,
        author: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Snapshot> {
        let id = {
            let mut counter = self.counter.write().map_err(poisoned)?;
            *counter += 1;
            format!("{:040x}", *counter)
        };
        let snapshot = Snapshot {
            id,
            author: author.to_string(),
            email: format!("{author}@localhost"),
            timestamp,
            payload: payload.to_string(),
        };
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries
            .entry((repo.to_path_buf(), key.to_string()))
            .or_default()
            .push(snapshot.clone());
        Ok(snapshot)
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> SocialError {
    SocialError::Internal(format!("lock poisoned: {e}"))
}

impl SnapshotLog for MemoryLog {
    fn latest(&self, repo: &Path, key: &str) -> Result<Option<Snapshot>> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries
            .get(&(repo.to_path_buf(), key.to_string()))
            .and_then(|log| log.last().cloned()))
    }

    fn append(&self, repo: &Path, key: &str, payload: &str) -> Result<Snapshot> {
        self.append_as(repo, key, payload, "gitsocial", Utc::now())
    }

    fn history(
        &self,
        repo: &Path,
        key: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<Snapshot>> {
        let entries = self.entries.read().map_err(poisoned)?;
        let Some(log) = entries.get(&(repo.to_path_buf(), key.to_string())) else {
            return Ok(Vec::new());
        };
        Ok(log
            .iter()
            .rev()
            .filter(|s| since.is_none_or(|since| s.timestamp >= since))
            .filter(|s| until.is_none_or(|until| s.timestamp <= until))
            .cloned()
            .collect())
    }

    fn keys(&self, repo: &Path) -> Result<Vec<String>> {
        let entries = self.entries.read().map_err(poisoned)?;
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|(path, _)| path == repo)
            .map(|(_, key)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn remove(&self, repo: &Path, key: &str) -> Result<bool> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        Ok(entries
            .remove(&(repo.to_path_buf(), key.to_string()))
            .is_some())
    }
}
