use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use git2::{ConfigLevel, Repository};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::types::{FetchConfig, SocialConfig};
use crate::error::{ErrorCode, Result, SocialError};

use super::git_ops;
use super::log::GitRefLog;
use super::protocol;
use super::ranges::{self, DateRange};
use super::repo::Repo;
use super::transport::{FetchRequest, Transport};

const REPOSITORIES_DIR: &str = "repositories";
const MAX_SLUG_LEN: usize = 60;

const KEY_URL: &str = "gitsocial.url";
const KEY_BRANCH: &str = "gitsocial.branch";
const KEY_PERSISTENT: &str = "gitsocial.persistent";
const KEY_CREATED_AT: &str = "gitsocial.createdat";
const KEY_LAST_FETCH: &str = "gitsocial.lastfetch";
const KEY_FETCHED_RANGES: &str = "gitsocial.fetchedranges";

/// Bookkeeping stored in a clone's local git config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloneMetadata {
    pub url: String,
    pub branch: String,
    pub persistent: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub last_fetch: Option<DateTime<Utc>>,
    pub fetched_ranges: Vec<DateRange>,
}

fn local_config(path: &Path) -> Result<git2::Config> {
    let repo = git_ops::open_repo(path)?;
    repo.config()
        .and_then(|config| config.open_level(ConfigLevel::Local))
        .map_err(|e| git_ops::map_git_error(path, e))
}

fn get_string(config: &git2::Config, key: &str) -> Option<String> {
    config.get_string(key).ok().filter(|v| !v.is_empty())
}

impl CloneMetadata {
    pub fn load(path: &Path) -> Result<Self> {
        let config = local_config(path)?;
        let instant = |key: &str| get_string(&config, key).and_then(|raw| ranges::parse_instant(&raw));
        let fetched_ranges = match get_string(&config, KEY_FETCHED_RANGES) {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "ignoring corrupt fetched ranges");
                Vec::new()
            }),
            None => Vec::new(),
        };
        Ok(Self {
            url: get_string(&config, KEY_URL).unwrap_or_default(),
            branch: get_string(&config, KEY_BRANCH)
                .unwrap_or_else(|| protocol::DEFAULT_BRANCH.to_string()),
            persistent: config.get_bool(KEY_PERSISTENT).unwrap_or(false),
            created_at: instant(KEY_CREATED_AT),
            last_fetch: instant(KEY_LAST_FETCH),
            fetched_ranges,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut config = local_config(path)?;
        let git_err = |e: git2::Error| git_ops::map_git_error(path, e);
        config.set_str(KEY_URL, &self.url).map_err(git_err)?;
        config.set_str(KEY_BRANCH, &self.branch).map_err(git_err)?;
        config
            .set_bool(KEY_PERSISTENT, self.persistent)
            .map_err(git_err)?;
        if let Some(created) = self.created_at {
            config
                .set_str(KEY_CREATED_AT, &created.to_rfc3339())
                .map_err(git_err)?;
        }
        if let Some(last) = self.last_fetch {
            config
                .set_str(KEY_LAST_FETCH, &last.to_rfc3339())
                .map_err(git_err)?;
        }
        let ranges = serde_json::to_string(&self.fetched_ranges)?;
        config
            .set_str(KEY_FETCHED_RANGES, &ranges)
            .map_err(git_err)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnsureOptions {
    /// Persistent clones are never evicted by [`StorageManager::cleanup`].
    pub persistent: bool,
    /// Discard any existing clone and start over.
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsureOutcome {
    pub path: PathBuf,
    pub cloned: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Oldest instant the caller needs. `None` asks for an incremental refresh.
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchOutcome {
    pub path: PathBuf,
    /// True when nothing was requested from the network.
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetched_range: Option<DateRange>,
    pub fetched_ranges: Vec<DateRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fetch: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub kept: usize,
    pub failures: Vec<CleanupFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupFailure {
    pub path: PathBuf,
    pub message: String,
}

/// Owner of every isolated clone under one storage base. Each clone keeps
/// its origin, branch, persistence flag and fetched ranges in its own git
/// config.
pub struct StorageManager {
    base: PathBuf,
    fetch: FetchConfig,
    retention: chrono::Duration,
    lists: GitRefLog,
    transport: Arc<dyn Transport>,
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl StorageManager {
    pub fn new(base: impl Into<PathBuf>, config: &SocialConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            base: base.into(),
            fetch: config.fetch.clone(),
            retention: chrono::Duration::days(config.storage.retention_days),
            lists: GitRefLog::new(&config.lists.namespace),
            transport,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Log that reads the list refs mirrored into clones.
    pub fn list_log(&self) -> &GitRefLog {
        &self.lists
    }

    fn repositories_dir(&self) -> PathBuf {
        self.base.join(REPOSITORIES_DIR)
    }

    /// Deterministic clone location for `url`: a readable slug plus a short hash.
    pub fn clone_dir(&self, url: &str) -> PathBuf {
        let normalized = protocol::normalize(url);
        let location = normalized
            .split_once("://")
            .map_or(normalized.as_str(), |(_, rest)| rest);
        let mut slug: String = location
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect();
        slug = slug.trim_matches('-').to_string();
        while slug.contains("--") {
            slug = slug.replace("--", "-");
        }
        slug.truncate(MAX_SLUG_LEN);
        let hex = blake3::hash(normalized.as_bytes()).to_hex();
        let short = &hex.as_str()[..8];
        self.repositories_dir()
            .join(format!("{}-{short}", slug.trim_end_matches('-')))
    }

    /// Clone directory for `url` if one exists on disk.
    pub fn existing_clone(&self, url: &str) -> Option<PathBuf> {
        let path = self.clone_dir(url);
        path.exists().then_some(path)
    }

    fn lock_for(&self, path: &Path) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| SocialError::Internal(format!("lock poisoned: {e}")))?;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Ok(locks.entry(path.to_path_buf()).or_default().clone())
    }

    async fn network<T>(&self, operation: String, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let timeout = self.fetch.timeout();
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| SocialError::Timeout {
                operation,
                seconds: timeout.as_secs(),
            })?
    }

    /// A lock-file failure marks the clone as corrupt; drop it so the next
    /// access starts fresh.
    fn discard_on_lock<T>(&self, path: &Path, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.code() == ErrorCode::LockFileError && path.exists() {
                warn!(path = %path.display(), error = %e, "lock file in clone, removing it");
                if let Err(remove) = std::fs::remove_dir_all(path) {
                    warn!(path = %path.display(), error = %remove, "could not remove clone");
                }
            }
        }
        result
    }

    fn branch_refspec(branch: &str) -> String {
        format!("+refs/heads/{branch}:refs/heads/{branch}")
    }

    /// Make sure a clone of `url` exists. Idempotent unless `force` is set.
    pub async fn ensure(&self, url: &str, branch: &str, options: EnsureOptions) -> Result<EnsureOutcome> {
        let path = self.clone_dir(url);
        let lock = self.lock_for(&path)?;
        let _guard = lock.lock().await;
        let result = self.ensure_locked(url, branch, options, &path).await;
        self.discard_on_lock(&path, result)
    }

    async fn ensure_locked(
        &self,
        url: &str,
        branch: &str,
        options: EnsureOptions,
        path: &Path,
    ) -> Result<EnsureOutcome> {
        if path.exists() && !options.force {
            if options.persistent {
                let mut metadata = CloneMetadata::load(path)?;
                if !metadata.persistent {
                    debug!(url, "promoting clone to persistent");
                    metadata.persistent = true;
                    metadata.save(path)?;
                }
            }
            return Ok(EnsureOutcome {
                path: path.to_path_buf(),
                cloned: false,
            });
        }
        if path.exists() {
            std::fs::remove_dir_all(path).map_err(|e| SocialError::io(path, e))?;
        }

        let result = self.clone_into(url, branch, options.persistent, path).await;
        if result.is_err() && path.exists() {
            // Half-initialized clones would otherwise satisfy the next ensure
            if let Err(e) = std::fs::remove_dir_all(path) {
                warn!(path = %path.display(), error = %e, "could not remove failed clone");
            }
        }
        result.map(|()| EnsureOutcome {
            path: path.to_path_buf(),
            cloned: true,
        })
    }

    async fn clone_into(&self, url: &str, branch: &str, persistent: bool, path: &Path) -> Result<()> {
        let location = remote_location(url);
        let normalized = protocol::normalize(url);
        info!(url = %normalized, branch, path = %path.display(), persistent, "cloning");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SocialError::io(parent, e))?;
        }
        {
            let repo = Repository::init_bare(path).map_err(|e| git_ops::map_git_error(path, e))?;
            repo.remote("origin", &location)
                .map_err(|e| git_ops::map_git_error(path, e))?;
        }
        CloneMetadata {
            url: normalized,
            branch: branch.to_string(),
            persistent,
            created_at: Some(Utc::now()),
            ..Default::default()
        }
        .save(path)?;

        let request = FetchRequest::new(&location, vec![Self::branch_refspec(branch)]).depth(1);
        self.network(
            format!("clone {location}"),
            self.transport.fetch(path, &request),
        )
        .await?;
        self.fetch_list_refs(&location, path).await
    }

    /// List refs always come with their full history; follow events need
    /// every version, whatever window the branch was fetched with.
    async fn fetch_list_refs(&self, location: &str, path: &Path) -> Result<()> {
        let request = FetchRequest::new(location, vec![self.lists.fetch_refspec()]);
        self.network(
            format!("fetch lists {location}"),
            self.transport.fetch(path, &request),
        )
        .await
    }

    /// Fetch `url` back to `options.since`, skipping the network entirely when
    /// that instant is already inside a recorded range.
    pub async fn fetch(&self, url: &str, branch: &str, options: FetchOptions) -> Result<FetchOutcome> {
        let path = self.clone_dir(url);
        let lock = self.lock_for(&path)?;
        let _guard = lock.lock().await;
        let result = async {
            self.ensure_locked(url, branch, EnsureOptions::default(), &path)
                .await?;
            self.fetch_locked(branch, options, &path).await
        }
        .await;
        self.discard_on_lock(&path, result)
    }

    async fn fetch_locked(&self, branch: &str, options: FetchOptions, path: &Path) -> Result<FetchOutcome> {
        let mut metadata = CloneMetadata::load(path)?;
        let now = Utc::now();
        let skipped = |metadata: CloneMetadata| FetchOutcome {
            path: path.to_path_buf(),
            skipped: true,
            fetched_range: None,
            fetched_ranges: metadata.fetched_ranges,
            last_fetch: metadata.last_fetch,
        };

        let last_fetch = metadata.last_fetch;
        let (since, shallow_since) = match options.since {
            Some(since) => {
                if ranges::covers(&metadata.fetched_ranges, since) {
                    debug!(url = %metadata.url, %since, "range already fetched, skipping");
                    return Ok(skipped(metadata));
                }
                // Never shorten history that is already present
                let shallow = ranges::earliest(&metadata.fetched_ranges)
                    .map_or(since, |earliest| earliest.min(since));
                (since, Some(shallow))
            }
            None => match last_fetch {
                Some(last) if (now - last).num_seconds() < self.fetch.min_interval_secs => {
                    debug!(url = %metadata.url, %last, "fetched recently, skipping");
                    return Ok(skipped(metadata));
                }
                Some(last) => (last, None),
                None => {
                    let window = now - chrono::Duration::days(self.fetch.default_window_days);
                    (window, Some(window))
                }
            },
        };

        let location = origin_location(path).unwrap_or_else(|| metadata.url.clone());
        let mut request = FetchRequest::new(&location, vec![Self::branch_refspec(branch)]);
        if let Some(shallow) = shallow_since {
            request = request.shallow_since(shallow);
        }
        self.network(
            format!("fetch {location}"),
            self.transport.fetch(path, &request),
        )
        .await?;
        self.fetch_list_refs(&location, path).await?;

        let range = DateRange::new(since, now);
        let mut updated = metadata.fetched_ranges.clone();
        updated.push(range);
        metadata.fetched_ranges = ranges::merge_ranges(updated);
        metadata.last_fetch = Some(now);
        metadata.save(path)?;
        info!(url = %metadata.url, start = %range.start, "fetched");

        Ok(FetchOutcome {
            path: path.to_path_buf(),
            skipped: false,
            fetched_range: Some(range),
            fetched_ranges: metadata.fetched_ranges,
            last_fetch: metadata.last_fetch,
        })
    }

    /// Bring a clone's list refs up to date with its origin. Clones on demand.
    /// Every successful call has been to the network.
    pub async fn fetch_lists(&self, url: &str, branch: &str) -> Result<PathBuf> {
        let path = self.clone_dir(url);
        let lock = self.lock_for(&path)?;
        let _guard = lock.lock().await;
        let result = async {
            let ensured = self
                .ensure_locked(url, branch, EnsureOptions::default(), &path)
                .await?;
            if ensured.cloned {
                return Ok(ensured.path);
            }
            let location = origin_location(&path).unwrap_or_else(|| remote_location(url));
            self.fetch_list_refs(&location, &path).await?;
            Ok(ensured.path)
        }
        .await;
        self.discard_on_lock(&path, result)
    }

    /// Delete the clone of `url`. Returns whether one existed.
    pub async fn remove(&self, url: &str) -> Result<bool> {
        let path = self.clone_dir(url);
        let lock = self.lock_for(&path)?;
        let _guard = lock.lock().await;
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&path).map_err(|e| SocialError::io(&path, e))?;
        info!(path = %path.display(), "removed clone");
        Ok(true)
    }

    fn clone_paths(&self) -> Vec<PathBuf> {
        let root = self.repositories_dir();
        if !root.exists() {
            return Vec::new();
        }
        WalkDir::new(&root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_dir())
            .map(|entry| entry.into_path())
            .collect()
    }

    /// Evict ephemeral clones not fetched within the retention window.
    pub async fn cleanup(&self) -> CleanupReport {
        self.cleanup_at(Utc::now()).await
    }

    pub async fn cleanup_at(&self, now: DateTime<Utc>) -> CleanupReport {
        let mut report = CleanupReport::default();
        for path in self.clone_paths() {
            let lock = match self.lock_for(&path) {
                Ok(lock) => lock,
                Err(e) => {
                    report.failures.push(CleanupFailure {
                        path,
                        message: e.to_string(),
                    });
                    continue;
                }
            };
            let _guard = lock.lock().await;
            let metadata = match CloneMetadata::load(&path) {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable clone metadata");
                    report.failures.push(CleanupFailure {
                        path,
                        message: e.to_string(),
                    });
                    continue;
                }
            };
            let touched = metadata.last_fetch.or(metadata.created_at);
            let expired = touched.is_none_or(|t| now - t > self.retention);
            if metadata.persistent || !expired {
                report.kept += 1;
                continue;
            }
            match std::fs::remove_dir_all(&path) {
                Ok(()) => {
                    info!(path = %path.display(), "evicted ephemeral clone");
                    report.removed.push(path);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to evict clone");
                    report.failures.push(CleanupFailure {
                        path,
                        message: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Every clone on disk as a repository entity.
    pub fn repositories(&self) -> Vec<Repo> {
        self.clone_paths()
            .into_iter()
            .filter_map(|path| match CloneMetadata::load(&path) {
                Ok(metadata) if !metadata.url.is_empty() => {
                    let mut repo = Repo::remote(&metadata.url, &metadata.branch);
                    repo.path = Some(path);
                    repo.last_fetch_time = metadata.last_fetch;
                    repo.fetched_ranges = Some(metadata.fetched_ranges);
                    Some(repo)
                }
                Ok(_) => None,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "skipping unreadable clone");
                    None
                }
            })
            .collect()
    }

    /// Timeout applied to each network call.
    pub fn timeout(&self) -> Duration {
        self.fetch.timeout()
    }
}

/// What to hand git as the remote: the caller's url without any selector.
pub(crate) fn remote_location(url: &str) -> String {
    url.trim()
        .split('#')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn origin_location(path: &Path) -> Option<String> {
    let repo = Repository::open(path).ok()?;
    git_ops::extract_remotes(&repo)
        .into_iter()
        .find(|r| r.name == "origin" && !r.url.is_empty())
        .map(|r| r.url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTransport {
        fetches: AtomicUsize,
        requests: Mutex<Vec<FetchRequest>>,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn fetch(&self, _repo: &Path, request: &FetchRequest) -> Result<()> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            Ok(())
        }

        async fn default_branch(&self, _url: &str) -> Result<String> {
            Ok("main".into())
        }
    }

    struct FailingTransport(fn(&Path) -> SocialError);

    #[async_trait]
    impl Transport for FailingTransport {
        async fn fetch(&self, repo: &Path, _request: &FetchRequest) -> Result<()> {
            Err((self.0)(repo))
        }

        async fn default_branch(&self, url: &str) -> Result<String> {
            Err(SocialError::BranchDetection {
                url: url.into(),
                message: "offline".into(),
            })
        }
    }

    fn manager(base: &Path, transport: Arc<dyn Transport>) -> StorageManager {
        StorageManager::new(base, &SocialConfig::default(), transport)
    }

    fn day(s: &str) -> DateTime<Utc> {
        ranges::parse_instant(s).unwrap()
    }

    #[test]
    fn clone_dir_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let storage = manager(dir.path(), Arc::new(CountingTransport::default()));
        let a = storage.clone_dir("https://GitHub.com/u/r.git");
        let b = storage.clone_dir("https://github.com/u/r#branch:develop");
        assert_eq!(a, b);
        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("github-com-u-r-"), "{name}");
        assert_ne!(a, storage.clone_dir("https://github.com/u/s"));
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(CountingTransport::default());
        let storage = manager(dir.path(), transport.clone());

        let first = storage
            .ensure("https://github.com/u/r", "main", EnsureOptions::default())
            .await
            .unwrap();
        let second = storage
            .ensure("https://github.com/u/r", "main", EnsureOptions::default())
            .await
            .unwrap();
        assert!(first.cloned);
        assert!(!second.cloned);
        assert_eq!(first.path, second.path);
        // branch at depth 1, then the list refs
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 2);

        let metadata = CloneMetadata::load(&first.path).unwrap();
        assert_eq!(metadata.url, "https://github.com/u/r");
        assert!(!metadata.persistent);
        assert!(metadata.created_at.is_some());
    }

    #[tokio::test]
    async fn ensure_promotes_but_never_demotes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = manager(dir.path(), Arc::new(CountingTransport::default()));
        let url = "https://github.com/u/r";
        let persistent = EnsureOptions {
            persistent: true,
            force: false,
        };

        let path = storage.ensure(url, "main", EnsureOptions::default()).await.unwrap().path;
        storage.ensure(url, "main", persistent).await.unwrap();
        assert!(CloneMetadata::load(&path).unwrap().persistent);
        storage.ensure(url, "main", EnsureOptions::default()).await.unwrap();
        assert!(CloneMetadata::load(&path).unwrap().persistent);
    }

    #[tokio::test]
    async fn fetch_skips_covered_since() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(CountingTransport::default());
        let storage = manager(dir.path(), transport.clone());
        let url = "https://github.com/u/r";
        let path = storage.ensure(url, "main", EnsureOptions::default()).await.unwrap().path;

        let mut metadata = CloneMetadata::load(&path).unwrap();
        metadata.fetched_ranges = vec![DateRange::new(day("2025-01-01"), day("2025-01-31"))];
        metadata.save(&path).unwrap();
        let before = transport.fetches.load(Ordering::SeqCst);

        let outcome = storage
            .fetch(url, "main", FetchOptions { since: Some(day("2025-01-10")) })
            .await
            .unwrap();
        assert!(outcome.skipped);
        assert_eq!(transport.fetches.load(Ordering::SeqCst), before);

        let outcome = storage
            .fetch(url, "main", FetchOptions { since: Some(day("2024-12-01")) })
            .await
            .unwrap();
        assert!(!outcome.skipped);
        assert_eq!(transport.fetches.load(Ordering::SeqCst), before + 2);
        assert_eq!(outcome.fetched_ranges.len(), 1);
        assert_eq!(outcome.fetched_ranges[0].start, day("2024-12-01"));
        assert!(outcome.fetched_ranges[0].end >= day("2025-01-31"));

        let requests = transport.requests.lock().unwrap().clone();
        let branch = requests.iter().rev().find(|r| r.shallow_since.is_some()).unwrap();
        assert_eq!(branch.shallow_since, Some(day("2024-12-01")));
        assert_eq!(branch.refspecs, vec!["+refs/heads/main:refs/heads/main"]);
        assert!(CloneMetadata::load(&path).unwrap().last_fetch.is_some());
    }

    #[tokio::test]
    async fn incremental_fetch_respects_min_interval() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(CountingTransport::default());
        let storage = manager(dir.path(), transport.clone());
        let url = "https://github.com/u/r";

        let first = storage.fetch(url, "main", FetchOptions::default()).await.unwrap();
        assert!(!first.skipped);
        let second = storage.fetch(url, "main", FetchOptions::default()).await.unwrap();
        assert!(second.skipped);
        // clone + one fetch, each with a separate list request
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn lock_failure_removes_clone() {
        let dir = tempfile::tempdir().unwrap();
        let storage = manager(
            dir.path(),
            Arc::new(FailingTransport(|repo| SocialError::LockFile {
                path: repo.to_path_buf(),
                message: "index.lock exists".into(),
            })),
        );
        let err = storage
            .ensure("https://github.com/u/r", "main", EnsureOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::LockFileError);
        assert!(storage.existing_clone("https://github.com/u/r").is_none());
    }

    #[tokio::test]
    async fn failed_clone_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let storage = manager(
            dir.path(),
            Arc::new(FailingTransport(|_| SocialError::Fetch {
                url: "https://github.com/u/r".into(),
                message: "unreachable".into(),
            })),
        );
        let err = storage
            .fetch("https://github.com/u/r", "main", FetchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::FetchFailed);
        assert!(storage.existing_clone("https://github.com/u/r").is_none());
    }

    #[tokio::test]
    async fn cleanup_evicts_only_stale_ephemeral_clones() {
        let dir = tempfile::tempdir().unwrap();
        let storage = manager(dir.path(), Arc::new(CountingTransport::default()));
        let stale = storage
            .ensure("https://h/stale", "main", EnsureOptions::default())
            .await
            .unwrap()
            .path;
        let fresh = storage
            .ensure("https://h/fresh", "main", EnsureOptions::default())
            .await
            .unwrap()
            .path;
        let kept = storage
            .ensure(
                "https://h/kept",
                "main",
                EnsureOptions {
                    persistent: true,
                    force: false,
                },
            )
            .await
            .unwrap()
            .path;

        let later = Utc::now() + chrono::Duration::days(10);
        let mut metadata = CloneMetadata::load(&fresh).unwrap();
        metadata.last_fetch = Some(later);
        metadata.save(&fresh).unwrap();

        let report = storage.cleanup_at(later).await;
        assert_eq!(report.removed, vec![stale.clone()]);
        assert_eq!(report.kept, 2);
        assert!(report.failures.is_empty());
        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(kept.exists());
    }

    #[tokio::test]
    async fn repositories_lists_clones() {
        let dir = tempfile::tempdir().unwrap();
        let storage = manager(dir.path(), Arc::new(CountingTransport::default()));
        storage
            .ensure("https://GitHub.com/u/r", "trunk", EnsureOptions::default())
            .await
            .unwrap();
        let repos = storage.repositories();
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].id, "https://github.com/u/r#branch:trunk");
        assert!(repos[0].path.is_some());

        assert!(storage.remove("https://github.com/u/r").await.unwrap());
        assert!(!storage.remove("https://github.com/u/r").await.unwrap());
        assert!(storage.repositories().is_empty());
    }

    #[tokio::test]
    async fn list_refs_are_fetched_without_a_window() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(CountingTransport::default());
        let storage = manager(dir.path(), transport.clone());
        let url = "https://github.com/u/r";
        storage
            .fetch(url, "main", FetchOptions { since: Some(day("2025-01-01")) })
            .await
            .unwrap();
        storage.fetch_lists(url, "main").await.unwrap();

        let refspec = storage.list_log().fetch_refspec();
        let requests = transport.requests.lock().unwrap().clone();
        let list_requests: Vec<&FetchRequest> = requests
            .iter()
            .filter(|r| r.refspecs.contains(&refspec))
            .collect();
        // clone, windowed fetch, explicit list refresh
        assert_eq!(list_requests.len(), 3);
        for request in list_requests {
            assert_eq!(request.refspecs.len(), 1);
            assert!(request.depth.is_none());
            assert!(request.shallow_since.is_none());
        }
    }

    struct SlowTransport;

    #[async_trait]
    impl Transport for SlowTransport {
        async fn fetch(&self, _repo: &Path, _request: &FetchRequest) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }

        async fn default_branch(&self, _url: &str) -> Result<String> {
            Ok("main".into())
        }
    }

    #[tokio::test]
    async fn slow_remote_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SocialConfig::default();
        config.fetch.timeout_secs = 1;
        let storage = StorageManager::new(dir.path(), &config, Arc::new(SlowTransport));
        let err = storage
            .ensure("https://github.com/u/r", "main", EnsureOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Timeout);
        assert!(err.is_transient());
        assert!(storage.existing_clone("https://github.com/u/r").is_none());
    }

    #[tokio::test]
    async fn cleanup_continues_past_unreadable_clone() {
        let dir = tempfile::tempdir().unwrap();
        let storage = manager(dir.path(), Arc::new(CountingTransport::default()));
        let junk = storage.repositories_dir().join("a-junk-00000000");
        std::fs::create_dir_all(&junk).unwrap();
        let stale = storage
            .ensure("https://h/stale", "main", EnsureOptions::default())
            .await
            .unwrap()
            .path;

        let report = storage
            .cleanup_at(Utc::now() + chrono::Duration::days(30))
            .await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, junk);
        assert_eq!(report.removed, vec![stale.clone()]);
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn idle_locks_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let storage = manager(dir.path(), Arc::new(CountingTransport::default()));
        for url in ["https://h/a", "https://h/b", "https://h/c"] {
            storage.ensure(url, "main", EnsureOptions::default()).await.unwrap();
        }
        assert_eq!(storage.locks.lock().unwrap().len(), 1);
    }
}
