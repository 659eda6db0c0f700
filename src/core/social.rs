use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ErrorCode, Result};

use super::list::ListVersion;
use super::list_store::ListStore;
use super::post::{Post, PostKind};
use super::protocol::{self, RepositoryId};
use super::repo::{Follower, Repo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Comment,
    Repost,
    Quote,
    Follow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub author: String,
    pub email: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub commit_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<CommitInfo>,
}

impl Notification {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.commit.as_ref().map(|c| c.timestamp)
    }
}

/// A followed repository whose lists could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanFailure {
    pub repository: String,
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FollowerScan {
    pub followers: Vec<Follower>,
    pub failures: Vec<ScanFailure>,
    /// The scan stopped because its cancellation token fired.
    pub cancelled: bool,
}

/// First list of `repository` (by id) that contains `local_url`.
async fn follows_back(
    store: &ListStore,
    local_url: &str,
    repository: &RepositoryId,
) -> Result<Option<Follower>> {
    let lists = store
        .get_all_remote(&repository.repository, &repository.branch)
        .await?;
    Ok(lists
        .into_iter()
        .find(|list| list.contains_repository(local_url))
        .map(|list| Follower {
            repository: Repo::remote(&repository.repository, &repository.branch),
            follows_via: list.name,
            list_id: list.id,
        }))
}

/// Scan `followed` for repositories that list `local_url` themselves.
///
/// Followed repositories are checked `concurrency` at a time and results
/// are consumed in input order. With a `limit` they are checked one at a
/// time, so no repository past the last follower is fetched. Unreadable
/// repositories land in `failures`.
pub async fn get_followers(
    store: &ListStore,
    local_url: &str,
    followed: Vec<RepositoryId>,
    limit: Option<usize>,
    concurrency: usize,
    cancel: &CancellationToken,
) -> FollowerScan {
    let mut scan = FollowerScan::default();
    if limit == Some(0) {
        return scan;
    }
    let local_url = protocol::normalize(local_url);
    let candidates: Vec<RepositoryId> = followed
        .into_iter()
        .filter(|r| !protocol::same_repository(&r.repository, &local_url))
        .collect();

    let width = if limit.is_some() { 1 } else { concurrency.max(1) };
    let local = local_url.as_str();
    let mut checks = std::pin::pin!(
        futures::stream::iter(candidates)
            .map(|repository| async move {
                let result = follows_back(store, local, &repository).await;
                (repository, result)
            })
            .buffered(width)
    );

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("follower scan cancelled");
                scan.cancelled = true;
                break;
            }
            next = checks.next() => next,
        };
        let Some((repository, result)) = next else {
            break;
        };
        match result {
            Ok(Some(follower)) => {
                scan.followers.push(follower);
                if limit.is_some_and(|l| scan.followers.len() >= l) {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(repository = %repository.repository, error = %e, "could not read lists");
                scan.failures.push(ScanFailure {
                    repository: repository.id(),
                    code: e.code(),
                    message: e.to_string(),
                });
            }
        }
    }
    scan
}

/// Whether `url` lists `local_url` in any of its lists. Failing to read the
/// remote's lists counts as "no".
pub async fn is_follower(store: &ListStore, local_url: &str, url: &str) -> bool {
    let branch = match store.branch_for(url).await {
        Ok(branch) => branch,
        Err(e) => {
            debug!(url, error = %e, "branch unknown, not a follower");
            return false;
        }
    };
    let repository = RepositoryId::new(url, &branch);
    match follows_back(store, local_url, &repository).await {
        Ok(found) => found.is_some(),
        Err(e) => {
            debug!(url, error = %e, "lists unreadable, not a follower");
            false
        }
    }
}

/// The version at which `local_url` entered the list, scanning newest first
/// and stopping at the first boundary found.
pub fn find_follow_event<'a>(history: &'a [ListVersion], local_url: &str) -> Option<&'a ListVersion> {
    let mut versions = history.iter().peekable();
    while let Some(version) = versions.next() {
        if !version.list.contains_repository(local_url) {
            continue;
        }
        let older_has_it = versions
            .peek()
            .is_some_and(|older| older.list.contains_repository(local_url));
        if !older_has_it {
            return Some(version);
        }
    }
    None
}

/// Follow notification for the boundary [`find_follow_event`] locates.
pub fn follow_notification(history: &[ListVersion], local_url: &str) -> Option<Notification> {
    find_follow_event(history, local_url).map(|version| Notification {
        kind: NotificationKind::Follow,
        commit_id: version.commit_id.clone(),
        commit: Some(CommitInfo {
            author: version.author.clone(),
            email: version.email.clone(),
            timestamp: version.timestamp,
        }),
    })
}

fn points_at(reference: Option<&str>, local_url: &str) -> bool {
    reference.is_some_and(|r| {
        let target = protocol::parse_ref(r);
        !target.is_local() && protocol::same_repository(&target.repository, local_url)
    })
}

/// Comments, reposts and quotes by others that reference the local repository.
pub fn derive_interactions(posts: &[Post], local_url: &str) -> Vec<Notification> {
    posts
        .iter()
        .filter(|post| !protocol::same_repository(&post.repository, local_url))
        .filter(|post| {
            points_at(post.original_post_id.as_deref(), local_url)
                || points_at(post.parent_comment_id.as_deref(), local_url)
        })
        .filter_map(|post| {
            let kind = match post.kind {
                PostKind::Comment => NotificationKind::Comment,
                PostKind::Repost => NotificationKind::Repost,
                PostKind::Quote => NotificationKind::Quote,
                PostKind::Post => return None,
            };
            Some(Notification {
                kind,
                commit_id: post.commit_id(),
                commit: Some(CommitInfo {
                    author: post.author.clone(),
                    email: post.email.clone(),
                    timestamp: post.timestamp,
                }),
            })
        })
        .collect()
}
