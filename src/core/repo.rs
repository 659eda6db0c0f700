use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::protocol;
use super::ranges::DateRange;

/// A repository as seen by a workspace session. Recomputed on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repo {
    /// `url#branch:name`
    pub id: String,
    pub url: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub branch: String,
    #[serde(rename = "type")]
    pub kind: RepoKind,
    pub social_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fetch_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_ranges: Option<Vec<DateRange>>,
    /// Names of the workspace lists this repository belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lists: Option<Vec<String>>,
}

/// Whether a repository is the session's own checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoKind {
    Workspace,
    Other,
}

impl Repo {
    /// Build a remote repository entry from a url and the branch it is followed on.
    pub fn remote(url: &str, branch: &str) -> Self {
        let url = protocol::normalize(url);
        Self {
            id: protocol::repository_id(&url, branch),
            name: super::git_ops::infer_name(&url),
            url,
            path: None,
            branch: branch.to_string(),
            kind: RepoKind::Other,
            social_enabled: true,
            last_fetch_time: None,
            fetched_ranges: None,
            lists: None,
        }
    }
}

/// A repository that lists the local repository in one of its own lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Follower {
    #[serde(flatten)]
    pub repository: Repo,
    /// Name of the first list found to contain the local repository.
    pub follows_via: String,
    /// Id of that list, used to walk its history.
    pub list_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remote {
    pub name: String,
    pub url: String,
    pub push_url: Option<String>,
}

/// Parsed remote URL information.
#[derive(Debug, Clone)]
pub struct RemoteInfo {
    pub platform: String,
    pub org: String,
    pub repo_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_repo_is_normalized() {
        let repo = Repo::remote("https://GitHub.com/u/social.git", "main");
        assert_eq!(repo.url, "https://github.com/u/social");
        assert_eq!(repo.id, "https://github.com/u/social#branch:main");
        assert_eq!(repo.name, "social");
        assert_eq!(repo.kind, RepoKind::Other);
    }

    #[test]
    fn follower_serializes_flat() {
        let follower = Follower {
            repository: Repo::remote("https://github.com/b/r", "main"),
            follows_via: "following".into(),
            list_id: "following".into(),
        };
        let json = serde_json::to_value(&follower).unwrap();
        assert_eq!(json["url"], "https://github.com/b/r");
        assert_eq!(json["type"], "other");
        assert_eq!(json["followsVia"], "following");
    }
}
