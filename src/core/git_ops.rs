use std::path::Path;

use git2::{BranchType, ErrorCode, Repository};

use crate::error::{Result, SocialError};

use super::protocol;
use super::repo::{Remote, RemoteInfo};

/// Classify a libgit2 failure, surfacing lock contention as its own error.
pub fn map_git_error(path: &Path, e: git2::Error) -> SocialError {
    if e.code() == ErrorCode::Locked || is_lock_file_message(e.message()) {
        SocialError::LockFile {
            path: path.to_path_buf(),
            message: e.message().to_string(),
        }
    } else {
        SocialError::git(path, e)
    }
}

/// Whether git output describes a stale or contended `*.lock` file.
pub fn is_lock_file_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    let stale_lock = lower.contains(".lock")
        && (lower.contains("exists") || lower.contains("unable to create") || lower.contains("locked"));
    stale_lock || lower.contains("failed to lock")
}

pub fn open_repo(path: &Path) -> Result<Repository> {
    Repository::open(path).map_err(|e| map_git_error(path, e))
}

/// Extract all remotes from a repository.
pub fn extract_remotes(repo: &Repository) -> Vec<Remote> {
    let Ok(remote_names) = repo.remotes() else {
        return Vec::new();
    };
    remote_names
        .iter()
        .flatten()
        .filter_map(|name| {
            let remote = repo.find_remote(name).ok()?;
            Some(Remote {
                name: name.to_string(),
                url: remote.url().unwrap_or("").to_string(),
                push_url: remote.pushurl().map(String::from),
            })
        })
        .collect()
}

/// Normalized url of the `origin` remote of the repository at `path`.
pub fn origin_url(path: &Path) -> Result<String> {
    let repo = open_repo(path)?;
    extract_remotes(&repo)
        .into_iter()
        .find(|r| r.name == "origin" && !r.url.is_empty())
        .map(|r| protocol::normalize(&r.url))
        .ok_or_else(|| SocialError::NoOrigin(path.to_path_buf()))
}

/// Detect the default branch (HEAD target or common names).
pub fn detect_default_branch(repo: &Repository) -> Option<String> {
    if let Ok(head) = repo.head() {
        if let Some(name) = head.shorthand() {
            return Some(name.to_string());
        }
    }
    // Unborn HEAD still names the branch it will create
    if let Ok(head) = repo.find_reference("HEAD") {
        if let Some(target) = head.symbolic_target() {
            if let Some(name) = target.strip_prefix("refs/heads/") {
                return Some(name.to_string());
            }
        }
    }
    for name in &["main", "master", "develop", "trunk"] {
        if repo.find_branch(name, BranchType::Local).is_ok() {
            return Some(name.to_string());
        }
    }
    None
}

/// Infer a display name from a repository url, falling back to the last path segment.
pub fn infer_name(url: &str) -> String {
    if let Some(info) = parse_remote_org(url) {
        return info.repo_name;
    }
    let normalized = protocol::normalize(url);
    normalized
        .rsplit(['/', ':'])
        .find(|segment| !segment.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

/// Parse org/owner from a remote URL.
pub fn parse_remote_org(url: &str) -> Option<RemoteInfo> {
    let url = protocol::normalize(url);

    // Handle SSH: git@github.com:org/repo
    if let Some(rest) = url.strip_prefix("git@") {
        let (platform, path) = rest.split_once(':')?;
        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() >= 2 {
            return Some(RemoteInfo {
                platform: platform.to_string(),
                org: parts[0].to_string(),
                repo_name: parts[1].to_string(),
            });
        }
    }

    // Handle HTTPS: https://github.com/org/repo
    if url.starts_with("https://") || url.starts_with("http://") {
        let parts: Vec<&str> = url.split('/').collect();
        if parts.len() >= 5 {
            return Some(RemoteInfo {
                platform: parts[2].to_string(),
                org: parts[3].to_string(),
                repo_name: parts[4].to_string(),
            });
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ssh_url() {
        let info = parse_remote_org("git@github.com:initech/api-gateway.git").unwrap();
        assert_eq!(info.platform, "github.com");
        assert_eq!(info.org, "initech");
        assert_eq!(info.repo_name, "api-gateway");
    }

    #[test]
    fn parse_https_url() {
        let info = parse_remote_org("https://GitHub.com/gitsocial-org/gitsocial.git").unwrap();
        assert_eq!(info.platform, "github.com");
        assert_eq!(info.org, "gitsocial-org");
        assert_eq!(info.repo_name, "gitsocial");
    }

    #[test]
    fn infer_name_falls_back_to_last_segment() {
        assert_eq!(infer_name("https://github.com/u/social"), "social");
        assert_eq!(infer_name("file:///srv/git/notes.git"), "notes");
        assert_eq!(infer_name("/home/user/code/my-project"), "my-project");
    }

    #[test]
    fn lock_messages() {
        assert!(is_lock_file_message(
            "fatal: Unable to create '/x/.git/index.lock': File exists."
        ));
        assert!(is_lock_file_message("failed to lock file 'config.lock' for writing"));
        assert!(!is_lock_file_message("fatal: repository not found"));
    }

    #[test]
    fn origin_url_is_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        assert_eq!(
            origin_url(dir.path()).unwrap_err().code(),
            crate::error::ErrorCode::NoOrigin
        );
        repo.remote("origin", "https://GitHub.com/u/r.git").unwrap();
        assert_eq!(origin_url(dir.path()).unwrap(), "https://github.com/u/r");
    }

    #[test]
    fn default_branch_of_unborn_repo() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        repo.set_head("refs/heads/trunk").unwrap();
        assert_eq!(detect_default_branch(&repo).as_deref(), Some("trunk"));
    }
}
