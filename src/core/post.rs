use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use git2::{ErrorCode, Repository, Sort};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SocialError};

use super::git_ops;
use super::protocol::{self, EntityKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostKind {
    Post,
    Comment,
    Repost,
    Quote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    /// `url#commit:hash`
    pub id: String,
    /// Normalized url of the repository the post was read from.
    pub repository: String,
    pub branch: String,
    pub author: String,
    pub email: String,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: PostKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_post_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_comment_id: Option<String>,
}

impl Post {
    /// `url#branch:name` key of the repository this post belongs to.
    pub fn repository_key(&self) -> String {
        protocol::repository_id(&self.repository, &self.branch)
    }

    pub fn commit_id(&self) -> String {
        protocol::parse_ref(&self.id).value
    }
}

/// Which posts a caller is asking for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// The workspace and every repository in its lists.
    Timeline,
    /// Everything materialized so far.
    All,
    /// One repository, `url` or `url#branch:name`.
    Repository(String),
    /// Members of one workspace list.
    List(String),
}

impl FromStr for Scope {
    type Err = SocialError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "timeline" => Ok(Scope::Timeline),
            "all" => Ok(Scope::All),
            other => match other.split_once(':') {
                Some(("repository", id)) if !id.is_empty() => Ok(Scope::Repository(id.to_string())),
                Some(("list", id)) if !id.is_empty() => Ok(Scope::List(id.to_string())),
                _ => Err(SocialError::InvalidRef(format!("unknown scope '{other}'"))),
            },
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Timeline => f.write_str("timeline"),
            Scope::All => f.write_str("all"),
            Scope::Repository(id) => write!(f, "repository:{id}"),
            Scope::List(id) => write!(f, "list:{id}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PostQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Restrict to these kinds; empty means all.
    pub types: Vec<PostKind>,
    pub limit: Option<usize>,
    /// Bypass the cache and re-read from the repositories.
    pub skip_cache: bool,
}

impl PostQuery {
    pub fn matches(&self, post: &Post) -> bool {
        self.since.is_none_or(|s| post.timestamp >= s)
            && self.until.is_none_or(|u| post.timestamp <= u)
            && (self.types.is_empty() || self.types.contains(&post.kind))
    }
}

/// Turns a repository's history into posts.
pub trait PostSource: Send + Sync {
    /// Posts on `branch` of the repository at `path`, newest first,
    /// restricted to `[since, until]` when given.
    fn posts(
        &self,
        path: &Path,
        repository: &str,
        branch: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<Post>>;
}

/// One plain post per commit.
#[derive(Debug, Clone, Default)]
pub struct CommitPostSource;

impl PostSource for CommitPostSource {
    fn posts(
        &self,
        path: &Path,
        repository: &str,
        branch: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<Post>> {
        let repo = Repository::open(path).map_err(|e| git_ops::map_git_error(path, e))?;
        let git_err = |e: git2::Error| git_ops::map_git_error(path, e);
        let tip = match repo.refname_to_id(&format!("refs/heads/{branch}")) {
            Ok(oid) => oid,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(git_err(e)),
        };
        let mut walk = repo.revwalk().map_err(git_err)?;
        walk.set_sorting(Sort::TIME).map_err(git_err)?;
        walk.push(tip).map_err(git_err)?;

        let repository = protocol::normalize(repository);
        let mut posts = Vec::new();
        for oid in walk {
            let oid = oid.map_err(git_err)?;
            // Shallow boundaries can name parents that were never fetched
            let Ok(commit) = repo.find_commit(oid) else {
                break;
            };
            let timestamp = Utc
                .timestamp_opt(commit.time().seconds(), 0)
                .single()
                .unwrap_or_default();
            if since.is_some_and(|s| timestamp < s) {
                break;
            }
            if until.is_some_and(|u| timestamp > u) {
                continue;
            }
            let author = commit.author();
            posts.push(Post {
                id: protocol::create_ref(EntityKind::Commit, &oid.to_string(), &repository),
                repository: repository.clone(),
                branch: branch.to_string(),
                author: author.name().unwrap_or("").to_string(),
                email: author.email().unwrap_or("").to_string(),
                timestamp,
                content: commit.message().unwrap_or("").trim().to_string(),
                kind: PostKind::Post,
                original_post_id: None,
                parent_comment_id: None,
            });
        }
        Ok(posts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_parsing() {
        assert_eq!("timeline".parse::<Scope>().unwrap(), Scope::Timeline);
        assert_eq!("all".parse::<Scope>().unwrap(), Scope::All);
        assert_eq!(
            "repository:https://h/r#branch:main".parse::<Scope>().unwrap(),
            Scope::Repository("https://h/r#branch:main".into())
        );
        assert_eq!("list:reading".parse::<Scope>().unwrap(), Scope::List("reading".into()));
        assert!("list:".parse::<Scope>().is_err());
        assert!("bogus".parse::<Scope>().is_err());
        assert_eq!(Scope::List("reading".into()).to_string(), "list:reading");
    }

    #[test]
    fn commit_source_reads_branch_within_window() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let tree_id = repo.treebuilder(None).unwrap().write().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();

        let mut parent: Option<git2::Oid> = None;
        for (day, message) in [(1, "first"), (5, "second"), (9, "third")] {
            let when = git2::Time::new(Utc.with_ymd_and_hms(2025, 1, day, 12, 0, 0).unwrap().timestamp(), 0);
            let sig = git2::Signature::new("Ann", "ann@example.com", &when).unwrap();
            let parents: Vec<git2::Commit<'_>> =
                parent.iter().map(|p| repo.find_commit(*p).unwrap()).collect();
            let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();
            parent = Some(
                repo.commit(Some("refs/heads/main"), &sig, &sig, message, &tree, &parent_refs)
                    .unwrap(),
            );
        }

        let source = CommitPostSource;
        let all = source
            .posts(dir.path(), "https://GitHub.com/a/r", "main", None, None)
            .unwrap();
        let contents: Vec<&str> = all.iter().map(|p| p.content.as_str()).collect();
        assert_eq!(contents, vec!["third", "second", "first"]);
        assert_eq!(all[0].repository, "https://github.com/a/r");
        assert!(all[0].id.starts_with("https://github.com/a/r#commit:"));
        assert_eq!(all[0].repository_key(), "https://github.com/a/r#branch:main");

        let since = Utc.with_ymd_and_hms(2025, 1, 4, 0, 0, 0).unwrap();
        let until = Utc.with_ymd_and_hms(2025, 1, 6, 0, 0, 0).unwrap();
        let window = source
            .posts(dir.path(), "https://github.com/a/r", "main", Some(since), Some(until))
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].content, "second");

        assert!(source
            .posts(dir.path(), "https://github.com/a/r", "absent", None, None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn query_filters_kind_and_window() {
        let post = Post {
            id: "#commit:abc".into(),
            repository: "https://h/r".into(),
            branch: "main".into(),
            author: "a".into(),
            email: "a@h".into(),
            timestamp: Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap(),
            content: "hi".into(),
            kind: PostKind::Comment,
            original_post_id: None,
            parent_comment_id: None,
        };
        assert!(PostQuery::default().matches(&post));
        let only_posts = PostQuery {
            types: vec![PostKind::Post],
            ..Default::default()
        };
        assert!(!only_posts.matches(&post));
        let later = PostQuery {
            since: Some(Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap()),
            ..Default::default()
        };
        assert!(!later.matches(&post));
        assert_eq!(post.commit_id(), "abc");
    }
}
