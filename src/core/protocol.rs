use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SocialError};

/// Branch assumed when a repository id carries no `#branch:` selector.
pub const DEFAULT_BRANCH: &str = "main";

/// Canonical form of a repository location.
///
/// Lowercases the host, keeps the scheme, drops any `#fragment`, trailing
/// slashes and a trailing `.git`. Input that is neither a `scheme://` URL nor
/// an scp-style `user@host:path` loses only its fragment and surrounding
/// whitespace.
pub fn normalize(url: &str) -> String {
    let trimmed = url.trim();
    let location = trimmed.split('#').next().unwrap_or("").trim_end();

    if let Some((scheme, rest)) = location.split_once("://") {
        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        let authority = lowercase_host(authority);
        let path = strip_suffixes(path);
        return if path.is_empty() {
            format!("{scheme}://{authority}")
        } else {
            format!("{scheme}://{authority}/{path}")
        };
    }

    if let Some((host, path)) = split_scp(location) {
        return format!("{}:{}", lowercase_host(host), strip_suffixes(path));
    }

    location.to_string()
}

/// `git@host:org/repo` → (`git@host`, `org/repo`).
fn split_scp(location: &str) -> Option<(&str, &str)> {
    let (host, path) = location.split_once(':')?;
    if host.is_empty() || host.contains('/') || host.contains(char::is_whitespace) {
        return None;
    }
    if !host.contains('@') && !host.contains('.') {
        return None;
    }
    Some((host, path))
}

fn lowercase_host(authority: &str) -> String {
    match authority.rsplit_once('@') {
        Some((user, host)) => format!("{user}@{}", host.to_ascii_lowercase()),
        None => authority.to_ascii_lowercase(),
    }
}

fn strip_suffixes(path: &str) -> &str {
    let mut path = path;
    loop {
        let next = path
            .trim_end()
            .trim_end_matches('/')
            .trim_end_matches(".git");
        if next.len() == path.len() {
            return path;
        }
        path = next;
    }
}

/// Normalized repository URL with any selector removed.
pub fn base_url(url: &str) -> String {
    normalize(url)
}

/// True when both strings denote the same repository, ignoring branch selectors.
pub fn same_repository(a: &str, b: &str) -> bool {
    base_url(a) == base_url(b)
}

/// Format a branch-qualified repository id: `url#branch:name`.
pub fn repository_id(url: &str, branch: &str) -> String {
    create_ref(EntityKind::Branch, branch, url)
}

/// What an [`EntityRef`] points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Branch,
    List,
    Commit,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Branch => "branch",
            EntityKind::List => "list",
            EntityKind::Commit => "commit",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "branch" => Some(EntityKind::Branch),
            "list" => Some(EntityKind::List),
            "commit" => Some(EntityKind::Commit),
            _ => None,
        }
    }
}

/// A parsed `<url>#<kind>:<value>` reference. An empty `repository` means the
/// ref is local to whichever repository's history it was read from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub kind: EntityKind,
    pub value: String,
}

impl EntityRef {
    pub fn is_local(&self) -> bool {
        self.repository.is_empty()
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&create_ref(self.kind, &self.value, &self.repository))
    }
}

impl FromStr for EntityRef {
    type Err = SocialError;

    fn from_str(s: &str) -> Result<Self> {
        try_parse_ref(s)
    }
}

/// Lenient parse. Input without a recognizable selector becomes a local
/// commit ref holding the raw string.
pub fn parse_ref(s: &str) -> EntityRef {
    try_parse_ref(s).unwrap_or_else(|_| EntityRef {
        repository: String::new(),
        branch: None,
        kind: EntityKind::Commit,
        value: s.trim().to_string(),
    })
}

/// Strict parse; fails with `INVALID_REF` on an unknown or empty selector.
pub fn try_parse_ref(s: &str) -> Result<EntityRef> {
    let s = s.trim();
    let (repository, selector) = s.split_once('#').unwrap_or(("", s));
    let (prefix, value) = selector
        .split_once(':')
        .ok_or_else(|| SocialError::InvalidRef(s.to_string()))?;
    let kind =
        EntityKind::from_prefix(prefix).ok_or_else(|| SocialError::InvalidRef(s.to_string()))?;
    if value.is_empty() {
        return Err(SocialError::InvalidRef(s.to_string()));
    }
    let repository = if repository.is_empty() {
        String::new()
    } else {
        normalize(repository)
    };
    Ok(EntityRef {
        repository,
        branch: (kind == EntityKind::Branch).then(|| value.to_string()),
        kind,
        value: value.to_string(),
    })
}

/// Inverse of [`parse_ref`].
pub fn create_ref(kind: EntityKind, value: &str, repository: &str) -> String {
    let repository = if repository.trim().is_empty() {
        String::new()
    } else {
        normalize(repository)
    };
    format!("{repository}#{}:{value}", kind.as_str())
}

/// A repository url paired with the branch it is followed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryId {
    pub repository: String,
    pub branch: String,
}

impl RepositoryId {
    pub fn new(url: &str, branch: &str) -> Self {
        Self {
            repository: normalize(url),
            branch: branch.to_string(),
        }
    }

    /// `url#branch:name` form.
    pub fn id(&self) -> String {
        repository_id(&self.repository, &self.branch)
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// Split `url#branch:name`, defaulting the branch to [`DEFAULT_BRANCH`].
pub fn parse_repository_id(s: &str) -> RepositoryId {
    RepositoryId {
        repository: normalize(s),
        branch: explicit_branch(s).unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
    }
}

/// The `#branch:` selector of `s`, when present.
pub fn explicit_branch(s: &str) -> Option<String> {
    let (_, selector) = s.trim().split_once('#')?;
    let branch = selector.strip_prefix("branch:")?;
    (!branch.is_empty()).then(|| branch.to_string())
}
