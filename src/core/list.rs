use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SocialError};

use super::protocol::{self, EntityKind};

/// Schema version stamped into every persisted list record.
pub const LIST_VERSION: &str = "0.1.0";

const MAX_LIST_ID_LEN: usize = 40;

/// A curated set of repositories, persisted as one JSON record per version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct List {
    pub version: String,
    pub id: String,
    pub name: String,
    /// Branch-qualified `url#branch:name` entries.
    #[serde(default)]
    pub repositories: Vec<String>,
    /// `url#list:id` of the list this one mirrors, when followed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip)]
    pub is_unpushed: Option<bool>,
    #[serde(skip)]
    pub is_followed_locally: Option<bool>,
}

impl List {
    pub fn new(id: &str, name: Option<&str>) -> Self {
        Self {
            version: LIST_VERSION.into(),
            id: id.into(),
            name: name.unwrap_or(id).into(),
            repositories: Vec::new(),
            source: None,
            is_unpushed: None,
            is_followed_locally: None,
        }
    }

    pub fn is_followed(&self) -> bool {
        self.source.is_some()
    }

    /// Index of the entry pointing at the same repository as `url`, branch ignored.
    pub fn position_of(&self, url: &str) -> Option<usize> {
        let base = protocol::base_url(url);
        self.repositories
            .iter()
            .position(|entry| protocol::base_url(entry) == base)
    }

    pub fn contains_repository(&self, url: &str) -> bool {
        self.position_of(url).is_some()
    }

    /// Normalized, branch-stripped urls of every member.
    pub fn repository_urls(&self) -> Vec<String> {
        self.repositories
            .iter()
            .map(|entry| protocol::base_url(entry))
            .collect()
    }

    /// The `url#list:id` ref a follower stores as `source`.
    pub fn source_ref(repository: &str, list_id: &str) -> String {
        protocol::create_ref(EntityKind::List, list_id, repository)
    }
}

/// Partial update merged over an existing list. `version` and `id` are not
/// representable here, so callers cannot change them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repositories: Option<Vec<String>>,
    /// `Some(None)` clears the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Option<String>>,
}

impl ListPatch {
    pub fn apply(self, list: &mut List) {
        if let Some(name) = self.name {
            list.name = name;
        }
        if let Some(repositories) = self.repositories {
            list.repositories = repositories;
        }
        if let Some(source) = self.source {
            list.source = source;
        }
    }
}

/// One persisted state of a list with the commit that recorded it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListVersion {
    pub commit_id: String,
    pub author: String,
    pub email: String,
    pub timestamp: DateTime<Utc>,
    pub list: List,
}

/// Reject ids outside `[A-Za-z0-9_-]{1,40}`.
pub fn validate_list_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_LIST_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(SocialError::InvalidListName(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_validation() {
        assert!(validate_list_id("reading").is_ok());
        assert!(validate_list_id("rust_crates-2025").is_ok());
        assert!(validate_list_id(&"a".repeat(40)).is_ok());
        assert!(validate_list_id(&"a".repeat(41)).is_err());
        assert!(validate_list_id("").is_err());
        assert!(validate_list_id("has space").is_err());
        assert!(validate_list_id("slash/id").is_err());
        assert!(validate_list_id("ünï").is_err());
    }

    #[test]
    fn runtime_fields_are_not_persisted() {
        let mut list = List::new("reading", Some("Reading"));
        list.is_unpushed = Some(true);
        list.is_followed_locally = Some(true);
        list.repositories
            .push("https://github.com/u/r#branch:main".into());
        list.source = Some("https://github.com/o/s#list:reading".into());
        insta::assert_json_snapshot!(list, @r###"
        {
          "version": "0.1.0",
          "id": "reading",
          "name": "Reading",
          "repositories": [
            "https://github.com/u/r#branch:main"
          ],
          "source": "https://github.com/o/s#list:reading"
        }
        "###);
    }

    #[test]
    fn parses_record_without_repositories() {
        let list: List =
            serde_json::from_str(r#"{"version":"0.1.0","id":"x","name":"X"}"#).unwrap();
        assert!(list.repositories.is_empty());
        assert!(list.source.is_none());
        assert!(list.is_unpushed.is_none());
    }

    #[test]
    fn membership_ignores_branch_and_case() {
        let mut list = List::new("reading", None);
        list.repositories
            .push("https://github.com/u/r#branch:main".into());
        assert!(list.contains_repository("https://GitHub.com/u/r#branch:develop"));
        assert!(list.contains_repository("https://github.com/u/r.git"));
        assert!(!list.contains_repository("https://github.com/u/other"));
        assert_eq!(list.repository_urls(), vec!["https://github.com/u/r"]);
    }

    #[test]
    fn patch_preserves_identity() {
        let mut list = List::new("reading", None);
        ListPatch {
            name: Some("Renamed".into()),
            repositories: None,
            source: Some(Some("https://h/o#list:a".into())),
        }
        .apply(&mut list);
        assert_eq!(list.id, "reading");
        assert_eq!(list.version, LIST_VERSION);
        assert_eq!(list.name, "Renamed");
        assert!(list.is_followed());

        ListPatch {
            source: Some(None),
            ..Default::default()
        }
        .apply(&mut list);
        assert!(!list.is_followed());
    }
}
