use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SocialConfig {
    pub storage: StorageConfig,
    pub fetch: FetchConfig,
    pub lists: ListsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root under which isolated clones are kept.
    pub base: PathBuf,
    /// Days an ephemeral clone survives without being fetched.
    pub retention_days: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base: super::data_dir(),
            retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    /// How far back a fetch without an explicit `since` reaches on first contact.
    pub default_window_days: i64,
    /// Incremental fetches closer together than this are skipped.
    pub min_interval_secs: i64,
    /// Upper bound on repositories fetched concurrently during fan-out.
    pub concurrency: usize,
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            default_window_days: 30,
            min_interval_secs: 300,
            concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListsConfig {
    /// Ref namespace; lists live under `refs/<namespace>/lists/<id>`.
    pub namespace: String,
}

impl Default for ListsConfig {
    fn default() -> Self {
        Self {
            namespace: "gitmsg/social".into(),
        }
    }
}
