pub mod types;

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, SocialError};
use types::SocialConfig;

/// Load config from the XDG path, merging defaults. A missing file is not an error.
pub fn load_config() -> Result<SocialConfig> {
    load_config_from(&config_path())
}

/// Load config from an explicit path, merging defaults.
pub fn load_config_from(path: &Path) -> Result<SocialConfig> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(SocialConfig::default());
        }
        Err(e) => return Err(SocialError::io(path, e)),
    };
    toml::from_str(&raw)
        .map_err(|e| SocialError::Config(format!("{}: {}", path.display(), e)))
}

/// Return XDG config dir (~/.config/gitsocial/)
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("gitsocial")
}

/// Return XDG data dir (~/.local/share/gitsocial/)
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("~/.local/share"))
        .join("gitsocial")
}

/// Return the config file path
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.fetch.timeout_secs, 60);
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[fetch\ntimeout_secs = ").unwrap();
        let err = load_config_from(&path).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ConfigError);
    }

    #[test]
    fn reads_storage_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[storage]\nbase = \"/tmp/gs\"\nretention_days = 2\n").unwrap();
        let config = load_config_from(&path).unwrap();
        assert_eq!(config.storage.base, PathBuf::from("/tmp/gs"));
        assert_eq!(config.storage.retention_days, 2);
    }
}
