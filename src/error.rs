use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SocialError {
    #[error("workspace not initialized: {0}")]
    NotInitialized(String),

    #[error("no origin remote configured for {0}")]
    NoOrigin(PathBuf),

    #[error("invalid list name '{0}': expected 1-40 characters of [A-Za-z0-9_-]")]
    InvalidListName(String),

    #[error("list already exists: {0}")]
    ListExists(String),

    #[error("repository already in list {list}: {url}")]
    RepositoryExists { list: String, url: String },

    #[error("list {0} does not follow a source list")]
    ListNotFollowed(String),

    #[error("invalid reference: {0}")]
    InvalidRef(String),

    #[error("list not found: {0}")]
    ListNotFound(String),

    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("source list not found: {0}")]
    SourceNotFound(String),

    #[error("lock file error at {path}: {message}")]
    LockFile { path: PathBuf, message: String },

    #[error("fetch failed for {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("operation timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("could not detect default branch of {url}: {message}")]
    BranchDetection { url: String, message: String },

    #[error("git error at {path}: {source}")]
    Git {
        path: PathBuf,
        source: git2::Error,
    },

    #[error("git {args} failed: {stderr}")]
    Command { args: String, stderr: String },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Stable error codes surfaced at the public boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotInitialized,
    NoOrigin,
    InvalidListName,
    ListExists,
    RepositoryExists,
    ListNotFollowed,
    InvalidRef,
    ListNotFound,
    RepositoryNotFound,
    SourceNotFound,
    LockFileError,
    FetchFailed,
    Timeout,
    Cancelled,
    BranchDetectionFailed,
    GitError,
    IoError,
    SerializationError,
    ConfigError,
    InternalError,
}

impl ErrorCode {
    /// Failures a fan-out caller records per item and moves past.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCode::LockFileError
                | ErrorCode::FetchFailed
                | ErrorCode::Timeout
                | ErrorCode::BranchDetectionFailed
        )
    }

    pub fn as_str(&self) -> String {
        serde_plain::to_string(self).unwrap_or_else(|_| "INTERNAL_ERROR".into())
    }
}

impl SocialError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SocialError::NotInitialized(_) => ErrorCode::NotInitialized,
            SocialError::NoOrigin(_) => ErrorCode::NoOrigin,
            SocialError::InvalidListName(_) => ErrorCode::InvalidListName,
            SocialError::ListExists(_) => ErrorCode::ListExists,
            SocialError::RepositoryExists { .. } => ErrorCode::RepositoryExists,
            SocialError::ListNotFollowed(_) => ErrorCode::ListNotFollowed,
            SocialError::InvalidRef(_) => ErrorCode::InvalidRef,
            SocialError::ListNotFound(_) => ErrorCode::ListNotFound,
            SocialError::RepositoryNotFound(_) => ErrorCode::RepositoryNotFound,
            SocialError::SourceNotFound(_) => ErrorCode::SourceNotFound,
            SocialError::LockFile { .. } => ErrorCode::LockFileError,
            SocialError::Fetch { .. } | SocialError::Command { .. } => ErrorCode::FetchFailed,
            SocialError::Timeout { .. } => ErrorCode::Timeout,
            SocialError::Cancelled(_) => ErrorCode::Cancelled,
            SocialError::BranchDetection { .. } => ErrorCode::BranchDetectionFailed,
            SocialError::Git { .. } => ErrorCode::GitError,
            SocialError::Io { .. } => ErrorCode::IoError,
            SocialError::Serialization(_) => ErrorCode::SerializationError,
            SocialError::Config(_) => ErrorCode::ConfigError,
            SocialError::Internal(_) => ErrorCode::InternalError,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.code().is_transient()
    }

    pub(crate) fn git(path: impl Into<PathBuf>, source: git2::Error) -> Self {
        SocialError::Git {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SocialError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, SocialError>;

/// Error payload of an [`Outcome`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Serializable result envelope handed across process or language boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl<T> From<Result<T>> for Outcome<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(data) => Outcome {
                success: true,
                data: Some(data),
                error: None,
            },
            Err(err) => {
                let details = match &err {
                    SocialError::Git { path, .. }
                    | SocialError::Io { path, .. }
                    | SocialError::LockFile { path, .. } => {
                        Some(serde_json::json!({ "path": path.display().to_string() }))
                    }
                    SocialError::Fetch { url, .. } | SocialError::BranchDetection { url, .. } => {
                        Some(serde_json::json!({ "url": url }))
                    }
                    _ => None,
                };
                Outcome {
                    success: false,
                    data: None,
                    error: Some(ErrorInfo {
                        code: err.code(),
                        message: err.to_string(),
                        details,
                    }),
                }
            }
        }
    }
}
