use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Result, SocialError};

use super::git_ops;

/// What to pull from `url` into a local repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub refspecs: Vec<String>,
    /// Only history newer than this, when the transport supports it.
    pub shallow_since: Option<DateTime<Utc>>,
    pub depth: Option<u32>,
}

impl FetchRequest {
    pub fn new(url: &str, refspecs: Vec<String>) -> Self {
        Self {
            url: url.to_string(),
            refspecs,
            shallow_since: None,
            depth: None,
        }
    }

    pub fn shallow_since(mut self, since: DateTime<Utc>) -> Self {
        self.shallow_since = Some(since);
        self
    }

    pub fn depth(mut self, depth: u32) -> Self {
        self.depth = Some(depth);
        self
    }
}

/// Remote operations the engine depends on.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch refs from a remote into the repository at `repo`.
    async fn fetch(&self, repo: &Path, request: &FetchRequest) -> Result<()>;

    /// Branch the remote's HEAD points at.
    async fn default_branch(&self, url: &str) -> Result<String>;
}

/// Captured output of a successful git invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Transport backed by the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCliTransport {
    program: PathBuf,
    timeout: Duration,
}

impl GitCliTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: PathBuf::from("git"),
            timeout,
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Run git with `args`, optionally inside `repo`, under the transport timeout.
    pub async fn execute(&self, repo: Option<&Path>, args: &[String]) -> Result<CommandOutput> {
        let mut cmd = Command::new(&self.program);
        if let Some(repo) = repo {
            cmd.arg("-C").arg(repo);
        }
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let joined = args.join(" ");
        debug!(args = %joined, "running git");
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| SocialError::Timeout {
                operation: format!("git {joined}"),
                seconds: self.timeout.as_secs(),
            })?
            .map_err(|e| SocialError::io(&self.program, e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if output.status.success() {
            return Ok(CommandOutput { stdout, stderr });
        }
        if git_ops::is_lock_file_message(&stderr) {
            return Err(SocialError::LockFile {
                path: repo.map(Path::to_path_buf).unwrap_or_default(),
                message: stderr.trim().to_string(),
            });
        }
        Err(SocialError::Command {
            args: joined,
            stderr: stderr.trim().to_string(),
        })
    }

    fn fetch_args(request: &FetchRequest, shallow: bool) -> Vec<String> {
        let mut args = vec!["fetch".to_string(), "--no-tags".to_string()];
        if shallow {
            if let Some(since) = request.shallow_since {
                args.push(format!("--shallow-since={}", since.format("%Y-%m-%d")));
            } else if let Some(depth) = request.depth {
                args.push(format!("--depth={depth}"));
            }
        }
        args.push(request.url.clone());
        args.extend(request.refspecs.iter().cloned());
        args
    }
}

#[async_trait]
impl Transport for GitCliTransport {
    async fn fetch(&self, repo: &Path, request: &FetchRequest) -> Result<()> {
        match self.execute(Some(repo), &Self::fetch_args(request, true)).await {
            Ok(_) => Ok(()),
            // A window with no commits makes git refuse the shallow request
            Err(SocialError::Command { stderr, .. })
                if request.shallow_since.is_some() && stderr.contains("shallow") =>
            {
                warn!(url = %request.url, "shallow fetch rejected, retrying at depth 1");
                let mut retry = request.clone();
                retry.shallow_since = None;
                retry.depth = Some(1);
                self.execute(Some(repo), &Self::fetch_args(&retry, true))
                    .await
                    .map(|_| ())
            }
            Err(e) => Err(e),
        }
        .map_err(|e| match e {
            SocialError::Command { stderr, .. } => SocialError::Fetch {
                url: request.url.clone(),
                message: stderr,
            },
            other => other,
        })
    }

    async fn default_branch(&self, url: &str) -> Result<String> {
        let args = vec![
            "ls-remote".to_string(),
            "--symref".to_string(),
            url.to_string(),
            "HEAD".to_string(),
        ];
        let output = self
            .execute(None, &args)
            .await
            .map_err(|e| SocialError::BranchDetection {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        parse_symref(&output.stdout).ok_or_else(|| SocialError::BranchDetection {
            url: url.to_string(),
            message: "remote HEAD is not a symbolic ref".into(),
        })
    }
}

/// Extract the branch from `ref: refs/heads/<name>\tHEAD`.
pub fn parse_symref(ls_remote: &str) -> Option<String> {
    ls_remote.lines().find_map(|line| {
        let rest = line.strip_prefix("ref:")?.trim();
        let (target, head) = rest.split_once(char::is_whitespace)?;
        if head.trim() != "HEAD" {
            return None;
        }
        target.strip_prefix("refs/heads/").map(String::from)
    })
}

/// Transport backed by libgit2. History windows are ignored; every fetch is complete.
#[derive(Debug, Clone)]
pub struct Git2Transport {
    timeout: Duration,
}

impl Git2Transport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run libgit2 work off the runtime. On timeout the work is told to stop
    /// and is joined before returning, so nothing keeps writing into the
    /// repository once the caller releases its lock.
    async fn blocking<T, F>(&self, operation: String, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<AtomicBool>) -> Result<T> + Send + 'static,
    {
        let cancel = Arc::new(AtomicBool::new(false));
        let mut task = tokio::task::spawn_blocking({
            let cancel = cancel.clone();
            move || f(cancel)
        });
        match tokio::time::timeout(self.timeout, &mut task).await {
            Err(_) => {
                cancel.store(true, Ordering::SeqCst);
                if let Err(join) = task.await {
                    warn!(%operation, error = %join, "aborted git task failed");
                }
                Err(SocialError::Timeout {
                    operation,
                    seconds: self.timeout.as_secs(),
                })
            }
            Ok(Err(join)) => Err(SocialError::Internal(format!("{operation}: {join}"))),
            Ok(Ok(result)) => result,
        }
    }
}

#[async_trait]
impl Transport for Git2Transport {
    async fn fetch(&self, repo: &Path, request: &FetchRequest) -> Result<()> {
        let path = repo.to_path_buf();
        let request = request.clone();
        self.blocking(format!("fetch {}", request.url), move |cancel| {
            let repo = git_ops::open_repo(&path)?;
            let mut remote = repo
                .remote_anonymous(&request.url)
                .map_err(|e| git_ops::map_git_error(&path, e))?;
            let mut callbacks = git2::RemoteCallbacks::new();
            callbacks.transfer_progress(move |_| !cancel.load(Ordering::SeqCst));
            let mut options = git2::FetchOptions::new();
            options.remote_callbacks(callbacks);
            options.download_tags(git2::AutotagOption::None);
            remote
                .fetch(&request.refspecs, Some(&mut options), None)
                .map_err(|e| match git_ops::map_git_error(&path, e) {
                    SocialError::Git { source, .. } => SocialError::Fetch {
                        url: request.url.clone(),
                        message: source.message().to_string(),
                    },
                    other => other,
                })
        })
        .await
    }

    async fn default_branch(&self, url: &str) -> Result<String> {
        let url = url.to_string();
        self.blocking(format!("ls-remote {url}"), move |_| {
            let detect = || -> std::result::Result<String, git2::Error> {
                let mut remote = git2::Remote::create_detached(url.as_str())?;
                remote.connect(git2::Direction::Fetch)?;
                let buf = remote.default_branch()?;
                Ok(buf.as_str().unwrap_or("").to_string())
            };
            let full = detect().map_err(|e| SocialError::BranchDetection {
                url: url.clone(),
                message: e.message().to_string(),
            })?;
            full.strip_prefix("refs/heads/")
                .map(String::from)
                .ok_or_else(|| SocialError::BranchDetection {
                    url: url.clone(),
                    message: format!("unexpected default ref '{full}'"),
                })
        })
        .await
    }
}
