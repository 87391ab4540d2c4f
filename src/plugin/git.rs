//! Version control plumbing.
//!
//! [`GitBackend`] is the only seam through which the sync engine touches a
//! working tree. [`GitCli`] implements it by shelling out to `git`; every
//! failure comes back as a [`SyncError`] value carrying git's stderr.

use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::plugin::error::SyncError;
use crate::plugin::install_state::git_dir;

/// Result of bringing an existing checkout to its desired revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checkout {
    Changed { from: Option<String>, to: String },
    UpToDate { revision: String },
}

pub trait GitBackend: Send + Sync {
    /// Clones `url` into `dest`, then checks out `revision` if given.
    ///
    /// On failure `dest` must not be left behind looking like a repository.
    fn clone_repo(&self, url: &str, dest: &Path, revision: Option<&str>) -> Result<(), SyncError>;

    /// Fetches and moves the worktree to `revision`, or to the remote default
    /// branch tip when unpinned. Refuses to touch a dirty worktree.
    fn fetch_and_checkout(
        &self,
        dest: &Path,
        revision: Option<&str>,
    ) -> Result<Checkout, SyncError>;

    fn current_revision(&self, dest: &Path) -> Result<String, SyncError>;

    /// True when tracked files have uncommitted modifications.
    fn is_dirty(&self, dest: &Path) -> Result<bool, SyncError>;

    fn remove(&self, dest: &Path) -> Result<(), SyncError> {
        match fs::remove_dir_all(dest) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SyncError::filesystem(dest, err)),
        }
    }
}

/// [`GitBackend`] over the `git` executable on PATH.
#[derive(Debug, Clone, Default)]
pub struct GitCli {
    timeout: Option<Duration>,
}

impl GitCli {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill any single git invocation that runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Check if git is available on PATH.
    pub fn is_available() -> bool {
        Command::new("git")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn run(&self, cwd: Option<&Path>, args: &[&str]) -> Result<String, SyncError> {
        let subcommand = args.first().copied().unwrap_or("git").to_string();

        let mut command = Command::new("git");
        command
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        debug!(?args, cwd = ?cwd, "running git");

        let mut child = command.spawn().map_err(|err| SyncError::Git {
            command: subcommand.clone(),
            message: format!("cannot run git: {err}"),
        })?;

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);
        let status = self.wait(&mut child, &subcommand)?;
        let stdout = collect(stdout);
        let stderr = collect(stderr);

        if status.success() {
            return Ok(stdout);
        }

        let message = match stderr.trim() {
            "" => format!("exited with {status}"),
            text => text.to_string(),
        };
        Err(SyncError::Git {
            command: subcommand,
            message,
        })
    }

    fn wait(&self, child: &mut Child, subcommand: &str) -> Result<ExitStatus, SyncError> {
        let io_error = |err: std::io::Error| SyncError::Git {
            command: subcommand.to_string(),
            message: err.to_string(),
        };

        let Some(timeout) = self.timeout else {
            return child.wait().map_err(io_error);
        };

        let poll = timeout.min(Duration::from_millis(50));
        let start = Instant::now();
        loop {
            if let Some(status) = child.try_wait().map_err(io_error)? {
                return Ok(status);
            }

            if start.elapsed() > timeout {
                warn!(command = subcommand, "git timed out, killing process");
                drop(child.kill());
                drop(child.wait());
                return Err(SyncError::Timeout {
                    command: subcommand.to_string(),
                    timeout,
                });
            }

            thread::sleep(poll);
        }
    }

    fn clone_into(&self, url: &str, dest: &Path, revision: Option<&str>) -> Result<(), SyncError> {
        let dest_str = utf8(dest)?;
        self.run(
            None,
            &["clone", "--quiet", "--recurse-submodules", "--", url, dest_str],
        )
        .map_err(as_network)?;

        match revision {
            Some(revision) => self.apply_revision(dest, Some(revision)),
            None => Ok(()),
        }
    }

    fn apply_revision(&self, dest: &Path, revision: Option<&str>) -> Result<(), SyncError> {
        match revision {
            None => {
                let branch = self.default_branch(dest)?;
                self.checkout_branch(dest, &branch)
            }
            Some(revision) if self.has_remote_branch(dest, revision) => {
                self.checkout_branch(dest, revision)
            }
            Some(revision) => {
                let commit = self.resolve(dest, revision)?;
                self.run(Some(dest), &["checkout", "--quiet", "--detach", commit.as_str()])?;
                self.update_submodules(dest)
            }
        }
    }

    fn checkout_branch(&self, dest: &Path, branch: &str) -> Result<(), SyncError> {
        let upstream = format!("origin/{branch}");
        self.run(Some(dest), &["checkout", "--quiet", branch])?;
        // Local commits on the branch are kept; a diverged branch fails here.
        self.run(Some(dest), &["merge", "--ff-only", "--quiet", upstream.as_str()])?;
        self.update_submodules(dest)
    }

    fn update_submodules(&self, dest: &Path) -> Result<(), SyncError> {
        self.run(
            Some(dest),
            &["submodule", "update", "--init", "--recursive", "--quiet"],
        )
        .map(|_| ())
        .map_err(as_network)
    }

    fn default_branch(&self, dest: &Path) -> Result<String, SyncError> {
        let lookup = || {
            self.run(Some(dest), &["rev-parse", "--abbrev-ref", "origin/HEAD"])
                .map(|out| out.trim().trim_start_matches("origin/").to_string())
        };

        match lookup() {
            Ok(branch) if !branch.is_empty() && branch != "HEAD" => Ok(branch),
            _ => {
                self.run(Some(dest), &["remote", "set-head", "origin", "--auto"])
                    .map_err(as_network)?;
                lookup()
            }
        }
    }

    fn has_remote_branch(&self, dest: &Path, branch: &str) -> bool {
        let reference = format!("refs/remotes/origin/{branch}");
        self.run(Some(dest), &["rev-parse", "--verify", "--quiet", reference.as_str()])
            .is_ok()
    }

    fn resolve(&self, dest: &Path, revision: &str) -> Result<String, SyncError> {
        let spec = format!("{revision}^{{commit}}");
        self.run(Some(dest), &["rev-parse", "--verify", "--quiet", spec.as_str()])
            .map(|out| out.trim().to_string())
            .map_err(|err| SyncError::Revision {
                revision: revision.to_string(),
                message: match err {
                    SyncError::Git { message, .. } => message,
                    other => other.to_string(),
                },
            })
    }
}

impl GitBackend for GitCli {
    fn clone_repo(&self, url: &str, dest: &Path, revision: Option<&str>) -> Result<(), SyncError> {
        if let Ok(mut existing) = fs::read_dir(dest) {
            if existing.next().is_some() {
                return Err(SyncError::filesystem(
                    dest,
                    "directory exists and is not an installed plugin",
                ));
            }
        } else if dest.exists() {
            return Err(SyncError::filesystem(dest, "path exists and is not a directory"));
        }

        let staging = staging_path(dest)?;
        if let Some(parent) = staging.parent() {
            fs::create_dir_all(parent).map_err(|err| SyncError::filesystem(parent, err))?;
        }

        // Left over from an interrupted clone.
        self.remove(&staging)?;

        let result = self
            .clone_into(url, &staging, revision)
            .and_then(|()| publish(&staging, dest));
        if result.is_err() {
            if let Err(err) = self.remove(&staging) {
                warn!(path = %staging.display(), "failed to discard partial clone: {err}");
            }
        }
        result
    }

    fn fetch_and_checkout(
        &self,
        dest: &Path,
        revision: Option<&str>,
    ) -> Result<Checkout, SyncError> {
        if git_dir(dest).is_none() {
            return Err(SyncError::filesystem(dest, "not a git repository"));
        }

        if self.is_dirty(dest)? {
            return Err(SyncError::DirtyWorktree {
                path: dest.to_path_buf(),
            });
        }

        let from = self.current_revision(dest).ok();
        self.run(
            Some(dest),
            &["fetch", "--quiet", "--tags", "--force", "--prune", "origin"],
        )
        .map_err(as_network)?;
        if revision.is_none() {
            // Upstream may have switched its default branch since the clone.
            if let Err(err) = self.run(Some(dest), &["remote", "set-head", "origin", "--auto"]) {
                debug!(path = %dest.display(), "keeping cached origin/HEAD: {err}");
            }
        }
        self.apply_revision(dest, revision)?;
        let to = self.current_revision(dest)?;

        if from.as_deref() == Some(to.as_str()) {
            Ok(Checkout::UpToDate { revision: to })
        } else {
            Ok(Checkout::Changed { from, to })
        }
    }

    fn current_revision(&self, dest: &Path) -> Result<String, SyncError> {
        self.run(Some(dest), &["rev-parse", "HEAD"])
            .map(|out| out.trim().to_string())
    }

    fn is_dirty(&self, dest: &Path) -> Result<bool, SyncError> {
        self.run(
            Some(dest),
            &["status", "--porcelain", "--untracked-files=no"],
        )
        .map(|out| !out.trim().is_empty())
    }
}

/// Clones land in `<root>/.<name>.partial` first; the install scan skips
/// dot-prefixed entries, so nothing half-written is ever seen as installed.
fn staging_path(dest: &Path) -> Result<PathBuf, SyncError> {
    let name = dest
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| SyncError::filesystem(dest, "destination has no usable file name"))?;
    Ok(dest.with_file_name(format!(".{name}.partial")))
}

/// Moves a finished clone into place. An empty `dest` is replaced; anything
/// else already there wins and is left alone.
fn publish(staging: &Path, dest: &Path) -> Result<(), SyncError> {
    match fs::remove_dir(dest) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(SyncError::filesystem(dest, err)),
    }
    fs::rename(staging, dest).map_err(|err| SyncError::filesystem(dest, err))
}

fn drain(mut pipe: impl Read + Send + 'static) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = String::new();
        drop(pipe.read_to_string(&mut buffer));
        buffer
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Clone/fetch failures are reported as network trouble.
fn as_network(err: SyncError) -> SyncError {
    match err {
        SyncError::Git { message, .. } => SyncError::Network(message),
        other => other,
    }
}

fn utf8(path: &Path) -> Result<&str, SyncError> {
    path.to_str()
        .ok_or_else(|| SyncError::filesystem(path, "path is not valid UTF-8"))
}
