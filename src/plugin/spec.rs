use std::fmt;
use std::sync::Arc;

use crate::plugin::error::SyncError;
use crate::plugin::runtime::Plugin;

/// Callback run after a plugin was installed or moved to a new revision.
pub type OnSync = Arc<dyn Fn(&Plugin) + Send + Sync>;

/// A declared plugin: where it comes from and how it should be checked out.
#[derive(Clone)]
pub struct RepoSpec {
    pub name: String,
    pub url: String,
    /// Branch, tag or commit. `None` tracks the remote default branch.
    pub revision: Option<String>,
    pub lazy: bool,
    pub on_sync: Option<OnSync>,
}

/// Optional knobs accepted by `register`.
#[derive(Clone, Default)]
pub struct PluginOptions {
    /// Overrides the name derived from the url.
    pub name: Option<String>,
    pub revision: Option<String>,
    pub lazy: bool,
    pub on_sync: Option<OnSync>,
}

impl PluginOptions {
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub fn on_sync(mut self, callback: impl Fn(&Plugin) + Send + Sync + 'static) -> Self {
        self.on_sync = Some(Arc::new(callback));
        self
    }
}

impl RepoSpec {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_options(url, PluginOptions::default())
    }

    pub fn with_options(url: impl Into<String>, options: PluginOptions) -> Self {
        let url = url.into();
        let name = options
            .name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| repo_slug(&url));

        Self {
            name,
            url,
            revision: options.revision.filter(|rev| !rev.trim().is_empty()),
            lazy: options.lazy,
            on_sync: options.on_sync,
        }
    }

    /// Names become directories under the install root, so anything that
    /// could escape it or hide as a dotfile is rejected.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.name.is_empty() {
            return Err(SyncError::Config(format!(
                "cannot derive a plugin name from '{}'",
                self.url
            )));
        }

        if self.name.starts_with('.') || self.name.contains(['/', '\\']) {
            return Err(SyncError::Config(format!(
                "plugin name '{}' is not a plain directory name",
                self.name
            )));
        }

        if self.url.trim().is_empty() {
            return Err(SyncError::Config(format!(
                "plugin '{}' has an empty url",
                self.name
            )));
        }

        Ok(())
    }
}

impl fmt::Debug for RepoSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepoSpec")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("revision", &self.revision)
            .field("lazy", &self.lazy)
            .field("on_sync", &self.on_sync.is_some())
            .finish()
    }
}

/// Last path segment of a git url, without a trailing `.git`.
///
/// Handles scp-style remotes (`git@host:owner/repo.git`) and bare local
/// paths. Returns an empty string when nothing usable is left.
pub fn repo_slug(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches(['/', '\\']);
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    trimmed
        .rsplit(['/', '\\', ':'])
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or_default()
        .to_string()
}
