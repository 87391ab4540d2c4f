use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::model::config::AppConfig;
use crate::plugin::error::SyncError;
use crate::plugin::git::{GitBackend, GitCli};
use crate::plugin::install_state::InstallState;
use crate::plugin::installer::{CancelToken, SyncEngine};
use crate::plugin::registry::Registry;
use crate::plugin::report::SyncReport;
use crate::plugin::runtime::{Host, Plugin, Runtime};
use crate::plugin::spec::{PluginOptions, RepoSpec};

/// Command context: one registry, one engine, one set of plugin handles.
pub struct PluginManager {
    registry: Registry,
    engine: SyncEngine,
    config_errors: Vec<String>,
}

impl PluginManager {
    pub fn new(
        install_root: impl Into<PathBuf>,
        git: Arc<dyn GitBackend>,
        host: Arc<dyn Host>,
    ) -> Self {
        Self {
            registry: Registry::new(Runtime::new(install_root, host)),
            engine: SyncEngine::new(git),
            config_errors: Vec::new(),
        }
    }

    /// Builds a manager over `git` on PATH and registers every enabled
    /// plugin from `config`. Bad entries are skipped and kept for
    /// [`Self::startup_notifications`].
    pub fn from_config(config: &AppConfig, host: Arc<dyn Host>) -> Self {
        let mut git = GitCli::new();
        if config.sync.git_timeout_secs > 0 {
            git = git.with_timeout(Duration::from_secs(config.sync.git_timeout_secs));
        }

        let mut manager = Self {
            registry: Registry::new(Runtime::new(config.install_root(), host)),
            engine: SyncEngine::new(Arc::new(git)).with_jobs(config.sync.jobs),
            config_errors: Vec::new(),
        };

        for plugin in &config.plugins {
            if !plugin.enabled {
                continue;
            }

            let mut options = PluginOptions::default().lazy(plugin.lazy);
            options.name = plugin.name.clone();
            options.revision = plugin.rev.clone();

            if let Err(err) = manager.register(&plugin.repo, options) {
                warn!(repo = %plugin.repo, "skipping configured plugin: {err}");
                manager
                    .config_errors
                    .push(format!("plugin {}: {err}", plugin.repo));
            }
        }

        manager
    }

    pub fn register(
        &mut self,
        url: impl Into<String>,
        options: PluginOptions,
    ) -> Result<Plugin, SyncError> {
        self.registry.register(RepoSpec::with_options(url, options))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn plugin(&self, name: &str) -> Option<Plugin> {
        self.registry.handle(name)
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.engine.cancel_token()
    }

    pub fn install(&self) -> SyncReport {
        self.engine.install(&self.registry)
    }

    pub fn update(&self) -> SyncReport {
        self.engine.update(&self.registry)
    }

    pub fn sync(&self) -> SyncReport {
        self.engine.sync(&self.registry)
    }

    pub fn clean(&self) -> SyncReport {
        self.engine.clean(&self.registry)
    }

    /// Host entry point for deferred loading.
    pub fn fire(&self, trigger: &str, payload: toml::Value) -> usize {
        self.registry.runtime().triggers().fire(trigger, payload)
    }

    /// Loads every installed plugin not marked lazy. Returns how many.
    pub fn load_eager(&self) -> usize {
        let mut loaded = 0;
        for spec in self.registry.iter().filter(|spec| !spec.lazy) {
            let plugin = self.registry.runtime().handle(spec.name.clone());
            if plugin.installed() {
                plugin.load();
                loaded += 1;
            }
        }
        loaded
    }

    pub fn startup_notifications(&self) -> Vec<String> {
        self.config_errors.clone()
    }

    pub fn list_notifications(&self) -> Vec<String> {
        if self.registry.is_empty() {
            return vec!["plugins: none configured".to_string()];
        }

        let root = self.registry.runtime().install_root();
        self.registry
            .iter()
            .map(|spec| {
                let status = match InstallState::entry(root, &spec.name) {
                    Some(entry) => match entry.current_revision {
                        Some(rev) => format!("installed {}", short_rev(&rev)),
                        None => "installed".to_string(),
                    },
                    None => "missing".to_string(),
                };
                let mode = if spec.lazy { "lazy" } else { "eager" };
                let pin = spec
                    .revision
                    .as_deref()
                    .map(|rev| format!(" @{rev}"))
                    .unwrap_or_default();

                format!("plugin {} [{status}, {mode}] ({}{pin})", spec.name, spec.url)
            })
            .collect()
    }
}

fn short_rev(rev: &str) -> &str {
    rev.get(..7).unwrap_or(rev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::installer::tests::{FakeGit, rev};
    use crate::plugin::runtime::tests::RecordingHost;

    const REPO_A: &str = "https://example/repoA";
    const REPO_B: &str = "https://example/repoB";

    fn manager(root: &std::path::Path) -> (PluginManager, Arc<RecordingHost>) {
        let git = FakeGit::default()
            .with_remote(REPO_A, &rev(1))
            .with_remote(REPO_B, &rev(2));
        let host = Arc::new(RecordingHost::default());
        (
            PluginManager::new(root, Arc::new(git), host.clone()),
            host,
        )
    }

    #[test]
    fn register_then_install_end_to_end() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut manager, _) = manager(tmp.path());
        let plugin = manager
            .register(REPO_A, PluginOptions::default())
            .unwrap();
        assert!(!plugin.installed());

        let report = manager.install();

        assert_eq!(report.summary().installed, 1);
        assert!(plugin.installed());
        assert!(tmp.path().join("repoA/.git").is_dir());
        assert_eq!(
            manager.list_notifications(),
            vec![format!("plugin repoA [installed 0000000, eager] ({REPO_A})")]
        );
    }

    #[test]
    fn load_eager_skips_lazy_and_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut manager, host) = manager(tmp.path());
        manager.register(REPO_A, PluginOptions::default()).unwrap();
        manager
            .register(REPO_B, PluginOptions::default().lazy(true))
            .unwrap();
        manager
            .register("https://example/missing", PluginOptions::default())
            .unwrap();

        let report = manager.install();
        assert_eq!(report.summary().installed, 2);
        assert_eq!(report.summary().failed, 1);

        assert_eq!(manager.load_eager(), 1);
        assert_eq!(host.loads(), vec!["repoA"]);

        // The lazy one comes in through its trigger.
        manager
            .plugin("repoB")
            .unwrap()
            .load_on(&["FileType"], |_, _| {});
        assert_eq!(manager.fire("FileType", toml::Value::Boolean(true)), 1);
        assert_eq!(host.loads(), vec!["repoA", "repoB"]);
    }

    #[test]
    fn list_shows_missing_and_pins() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut manager, _) = manager(tmp.path());
        assert_eq!(
            manager.list_notifications(),
            vec!["plugins: none configured".to_string()]
        );

        manager
            .register(REPO_B, PluginOptions::default().lazy(true).revision("v1"))
            .unwrap();
        assert_eq!(
            manager.list_notifications(),
            vec![format!("plugin repoB [missing, lazy] ({REPO_B} @v1)")]
        );
    }

    #[test]
    fn from_config_registers_enabled_plugins_and_reports_bad_ones() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AppConfig::from_toml(&format!(
            r#"
            [general]
            install_root = '{}'

            [[plugins]]
            repo = "https://example/one"

            [[plugins]]
            repo = "https://example/two"
            as = "renamed"
            branch = "stable"
            lazy = true

            [[plugins]]
            repo = "https://example/off"
            enabled = false

            [[plugins]]
            repo = "https://example/bad"
            as = "../bad"
            "#,
            tmp.path().display()
        ))
        .unwrap();

        let manager = PluginManager::from_config(&config, Arc::new(RecordingHost::default()));

        let names: Vec<&str> = manager
            .registry()
            .iter()
            .map(|spec| spec.name.as_str())
            .collect();
        assert_eq!(names, vec!["one", "renamed"]);

        let renamed = manager.registry().get("renamed").unwrap();
        assert!(renamed.lazy);
        assert_eq!(renamed.revision.as_deref(), Some("stable"));
        assert_eq!(
            manager.plugin("one").unwrap().path(),
            tmp.path().join("one")
        );
        assert_eq!(manager.startup_notifications().len(), 1);
    }
}
