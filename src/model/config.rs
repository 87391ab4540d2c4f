use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GeneralConfig {
    /// Empty means `<data dir>/plugins/start`.
    #[serde(default)]
    pub install_root: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Parallel git jobs, 0 picks one per core (at most 8).
    pub jobs: usize,
    /// Per git command, 0 disables the limit.
    pub git_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            jobs: 0,
            git_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    pub repo: String,
    #[serde(default, rename = "as")]
    pub name: Option<String>,
    #[serde(default, alias = "branch", alias = "tag", alias = "commit")]
    pub rev: Option<String>,
    #[serde(default)]
    pub lazy: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl AppConfig {
    /// Load configuration with layering: defaults → user config.
    ///
    /// An explicit path must exist; otherwise `config.toml` in the blackbox
    /// config dir is used when present.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let defaults = include_str!("../../config/default.toml");
        let mut config = Self::from_toml(defaults)?;

        let user_path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => directories::ProjectDirs::from("", "", "blackbox")
                .map(|dirs| dirs.config_dir().join("config.toml"))
                .filter(|path| path.exists()),
        };

        if let Some(path) = user_path {
            let user_str = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            config = Self::from_toml(&user_str)
                .with_context(|| format!("parsing {}", path.display()))?;
        }

        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn install_root(&self) -> PathBuf {
        let configured = self.general.install_root.trim();
        if configured.is_empty() {
            return default_install_root();
        }
        expand_tilde(Path::new(configured))
    }
}

fn default_install_root() -> PathBuf {
    if let Some(project_dirs) = directories::ProjectDirs::from("", "", "blackbox") {
        return project_dirs.data_dir().join("plugins/start");
    }

    if let Some(base_dirs) = directories::BaseDirs::new() {
        return base_dirs.home_dir().join(".local/share/blackbox/plugins/start");
    }

    PathBuf::from(".blackbox-plugins/start")
}

fn expand_tilde(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    if !text.starts_with('~') {
        return path.to_path_buf();
    }

    if let Some(base_dirs) = directories::BaseDirs::new() {
        let home = base_dirs.home_dir().to_string_lossy();
        return PathBuf::from(text.replacen('~', &home, 1));
    }

    path.to_path_buf()
}
