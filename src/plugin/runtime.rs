use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::debug;

use crate::plugin::install_state::InstallState;
use crate::plugin::triggers::{HookKey, TriggerEvent, Triggers};

/// The host's module loader: make the unit at `path` active under `name`.
pub trait Host: Send + Sync {
    fn load(&self, name: &str, path: &Path);
}

/// State shared by every plugin handle of one session.
pub struct Runtime {
    install_root: PathBuf,
    host: Arc<dyn Host>,
    loaded: Mutex<HashSet<String>>,
    triggers: Triggers,
}

impl Runtime {
    pub fn new(install_root: impl Into<PathBuf>, host: Arc<dyn Host>) -> Arc<Self> {
        Arc::new(Self {
            install_root: install_root.into(),
            host,
            loaded: Mutex::new(HashSet::new()),
            triggers: Triggers::default(),
        })
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    pub fn triggers(&self) -> &Triggers {
        &self.triggers
    }

    pub fn handle(self: &Arc<Self>, name: impl Into<String>) -> Plugin {
        Plugin {
            name: name.into(),
            runtime: Arc::clone(self),
        }
    }
}

/// Handle to one registered plugin, valid whether or not it is installed.
///
/// Every query goes back to the filesystem; the handle caches nothing.
#[derive(Clone)]
pub struct Plugin {
    name: String,
    runtime: Arc<Runtime>,
}

impl Plugin {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> PathBuf {
        self.runtime.install_root.join(&self.name)
    }

    pub fn installed(&self) -> bool {
        InstallState::is_installed(&self.runtime.install_root, &self.name)
    }

    pub fn is_loaded(&self) -> bool {
        self.runtime
            .loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&self.name)
    }

    /// Hands the plugin to the host loader once per session.
    pub fn load(&self) {
        let first = self
            .runtime
            .loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.name.clone());

        if first {
            debug!(plugin = %self.name, "loading plugin");
            self.runtime.host.load(&self.name, &self.path());
        }
    }

    /// Defers `load` until any of `triggers` fires, then calls `callback`.
    ///
    /// All trigger names share one hook, so the plugin loads at most once no
    /// matter how many of them fire. A plugin that is not installed when the
    /// trigger fires is skipped without calling `callback`.
    ///
    /// The key drops the hook unrun through [`Triggers::cancel`]. `None`
    /// when `triggers` is empty and nothing was registered.
    pub fn load_on<F>(&self, triggers: &[&str], callback: F) -> Option<HookKey>
    where
        F: FnOnce(&TriggerEvent, &Plugin) + Send + 'static,
    {
        self.runtime
            .triggers
            .register(triggers, self.downgrade(), Box::new(callback))
    }

    pub(crate) fn downgrade(&self) -> WeakPlugin {
        WeakPlugin {
            name: self.name.clone(),
            runtime: Arc::downgrade(&self.runtime),
        }
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("path", &self.path())
            .finish()
    }
}

/// Hooks hold this instead of a [`Plugin`] so the trigger table does not
/// keep its own runtime alive.
pub(crate) struct WeakPlugin {
    pub(crate) name: String,
    runtime: Weak<Runtime>,
}

impl WeakPlugin {
    pub(crate) fn upgrade(&self) -> Option<Plugin> {
        self.runtime.upgrade().map(|runtime| Plugin {
            name: self.name.clone(),
            runtime,
        })
    }
}
