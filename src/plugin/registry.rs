use std::sync::Arc;

use indexmap::IndexMap;
use tracing::warn;

use crate::plugin::error::SyncError;
use crate::plugin::runtime::{Plugin, Runtime};
use crate::plugin::spec::RepoSpec;

/// Declared plugins, keyed by name, in registration order.
///
/// Registering an existing name replaces that entry in place and logs a
/// warning; two urls are never merged under one name.
pub struct Registry {
    specs: IndexMap<String, RepoSpec>,
    runtime: Arc<Runtime>,
}

impl Registry {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            specs: IndexMap::new(),
            runtime,
        }
    }

    pub fn register(&mut self, spec: RepoSpec) -> Result<Plugin, SyncError> {
        spec.validate()?;

        let name = spec.name.clone();
        if let Some(previous) = self.specs.get(&name) {
            warn!(
                plugin = %name,
                old_url = %previous.url,
                new_url = %spec.url,
                "plugin registered twice, keeping the latest spec"
            );
        }

        // `insert` keeps the original slot for an existing key.
        self.specs.insert(name.clone(), spec);
        Ok(self.runtime.handle(name))
    }

    pub fn unregister(&mut self, name: &str) -> Option<RepoSpec> {
        self.specs.shift_remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&RepoSpec> {
        self.specs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    pub fn handle(&self, name: &str) -> Option<Plugin> {
        self.contains(name).then(|| self.runtime.handle(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &RepoSpec> {
        self.specs.values()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }
}
