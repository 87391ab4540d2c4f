//! One-shot deferred-load hooks.
//!
//! The host owns event delivery; it only has to call [`Triggers::fire`] with
//! a trigger name and whatever payload it wants to pass along.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use slotmap::{SlotMap, new_key_type};
use smallvec::SmallVec;
use tracing::debug;

use crate::plugin::runtime::{Plugin, WeakPlugin};

new_key_type! {
    pub struct HookKey;
}

/// What a trigger callback receives.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerEvent {
    pub trigger: String,
    /// Host-defined data, an empty table when the host has nothing to say.
    pub payload: toml::Value,
}

pub(crate) type HookCallback = Box<dyn FnOnce(&TriggerEvent, &Plugin) + Send>;

struct Hook {
    triggers: SmallVec<[String; 2]>,
    plugin: WeakPlugin,
    callback: HookCallback,
}

#[derive(Default)]
struct Table {
    hooks: SlotMap<HookKey, Hook>,
    by_trigger: HashMap<String, SmallVec<[HookKey; 4]>>,
}

impl Table {
    /// Detaches a hook from every trigger it was listening on.
    fn take(&mut self, key: HookKey) -> Option<Hook> {
        let hook = self.hooks.remove(key)?;
        for trigger in &hook.triggers {
            if let Some(keys) = self.by_trigger.get_mut(trigger) {
                keys.retain(|other| *other != key);
                if keys.is_empty() {
                    self.by_trigger.remove(trigger);
                }
            }
        }
        Some(hook)
    }
}

#[derive(Default)]
pub struct Triggers {
    table: Mutex<Table>,
}

impl Triggers {
    pub(crate) fn register(
        &self,
        triggers: &[&str],
        plugin: WeakPlugin,
        callback: HookCallback,
    ) -> Option<HookKey> {
        let mut names: SmallVec<[String; 2]> = SmallVec::new();
        for trigger in triggers {
            if !names.iter().any(|name| name == trigger) {
                names.push((*trigger).to_string());
            }
        }

        if names.is_empty() {
            debug!(plugin = %plugin.name, "load_on without triggers ignored");
            return None;
        }

        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let key = table.hooks.insert(Hook {
            triggers: names.clone(),
            plugin,
            callback,
        });
        for name in names {
            table.by_trigger.entry(name).or_default().push(key);
        }
        Some(key)
    }

    /// Runs and removes every hook waiting on `trigger`.
    ///
    /// Returns how many user callbacks ran. Callbacks run outside the table
    /// lock, so they may register further hooks.
    pub fn fire(&self, trigger: &str, payload: toml::Value) -> usize {
        let hooks: Vec<Hook> = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            let keys = table.by_trigger.remove(trigger).unwrap_or_default();
            keys.into_iter().filter_map(|key| table.take(key)).collect()
        };

        if hooks.is_empty() {
            return 0;
        }

        let event = TriggerEvent {
            trigger: trigger.to_string(),
            payload,
        };

        let mut ran = 0;
        for hook in hooks {
            let Some(plugin) = hook.plugin.upgrade() else {
                continue;
            };

            if !plugin.installed() {
                debug!(plugin = %plugin.name(), trigger, "plugin not installed, skipping hook");
                continue;
            }

            plugin.load();
            (hook.callback)(&event, &plugin);
            ran += 1;
        }
        ran
    }

    /// Number of hooks still waiting on `trigger`.
    pub fn pending(&self, trigger: &str) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_trigger
            .get(trigger)
            .map_or(0, |keys| keys.len())
    }

    /// Drops a hook without running it.
    pub fn cancel(&self, key: HookKey) -> bool {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take(key)
            .is_some()
    }
}
