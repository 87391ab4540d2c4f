//! Declarative, git-backed plugin management for blackbox.
//!
//! Plugins are declared in a [`plugin::Registry`], converged onto disk by a
//! [`plugin::SyncEngine`] and activated through [`plugin::Plugin`] handles,
//! either eagerly or when a host trigger fires.

pub mod model;
pub mod plugin;
