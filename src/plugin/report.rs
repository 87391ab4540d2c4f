use std::fmt;
use std::path::PathBuf;

use crate::plugin::error::SyncError;
use crate::plugin::spec::RepoSpec;

/// What the engine decided to do for one plugin.
#[derive(Debug, Clone)]
pub enum SyncAction {
    Install(RepoSpec),
    Update {
        spec: RepoSpec,
        from: Option<String>,
        /// `None` when the update failed before a new revision was known.
        to: Option<String>,
    },
    UpToDate {
        spec: RepoSpec,
        revision: Option<String>,
    },
    Remove {
        name: String,
        path: PathBuf,
    },
}

impl SyncAction {
    pub fn name(&self) -> &str {
        match self {
            SyncAction::Install(spec)
            | SyncAction::Update { spec, .. }
            | SyncAction::UpToDate { spec, .. } => &spec.name,
            SyncAction::Remove { name, .. } => name,
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            SyncAction::Install(_) => "install",
            SyncAction::Update { .. } => "update",
            SyncAction::UpToDate { .. } => "up to date",
            SyncAction::Remove { .. } => "remove",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Failed(SyncError),
}

#[derive(Debug, Clone)]
pub struct SyncResult {
    pub action: SyncAction,
    pub outcome: Outcome,
}

impl SyncResult {
    pub fn ok(action: SyncAction) -> Self {
        Self {
            action,
            outcome: Outcome::Ok,
        }
    }

    pub fn failed(action: SyncAction, err: SyncError) -> Self {
        Self {
            action,
            outcome: Outcome::Failed(err),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome == Outcome::Ok
    }

    pub fn error(&self) -> Option<&SyncError> {
        match &self.outcome {
            Outcome::Ok => None,
            Outcome::Failed(err) => Some(err),
        }
    }
}

/// Per-kind tallies shown after a command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub installed: usize,
    pub updated: usize,
    pub up_to_date: usize,
    pub removed: usize,
    pub failed: usize,
}

/// Every result of one install/update/sync/clean invocation, in report order.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub results: Vec<SyncResult>,
}

impl SyncReport {
    pub fn new(results: Vec<SyncResult>) -> Self {
        Self { results }
    }

    pub fn get(&self, name: &str) -> Option<&SyncResult> {
        self.results.iter().find(|result| result.action.name() == name)
    }

    pub fn has_failures(&self) -> bool {
        self.results.iter().any(|result| !result.is_ok())
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for result in &self.results {
            let slot = match (&result.outcome, &result.action) {
                (Outcome::Failed(_), _) => &mut summary.failed,
                (Outcome::Ok, SyncAction::Install(_)) => &mut summary.installed,
                (Outcome::Ok, SyncAction::Update { .. }) => &mut summary.updated,
                (Outcome::Ok, SyncAction::UpToDate { .. }) => &mut summary.up_to_date,
                (Outcome::Ok, SyncAction::Remove { .. }) => &mut summary.removed,
            };
            *slot += 1;
        }
        summary
    }

    pub fn summary_notification(&self) -> String {
        let Summary {
            installed,
            updated,
            up_to_date,
            removed,
            failed,
        } = self.summary();
        format!(
            "plugins: {installed} installed, {updated} updated, {up_to_date} up to date, \
             {removed} removed, {failed} failed"
        )
    }

    pub fn failure_notifications(&self) -> Vec<String> {
        self.results
            .iter()
            .filter_map(|result| {
                result.error().map(|err| {
                    format!(
                        "plugin {} ({} failed, {}): {err}",
                        result.action.name(),
                        result.action.verb(),
                        err.kind()
                    )
                })
            })
            .collect()
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.summary_notification())?;
        for line in self.failure_notifications() {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}
