//! Convergence of declared plugins with the install root.
//!
//! [`SyncEngine`] diffs the [`Registry`] against [`InstallState`] and drives a
//! [`GitBackend`] on a small worker pool. Each plugin is handled in isolation:
//! a failure becomes one `Failed` entry in the report and the batch carries on.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;

use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::plugin::error::SyncError;
use crate::plugin::git::{Checkout, GitBackend};
use crate::plugin::install_state::{InstallState, InstalledEntry};
use crate::plugin::registry::Registry;
use crate::plugin::report::{SyncAction, SyncReport, SyncResult};
use crate::plugin::spec::RepoSpec;

/// Shared flag that stops jobs which have not started yet.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Single-flight guard within one engine: one mutex per plugin name.
#[derive(Default)]
struct NameLocks(Mutex<HashMap<String, Arc<Mutex<()>>>>);

impl NameLocks {
    fn get(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(name.to_string()).or_default())
    }
}

/// Exclusive lock on `<root>/.<name>.lock`, shared with every other process
/// syncing the same install root. Released when the file is dropped.
fn lock_on_disk(root: &Path, name: &str) -> Result<File, SyncError> {
    fs::create_dir_all(root).map_err(|err| SyncError::filesystem(root, err))?;

    let path = root.join(format!(".{name}.lock"));
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|err| SyncError::filesystem(&path, err))?;

    if file.try_lock_exclusive().is_err() {
        debug!(plugin = name, "waiting for another sync of this plugin");
        file.lock_exclusive()
            .map_err(|err| SyncError::filesystem(&path, err))?;
    }
    Ok(file)
}

enum Job {
    Install(RepoSpec),
    Update(RepoSpec),
    Remove(InstalledEntry),
}

impl Job {
    fn name(&self) -> &str {
        match self {
            Job::Install(spec) | Job::Update(spec) => &spec.name,
            Job::Remove(entry) => &entry.name,
        }
    }

    fn action(&self) -> SyncAction {
        match self {
            Job::Install(spec) => SyncAction::Install(spec.clone()),
            Job::Update(spec) => SyncAction::Update {
                spec: spec.clone(),
                from: None,
                to: None,
            },
            Job::Remove(entry) => SyncAction::Remove {
                name: entry.name.clone(),
                path: entry.path.clone(),
            },
        }
    }
}

pub struct SyncEngine {
    git: Arc<dyn GitBackend>,
    jobs: usize,
    locks: NameLocks,
    cancel: CancelToken,
}

impl SyncEngine {
    pub fn new(git: Arc<dyn GitBackend>) -> Self {
        Self {
            git,
            jobs: default_jobs(),
            locks: NameLocks::default(),
            cancel: CancelToken::default(),
        }
    }

    /// Caps how many plugins are worked on at once. Zero means the default.
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = if jobs == 0 { default_jobs() } else { jobs };
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Clones every registered plugin that is not on disk yet.
    pub fn install(&self, registry: &Registry) -> SyncReport {
        let installed = InstallState::scan(registry.runtime().install_root());
        let jobs = registry
            .iter()
            .filter(|spec| !installed.contains_key(&spec.name))
            .map(|spec| Job::Install(spec.clone()))
            .collect();
        self.run(registry, jobs)
    }

    /// Re-applies the revision policy of every registered plugin on disk.
    ///
    /// Registered but missing plugins are left to `install`.
    pub fn update(&self, registry: &Registry) -> SyncReport {
        let installed = InstallState::scan(registry.runtime().install_root());
        let jobs = registry
            .iter()
            .filter(|spec| installed.contains_key(&spec.name))
            .map(|spec| Job::Update(spec.clone()))
            .collect();
        self.run(registry, jobs)
    }

    /// Install and update in one pass: one result per registered plugin.
    pub fn sync(&self, registry: &Registry) -> SyncReport {
        let installed = InstallState::scan(registry.runtime().install_root());
        let jobs = registry
            .iter()
            .map(|spec| {
                if installed.contains_key(&spec.name) {
                    Job::Update(spec.clone())
                } else {
                    Job::Install(spec.clone())
                }
            })
            .collect();
        self.run(registry, jobs)
    }

    /// Deletes installed plugins whose name is no longer registered.
    ///
    /// The name is the only join key: a registered name whose url changed is
    /// kept, and directories that are not repositories are never touched.
    pub fn clean(&self, registry: &Registry) -> SyncReport {
        let jobs = InstallState::scan(registry.runtime().install_root())
            .into_values()
            .filter(|entry| !registry.contains(&entry.name))
            .map(Job::Remove)
            .collect();
        self.run(registry, jobs)
    }

    fn run(&self, registry: &Registry, jobs: Vec<Job>) -> SyncReport {
        if jobs.is_empty() {
            return SyncReport::default();
        }

        let workers = self.jobs.clamp(1, jobs.len());
        let next = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel();

        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let next = &next;
                let jobs = &jobs;
                scope.spawn(move || {
                    loop {
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        let Some(job) = jobs.get(index) else {
                            break;
                        };
                        if tx.send((index, self.execute(registry, job))).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(tx);

        let mut results: Vec<(usize, SyncResult)> = rx.into_iter().collect();
        results.sort_by_key(|(index, _)| *index);
        SyncReport::new(results.into_iter().map(|(_, result)| result).collect())
    }

    fn execute(&self, registry: &Registry, job: &Job) -> SyncResult {
        if self.cancel.is_cancelled() {
            return SyncResult::failed(job.action(), SyncError::Cancelled);
        }

        let lock = self.locks.get(job.name());
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _file_lock = match lock_on_disk(registry.runtime().install_root(), job.name()) {
            Ok(file) => file,
            Err(err) => {
                warn!(plugin = job.name(), "cannot lock plugin: {err}");
                return SyncResult::failed(job.action(), err);
            }
        };

        match job {
            Job::Install(spec) => self.install_one(registry, spec),
            Job::Update(spec) => self.update_one(registry, spec),
            Job::Remove(entry) => self.remove_one(entry),
        }
    }

    fn install_one(&self, registry: &Registry, spec: &RepoSpec) -> SyncResult {
        let root = registry.runtime().install_root();

        // Another invocation may have finished this plugin while we waited.
        if let Some(entry) = InstallState::entry(root, &spec.name) {
            return SyncResult::ok(SyncAction::UpToDate {
                spec: spec.clone(),
                revision: entry.current_revision,
            });
        }

        let dest = root.join(&spec.name);
        match self
            .git
            .clone_repo(&spec.url, &dest, spec.revision.as_deref())
        {
            Ok(()) => {
                info!(plugin = %spec.name, url = %spec.url, "installed plugin");
                notify(registry, spec);
                SyncResult::ok(SyncAction::Install(spec.clone()))
            }
            Err(err) => {
                warn!(plugin = %spec.name, url = %spec.url, "install failed: {err}");
                SyncResult::failed(SyncAction::Install(spec.clone()), err)
            }
        }
    }

    fn update_one(&self, registry: &Registry, spec: &RepoSpec) -> SyncResult {
        let root = registry.runtime().install_root();
        let Some(entry) = InstallState::entry(root, &spec.name) else {
            let path = root.join(&spec.name);
            return SyncResult::failed(
                SyncAction::Update {
                    spec: spec.clone(),
                    from: None,
                    to: None,
                },
                SyncError::filesystem(path, "plugin disappeared during update"),
            );
        };

        match self
            .git
            .fetch_and_checkout(&entry.path, spec.revision.as_deref())
        {
            Ok(Checkout::Changed { from, to }) => {
                info!(
                    plugin = %spec.name,
                    from = from.as_deref().unwrap_or("unknown"),
                    to = %to,
                    "updated plugin"
                );
                notify(registry, spec);
                SyncResult::ok(SyncAction::Update {
                    spec: spec.clone(),
                    from,
                    to: Some(to),
                })
            }
            Ok(Checkout::UpToDate { revision }) => SyncResult::ok(SyncAction::UpToDate {
                spec: spec.clone(),
                revision: Some(revision),
            }),
            Err(err) => {
                warn!(plugin = %spec.name, "update failed: {err}");
                SyncResult::failed(
                    SyncAction::Update {
                        spec: spec.clone(),
                        from: entry.current_revision,
                        to: None,
                    },
                    err,
                )
            }
        }
    }

    fn remove_one(&self, entry: &InstalledEntry) -> SyncResult {
        let action = SyncAction::Remove {
            name: entry.name.clone(),
            path: entry.path.clone(),
        };

        match self.git.remove(&entry.path) {
            Ok(()) => {
                info!(plugin = %entry.name, path = %entry.path.display(), "removed plugin");
                SyncResult::ok(action)
            }
            Err(err) => {
                warn!(plugin = %entry.name, "remove failed: {err}");
                SyncResult::failed(action, err)
            }
        }
    }
}

/// Runs the spec's `on_sync` on the current worker. A panicking callback is
/// logged and does not take the batch down.
fn notify(registry: &Registry, spec: &RepoSpec) {
    let Some(callback) = spec.on_sync.as_ref() else {
        return;
    };

    let plugin = registry.runtime().handle(spec.name.clone());
    if panic::catch_unwind(AssertUnwindSafe(|| callback(&plugin))).is_err() {
        warn!(plugin = %spec.name, "on_sync callback panicked");
    }
}

fn default_jobs() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(8)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use super::*;
    use crate::plugin::runtime::Runtime;
    use crate::plugin::runtime::tests::RecordingHost;
    use crate::plugin::spec::PluginOptions;

    pub(crate) fn rev(n: u32) -> String {
        format!("{n:040}")
    }

    struct FakeRemote {
        tip: String,
        refs: HashMap<String, String>,
    }

    /// In-process stand-in for git: a repository is `.git/HEAD` plus
    /// `.git/origin` holding the url it was cloned from.
    #[derive(Default)]
    pub(crate) struct FakeGit {
        remotes: Mutex<HashMap<String, FakeRemote>>,
        dirty: Mutex<HashSet<PathBuf>>,
        clones: AtomicUsize,
        clone_delay: Option<Duration>,
    }

    impl FakeGit {
        pub(crate) fn with_remote(self, url: &str, tip: &str) -> Self {
            self.set_tip(url, tip);
            self
        }

        pub(crate) fn set_tip(&self, url: &str, tip: &str) {
            self.remotes
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_insert_with(|| FakeRemote {
                    tip: String::new(),
                    refs: HashMap::new(),
                })
                .tip = tip.to_string();
        }

        pub(crate) fn add_ref(&self, url: &str, name: &str, target: &str) {
            self.remotes
                .lock()
                .unwrap()
                .get_mut(url)
                .unwrap()
                .refs
                .insert(name.to_string(), target.to_string());
        }

        fn mark_dirty(&self, path: &Path) {
            self.dirty.lock().unwrap().insert(path.to_path_buf());
        }

        fn resolve(&self, url: &str, revision: Option<&str>) -> Result<String, SyncError> {
            let remotes = self.remotes.lock().unwrap();
            let remote = remotes
                .get(url)
                .ok_or_else(|| SyncError::Network(format!("repository '{url}' not found")))?;
            match revision {
                None => Ok(remote.tip.clone()),
                Some(name) => remote.refs.get(name).cloned().ok_or_else(|| {
                    SyncError::Revision {
                        revision: name.to_string(),
                        message: "unknown revision".into(),
                    }
                }),
            }
        }
    }

    impl GitBackend for FakeGit {
        fn clone_repo(
            &self,
            url: &str,
            dest: &Path,
            revision: Option<&str>,
        ) -> Result<(), SyncError> {
            if let Some(delay) = self.clone_delay {
                thread::sleep(delay);
            }
            self.clones.fetch_add(1, Ordering::SeqCst);

            let target = self.resolve(url, revision)?;
            let git = dest.join(".git");
            fs::create_dir_all(&git).map_err(|err| SyncError::filesystem(dest, err))?;
            fs::write(git.join("HEAD"), &target).map_err(|err| SyncError::filesystem(dest, err))?;
            fs::write(git.join("origin"), url).map_err(|err| SyncError::filesystem(dest, err))
        }

        fn fetch_and_checkout(
            &self,
            dest: &Path,
            revision: Option<&str>,
        ) -> Result<Checkout, SyncError> {
            if self.is_dirty(dest)? {
                return Err(SyncError::DirtyWorktree {
                    path: dest.to_path_buf(),
                });
            }

            let url = fs::read_to_string(dest.join(".git/origin"))
                .map_err(|err| SyncError::filesystem(dest, err))?;
            let from = self.current_revision(dest)?;
            let to = self.resolve(&url, revision)?;
            if from == to {
                return Ok(Checkout::UpToDate { revision: to });
            }

            fs::write(dest.join(".git/HEAD"), &to).map_err(|err| SyncError::filesystem(dest, err))?;
            Ok(Checkout::Changed {
                from: Some(from),
                to,
            })
        }

        fn current_revision(&self, dest: &Path) -> Result<String, SyncError> {
            fs::read_to_string(dest.join(".git/HEAD"))
                .map(|head| head.trim().to_string())
                .map_err(|err| SyncError::filesystem(dest, err))
        }

        fn is_dirty(&self, dest: &Path) -> Result<bool, SyncError> {
            Ok(self.dirty.lock().unwrap().contains(dest))
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        git: Arc<FakeGit>,
        engine: SyncEngine,
        registry: Registry,
    }

    fn fixture(git: FakeGit) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("start");
        let git = Arc::new(git);
        let engine = SyncEngine::new(git.clone()).with_jobs(4);
        let registry = Registry::new(Runtime::new(&root, Arc::new(RecordingHost::default())));
        Fixture {
            _tmp: tmp,
            root,
            git,
            engine,
            registry,
        }
    }

    fn counter() -> (Arc<AtomicUsize>, PluginOptions) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let options = PluginOptions::default().on_sync(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, options)
    }

    fn head(root: &Path, name: &str) -> Option<String> {
        InstallState::entry(root, name).and_then(|entry| entry.current_revision)
    }

    const REPO_A: &str = "https://example/repoA";
    const REPO_B: &str = "https://example/repoB";

    #[test]
    fn install_clones_at_default_tip() {
        let mut fx = fixture(FakeGit::default().with_remote(REPO_A, &rev(1)));
        let (calls, options) = counter();
        let plugin = fx
            .registry
            .register(RepoSpec::with_options(REPO_A, options))
            .unwrap();

        let report = fx.engine.install(&fx.registry);

        assert_eq!(report.results.len(), 1);
        let result = &report.results[0];
        assert!(matches!(result.action, SyncAction::Install(ref spec) if spec.name == "repoA"));
        assert!(result.is_ok());
        assert!(fx.root.join("repoA").is_dir());
        assert_eq!(head(&fx.root, "repoA"), Some(rev(1)));
        assert!(plugin.installed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Nothing left to install.
        assert!(fx.engine.install(&fx.registry).results.is_empty());
    }

    #[test]
    fn one_failed_clone_does_not_block_others() {
        let mut fx = fixture(FakeGit::default().with_remote(REPO_B, &rev(2)));
        fx.registry
            .register(RepoSpec::new("https://invalid.example/broken"))
            .unwrap();
        fx.registry.register(RepoSpec::new(REPO_B)).unwrap();

        let report = fx.engine.install(&fx.registry);

        assert_eq!(report.results.len(), 2);
        assert!(matches!(
            report.get("broken").and_then(SyncResult::error),
            Some(SyncError::Network(_))
        ));
        assert!(report.get("repoB").unwrap().is_ok());
        assert!(!fx.root.join("broken").exists());
        assert_eq!(head(&fx.root, "repoB"), Some(rev(2)));
        assert_eq!(report.summary().failed, 1);
        assert_eq!(report.summary().installed, 1);
    }

    #[test]
    fn unknown_pinned_revision_fails_install() {
        let mut fx = fixture(FakeGit::default().with_remote(REPO_A, &rev(1)));
        fx.registry
            .register(RepoSpec::with_options(
                REPO_A,
                PluginOptions::default().revision("v9"),
            ))
            .unwrap();

        let report = fx.engine.install(&fx.registry);
        assert!(matches!(
            report.results[0].error(),
            Some(SyncError::Revision { .. })
        ));
        assert!(!InstallState::is_installed(&fx.root, "repoA"));
    }

    #[test]
    fn second_update_is_a_no_op() {
        let mut fx = fixture(FakeGit::default().with_remote(REPO_A, &rev(1)));
        let (calls, options) = counter();
        fx.registry
            .register(RepoSpec::with_options(REPO_A, options))
            .unwrap();
        fx.engine.install(&fx.registry);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        fx.git.set_tip(REPO_A, &rev(5));
        let first = fx.engine.update(&fx.registry);
        assert!(matches!(
            &first.results[0].action,
            SyncAction::Update { from, to, .. }
                if from.as_deref() == Some(rev(1).as_str()) && to.as_deref() == Some(rev(5).as_str())
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let second = fx.engine.update(&fx.registry);
        assert_eq!(second.results.len(), 1);
        assert!(matches!(
            second.results[0].action,
            SyncAction::UpToDate { .. }
        ));
        assert!(second.results[0].is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn update_follows_revision_changes() {
        let mut fx = fixture(FakeGit::default().with_remote(REPO_A, &rev(100)));
        fx.git.add_ref(REPO_A, "v1", &rev(1));
        fx.git.add_ref(REPO_A, "v2", &rev(2));
        let (calls, options) = counter();

        fx.registry
            .register(RepoSpec::with_options(REPO_A, options.clone().revision("v1")))
            .unwrap();
        fx.engine.install(&fx.registry);
        assert_eq!(head(&fx.root, "repoA"), Some(rev(1)));

        fx.registry
            .register(RepoSpec::with_options(REPO_A, options.clone().revision("v2")))
            .unwrap();
        let report = fx.engine.update(&fx.registry);
        assert!(matches!(report.results[0].action, SyncAction::Update { .. }));
        assert_eq!(head(&fx.root, "repoA"), Some(rev(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        fx.registry
            .register(RepoSpec::with_options(REPO_A, options))
            .unwrap();
        fx.engine.update(&fx.registry);
        assert_eq!(head(&fx.root, "repoA"), Some(rev(100)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn dirty_worktree_is_left_alone() {
        let mut fx = fixture(FakeGit::default().with_remote(REPO_A, &rev(1)));
        let (calls, options) = counter();
        fx.registry
            .register(RepoSpec::with_options(REPO_A, options))
            .unwrap();
        fx.engine.install(&fx.registry);

        let dest = fx.root.join("repoA");
        fx.git.mark_dirty(&dest);
        fx.git.set_tip(REPO_A, &rev(2));

        let report = fx.engine.update(&fx.registry);
        assert!(matches!(
            report.results[0].error(),
            Some(SyncError::DirtyWorktree { .. })
        ));
        assert!(matches!(
            &report.results[0].action,
            SyncAction::Update { from, to: None, .. } if from.as_deref() == Some(rev(1).as_str())
        ));
        assert_eq!(head(&fx.root, "repoA"), Some(rev(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn update_skips_plugins_that_are_not_installed() {
        let mut fx = fixture(
            FakeGit::default()
                .with_remote(REPO_A, &rev(1))
                .with_remote(REPO_B, &rev(2)),
        );
        fx.registry.register(RepoSpec::new(REPO_A)).unwrap();
        fx.engine.install(&fx.registry);
        fx.registry.register(RepoSpec::new(REPO_B)).unwrap();

        let report = fx.engine.update(&fx.registry);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].action.name(), "repoA");
        assert!(!InstallState::is_installed(&fx.root, "repoB"));
    }

    #[test]
    fn clean_removes_only_unregistered_repositories() {
        let mut fx = fixture(
            FakeGit::default()
                .with_remote(REPO_A, &rev(1))
                .with_remote(REPO_B, &rev(2))
                .with_remote("https://elsewhere/repoA", &rev(3)),
        );
        fx.registry.register(RepoSpec::new(REPO_A)).unwrap();
        fx.registry.register(RepoSpec::new(REPO_B)).unwrap();
        fx.engine.install(&fx.registry);
        fs::create_dir_all(fx.root.join("handmade")).unwrap();

        // Same name, new url: kept. Old name dropped for a new one: removed.
        fx.registry
            .register(RepoSpec::new("https://elsewhere/repoA"))
            .unwrap();
        fx.registry.unregister("repoB");
        fx.registry
            .register(RepoSpec::with_options(
                REPO_B,
                PluginOptions::default().named("renamed"),
            ))
            .unwrap();

        let report = fx.engine.clean(&fx.registry);

        assert_eq!(report.results.len(), 1);
        assert!(matches!(
            &report.results[0].action,
            SyncAction::Remove { name, .. } if name == "repoB"
        ));
        assert!(report.results[0].is_ok());
        assert!(fx.root.join("repoA").exists());
        assert!(!fx.root.join("repoB").exists());
        assert!(fx.root.join("handmade").exists());

        // The rename only lands as an install on the next sync.
        let report = fx.engine.install(&fx.registry);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].action.name(), "renamed");
    }

    #[test]
    fn sync_reports_in_registry_order() {
        let names = ["m", "c", "x", "a", "q", "b"];
        let git = names.iter().fold(FakeGit::default(), |git, name| {
            git.with_remote(&format!("https://example/{name}"), &rev(1))
        });
        let mut fx = fixture(git);
        for name in &names[..3] {
            fx.registry
                .register(RepoSpec::new(format!("https://example/{name}")))
                .unwrap();
        }
        fx.engine.install(&fx.registry);
        for name in &names[3..] {
            fx.registry
                .register(RepoSpec::new(format!("https://example/{name}")))
                .unwrap();
        }

        let report = fx.engine.sync(&fx.registry);

        let order: Vec<&str> = report.results.iter().map(|r| r.action.name()).collect();
        assert_eq!(order, names);
        assert_eq!(report.summary().up_to_date, 3);
        assert_eq!(report.summary().installed, 3);
    }

    #[test]
    fn cancelled_engine_starts_nothing() {
        let mut fx = fixture(FakeGit::default().with_remote(REPO_A, &rev(1)));
        fx.registry.register(RepoSpec::new(REPO_A)).unwrap();
        fx.engine.cancel_token().cancel();

        let report = fx.engine.install(&fx.registry);
        assert_eq!(report.results[0].error(), Some(&SyncError::Cancelled));
        assert_eq!(fx.git.clones.load(Ordering::SeqCst), 0);
        assert!(!InstallState::is_installed(&fx.root, "repoA"));
    }

    #[test]
    fn concurrent_installs_of_one_name_clone_once() {
        let git = FakeGit {
            clone_delay: Some(Duration::from_millis(50)),
            ..FakeGit::default()
        }
        .with_remote(REPO_A, &rev(1));
        let mut fx = fixture(git);
        fx.registry.register(RepoSpec::new(REPO_A)).unwrap();

        let (first, second) = thread::scope(|scope| {
            let a = scope.spawn(|| fx.engine.install(&fx.registry));
            let b = scope.spawn(|| fx.engine.install(&fx.registry));
            (a.join().unwrap(), b.join().unwrap())
        });

        assert_eq!(fx.git.clones.load(Ordering::SeqCst), 1);
        assert!(!first.has_failures());
        assert!(!second.has_failures());
        assert_eq!(
            first.summary().installed + second.summary().installed,
            1
        );
    }

    #[test]
    fn engines_sharing_a_root_clone_once() {
        let git = Arc::new(
            FakeGit {
                clone_delay: Some(Duration::from_millis(50)),
                ..FakeGit::default()
            }
            .with_remote(REPO_A, &rev(1)),
        );
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("start");

        // Separate engines share nothing in memory, like two CLI runs.
        let sides: Vec<(SyncEngine, Registry)> = (0..2)
            .map(|_| {
                let mut registry =
                    Registry::new(Runtime::new(&root, Arc::new(RecordingHost::default())));
                registry.register(RepoSpec::new(REPO_A)).unwrap();
                (SyncEngine::new(git.clone()), registry)
            })
            .collect();

        let reports: Vec<SyncReport> = thread::scope(|scope| {
            let running: Vec<_> = sides
                .iter()
                .map(|(engine, registry)| scope.spawn(move || engine.install(registry)))
                .collect();
            running
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect()
        });

        assert_eq!(git.clones.load(Ordering::SeqCst), 1);
        assert!(reports.iter().all(|report| !report.has_failures()));
        assert_eq!(
            reports
                .iter()
                .map(|report| report.summary().installed)
                .sum::<usize>(),
            1
        );
        assert_eq!(head(&root, "repoA"), Some(rev(1)));
        assert_eq!(InstallState::scan(&root).len(), 1);
    }

    #[test]
    fn panicking_callback_is_contained() {
        let mut fx = fixture(
            FakeGit::default()
                .with_remote(REPO_A, &rev(1))
                .with_remote(REPO_B, &rev(2)),
        );
        fx.registry
            .register(RepoSpec::with_options(
                REPO_A,
                PluginOptions::default().on_sync(|_| panic!("bad hook")),
            ))
            .unwrap();
        fx.registry.register(RepoSpec::new(REPO_B)).unwrap();

        let report = fx.engine.install(&fx.registry);
        assert!(!report.has_failures());
        assert_eq!(report.summary().installed, 2);
    }
}
