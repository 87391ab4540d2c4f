use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// A plugin directory found under the install root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledEntry {
    pub name: String,
    pub path: PathBuf,
    /// `None` when HEAD could not be resolved (empty repo, broken refs).
    pub current_revision: Option<String>,
}

/// Read-only view of what is on disk under the install root.
///
/// Nothing here is cached: the directory tree is the source of truth for
/// "installed", so every query goes back to it.
pub struct InstallState;

impl InstallState {
    /// One entry per immediate subdirectory that holds a git repository.
    ///
    /// Plain files, non-repository directories, dot-prefixed entries (lock
    /// files, clones in progress) and a missing root are all silently skipped.
    pub fn scan(root: &Path) -> BTreeMap<String, InstalledEntry> {
        let Ok(read_dir) = fs::read_dir(root) else {
            return BTreeMap::new();
        };

        read_dir
            .filter_map(Result::ok)
            .filter_map(|dir_entry| {
                let name = dir_entry.file_name().to_str()?.to_string();
                if name.starts_with('.') {
                    return None;
                }
                Self::entry(root, &name).map(|entry| (name, entry))
            })
            .collect()
    }

    pub fn entry(root: &Path, name: &str) -> Option<InstalledEntry> {
        let path = root.join(name);
        if !path.is_dir() {
            return None;
        }

        let git_dir = git_dir(&path)?;
        Some(InstalledEntry {
            name: name.to_string(),
            current_revision: read_head(&git_dir),
            path,
        })
    }

    pub fn is_installed(root: &Path, name: &str) -> bool {
        Self::entry(root, name).is_some()
    }
}

/// Locates the git directory for a working tree: either `.git/` itself or
/// the target of a `gitdir:` file (worktrees, submodules).
pub fn git_dir(worktree: &Path) -> Option<PathBuf> {
    let marker = worktree.join(".git");
    if marker.is_dir() {
        return marker.join("HEAD").is_file().then_some(marker);
    }

    let contents = fs::read_to_string(&marker).ok()?;
    let target = contents.strip_prefix("gitdir:")?.trim();
    let target = worktree.join(target);
    target.join("HEAD").is_file().then_some(target)
}

/// Resolves HEAD to a commit id from loose refs or `packed-refs`.
fn read_head(git_dir: &Path) -> Option<String> {
    let head = fs::read_to_string(git_dir.join("HEAD")).ok()?;
    let head = head.trim();

    let Some(reference) = head.strip_prefix("ref:") else {
        return is_object_id(head).then(|| head.to_string());
    };
    let reference = reference.trim();

    // Linked worktrees keep branch refs in the common dir.
    let common_dir = fs::read_to_string(git_dir.join("commondir"))
        .ok()
        .map(|dir| git_dir.join(dir.trim()))
        .unwrap_or_else(|| git_dir.to_path_buf());

    for dir in [git_dir, common_dir.as_path()] {
        if let Ok(loose) = fs::read_to_string(dir.join(reference)) {
            let loose = loose.trim();
            if is_object_id(loose) {
                return Some(loose.to_string());
            }
        }
    }

    let packed = fs::read_to_string(common_dir.join("packed-refs")).ok()?;
    packed
        .lines()
        .filter(|line| !line.starts_with('#') && !line.starts_with('^'))
        .filter_map(|line| line.split_once(' '))
        .find(|(_, name)| *name == reference)
        .map(|(id, _)| id.to_string())
}

fn is_object_id(text: &str) -> bool {
    matches!(text.len(), 40 | 64) && text.bytes().all(|b| b.is_ascii_hexdigit())
}
