//! Dependency snapshots: modification times of everything a call depends on.
//!
//! A snapshot always records the wrapped function's own source file and one
//! entry per path-valued argument. Freshness is decided by [`Snapshot::matches`]:
//! exact agreement on every entry, and no entry that could not be read.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::args::{ArgRole, CallArgs};
use crate::classify::trackable_paths;
use crate::error::MemoError;
use crate::source::SourceLocatable;

/// Identity of one dependency within a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DependencyId {
    /// The file that defines the wrapped function.
    Source,
    /// A path-valued argument, by role.
    Argument(ArgRole),
}

/// What was observed for one dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stamp {
    /// The file's last modification time.
    Modified {
        /// Resolved path of the file.
        path: PathBuf,
        /// Modification time at capture.
        mtime: SystemTime,
    },
    /// The file's metadata could not be read.
    Unreadable {
        /// Path as classified.
        path: PathBuf,
        /// Description of the failure.
        reason: String,
    },
}

/// Modification times of a call's dependencies at one moment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    entries: BTreeMap<DependencyId, Stamp>,
}

impl Snapshot {
    /// Captures the current snapshot for calling `source` with `args`.
    pub fn capture(source: &impl SourceLocatable, args: &CallArgs) -> Self {
        let deps = trackable_paths(args);
        Self::from_parts(source, &deps)
    }

    /// Captures a snapshot from arguments that were already classified.
    pub fn from_parts(source: &impl SourceLocatable, deps: &[(ArgRole, PathBuf)]) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(DependencyId::Source, stamp(source.source_path()));
        for (role, path) in deps {
            entries.insert(DependencyId::Argument(role.clone()), stamp(path));
        }
        Self { entries }
    }

    /// Returns `true` if `self` and `other` prove the same dependency state.
    ///
    /// Both snapshots must list the same dependencies with equal paths and
    /// modification times. An unreadable entry on either side never matches.
    pub fn matches(&self, other: &Snapshot) -> bool {
        self.entries.len() == other.entries.len()
            && self.entries.iter().all(|(id, mine)| match (mine, other.entries.get(id)) {
                (
                    Stamp::Modified { path, mtime },
                    Some(Stamp::Modified {
                        path: other_path,
                        mtime: other_mtime,
                    }),
                ) => path == other_path && mtime == other_mtime,
                _ => false,
            })
    }

    /// Returns the stamp recorded for `id`.
    pub fn get(&self, id: &DependencyId) -> Option<&Stamp> {
        self.entries.get(id)
    }

    /// Iterates over entries in dependency order (source first).
    pub fn iter(&self) -> impl Iterator<Item = (&DependencyId, &Stamp)> {
        self.entries.iter()
    }

    /// Number of recorded dependencies, including the source file.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lists every dependency that could not be read.
    pub fn unreadable(&self) -> Vec<MemoError> {
        self.entries
            .values()
            .filter_map(|stamp| match stamp {
                Stamp::Unreadable { path, reason } => Some(MemoError::DependencyUnreadable {
                    path: path.clone(),
                    reason: reason.clone(),
                }),
                Stamp::Modified { .. } => None,
            })
            .collect()
    }
}

fn stamp(path: &Path) -> Stamp {
    let observed = std::fs::canonicalize(path).and_then(|resolved| {
        let mtime = std::fs::metadata(&resolved)?.modified()?;
        Ok((resolved, mtime))
    });
    match observed {
        Ok((path, mtime)) => Stamp::Modified { path, mtime },
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "dependency unreadable, forcing a miss");
            Stamp::Unreadable {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FunctionSource;
    use std::time::Duration;

    fn touch(path: &Path, mtime: SystemTime) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(mtime).unwrap();
    }

    fn fixture() -> (tempfile::TempDir, FunctionSource, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("lib.rs");
        std::fs::write(&src_path, "fn f() {}").unwrap();
        let data = dir.path().join("data.txt");
        std::fs::write(&data, "payload").unwrap();
        let source = FunctionSource::new(&src_path, "demo::f", "fn f() {}").unwrap();
        (dir, source, data)
    }

    #[test]
    fn always_records_source_file() {
        let (_dir, source, _) = fixture();
        let snap = Snapshot::capture(&source, &CallArgs::new().arg(5));
        assert_eq!(snap.len(), 1);
        assert!(matches!(
            snap.get(&DependencyId::Source),
            Some(Stamp::Modified { .. })
        ));
    }

    #[test]
    fn records_positional_and_keyword_paths() {
        let (_dir, source, data) = fixture();
        let data = data.to_str().unwrap();
        let snap = Snapshot::capture(&source, &CallArgs::new().arg(data).kwarg("extra", data));
        assert_eq!(snap.len(), 3);
        assert!(snap
            .get(&DependencyId::Argument(ArgRole::Positional(0)))
            .is_some());
        assert!(snap
            .get(&DependencyId::Argument(ArgRole::Keyword("extra".to_string())))
            .is_some());
    }

    #[test]
    fn unchanged_files_match() {
        let (_dir, source, data) = fixture();
        let args = CallArgs::new().arg(data.to_str().unwrap());
        let a = Snapshot::capture(&source, &args);
        let b = Snapshot::capture(&source, &args);
        assert!(a.matches(&b));
    }

    #[test]
    fn touched_argument_does_not_match() {
        let (_dir, source, data) = fixture();
        let args = CallArgs::new().arg(data.to_str().unwrap());
        let before = Snapshot::capture(&source, &args);
        touch(&data, SystemTime::now() + Duration::from_secs(10));
        let after = Snapshot::capture(&source, &args);
        assert!(!before.matches(&after));
    }

    #[test]
    fn touched_source_does_not_match() {
        let (_dir, source, _) = fixture();
        let args = CallArgs::new();
        let before = Snapshot::capture(&source, &args);
        touch(source.source_path(), SystemTime::now() + Duration::from_secs(10));
        let after = Snapshot::capture(&source, &args);
        assert!(!before.matches(&after));
    }

    #[test]
    fn extra_entry_does_not_match() {
        let (_dir, source, data) = fixture();
        let without = Snapshot::capture(&source, &CallArgs::new());
        let with = Snapshot::capture(&source, &CallArgs::new().arg(data.to_str().unwrap()));
        assert!(!without.matches(&with));
        assert!(!with.matches(&without));
    }

    #[test]
    fn different_file_in_same_role_does_not_match() {
        let (dir, source, data) = fixture();
        let other = dir.path().join("other.txt");
        std::fs::write(&other, "other").unwrap();
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        touch(&data, mtime);
        touch(&other, mtime);

        let a = Snapshot::capture(&source, &CallArgs::new().arg(data.to_str().unwrap()));
        let b = Snapshot::capture(&source, &CallArgs::new().arg(other.to_str().unwrap()));
        assert!(!a.matches(&b));
    }

    #[test]
    fn unreadable_dependency_never_matches() {
        let (_dir, source, data) = fixture();
        let deps = vec![(ArgRole::Positional(0), data.clone())];
        std::fs::remove_file(&data).unwrap();

        let a = Snapshot::from_parts(&source, &deps);
        let b = Snapshot::from_parts(&source, &deps);
        assert!(!a.matches(&b));
        assert!(!a.matches(&a));

        let errors = a.unreadable();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], MemoError::DependencyUnreadable { .. }));
    }

    #[test]
    fn serde_roundtrip_preserves_matching() {
        let (_dir, source, data) = fixture();
        let snap = Snapshot::capture(&source, &CallArgs::new().kwarg("p", data.to_str().unwrap()));
        let bytes = bincode::serde::encode_to_vec(&snap, bincode::config::standard()).unwrap();
        let (back, _): (Snapshot, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert!(snap.matches(&back));
    }
}
