//! The staleness check shared by both memoizers.

use std::path::PathBuf;

use crate::args::{ArgRole, CallArgs};
use crate::classify::trackable_paths;
use crate::error::MemoError;
use crate::fingerprint::Fingerprint;
use crate::snapshot::Snapshot;
use crate::source::SourceLocatable;
use crate::store::{CacheStore, EntryKind};

/// Whether a call was served from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A fresh entry was found; the wrapped function did not run.
    Hit,
    /// The wrapped function ran.
    Miss,
}

/// Result of fingerprinting a call and checking its entry.
pub(crate) struct Probe {
    pub fingerprint: Fingerprint,
    /// Path-valued arguments, classified once per call.
    pub deps: Vec<(ArgRole, PathBuf)>,
    /// Payload of a fresh entry, if any.
    pub fresh: Option<PathBuf>,
}

impl Probe {
    pub fn run<S: SourceLocatable>(
        store: &CacheStore,
        source: &S,
        args: &CallArgs,
        kind: EntryKind,
    ) -> Result<Self, MemoError> {
        let deps = trackable_paths(args);
        let fingerprint = Fingerprint::from_parts(source, args, &deps)?;
        let current = Snapshot::from_parts(source, &deps);

        let fresh = match store.lookup(&fingerprint, kind) {
            Some(entry) if entry.snapshot.matches(&current) => Some(entry.payload),
            Some(_) => {
                tracing::debug!(entry = %fingerprint, "cache entry is stale");
                None
            }
            None => None,
        };

        Ok(Self {
            fingerprint,
            deps,
            fresh,
        })
    }

    /// Snapshot to store with a freshly computed result.
    ///
    /// Taken after the wrapped function ran, from the same classified
    /// arguments; the call is assumed not to modify its own inputs.
    pub fn commit_snapshot<S: SourceLocatable>(&self, source: &S) -> Snapshot {
        Snapshot::from_parts(source, &self.deps)
    }
}
