//! Call fingerprints: the cache key of one (function, arguments) pair.
//!
//! A fingerprint has two halves. The function half is a relative directory
//! derived from the canonical source path and qualified name, so every
//! function gets its own subtree. The call half is a SHA-256 digest over a
//! canonical JSON envelope of the path, name, definition text and the
//! non-path arguments.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use freshen_common::Digest;
use serde_json::{json, Value};

use crate::args::{ArgRole, CallArgs};
use crate::classify::trackable_paths;
use crate::error::{CodecError, MemoError};
use crate::source::SourceLocatable;

/// Bump when the envelope layout changes so old entries stop matching.
const ENVELOPE_VERSION: u32 = 1;

/// Deterministic identity of a call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    function_dir: PathBuf,
    digest: Digest,
}

impl Fingerprint {
    /// Builds the fingerprint of calling `source` with `args`.
    pub fn build(source: &impl SourceLocatable, args: &CallArgs) -> Result<Self, MemoError> {
        let deps = trackable_paths(args);
        Self::from_parts(source, args, &deps)
    }

    /// Builds a fingerprint from arguments that were already classified.
    ///
    /// Arguments whose role appears in `deps` are encoded as a bare
    /// dependency marker: their freshness lives in the snapshot, not here.
    /// Fails if any argument was refused when it was added.
    pub fn from_parts(
        source: &impl SourceLocatable,
        args: &CallArgs,
        deps: &[(ArgRole, PathBuf)],
    ) -> Result<Self, MemoError> {
        args.validate()?;
        if source.source_text().trim().is_empty() {
            return Err(MemoError::SourceUnavailable {
                name: source.qualified_name().to_string(),
                path: source.source_path().to_path_buf(),
                reason: "empty source text".to_string(),
            });
        }

        let is_dep = |role: &ArgRole| deps.iter().any(|(r, _)| r == role);
        let encode = |role: ArgRole, value: &Value| {
            if is_dep(&role) {
                json!(["dependency"])
            } else {
                json!(["value", value])
            }
        };

        let positional: Vec<Value> = args
            .positional()
            .iter()
            .enumerate()
            .map(|(i, v)| encode(ArgRole::Positional(i), v))
            .collect();
        let keyword: serde_json::Map<String, Value> = args
            .keyword()
            .iter()
            .map(|(k, v)| (k.clone(), encode(ArgRole::Keyword(k.clone()), v)))
            .collect();

        let envelope = json!({
            "version": ENVELOPE_VERSION,
            "path": source.source_path().to_string_lossy(),
            "name": source.qualified_name(),
            "source": source.source_text(),
            "args": {
                "positional": positional,
                "keyword": keyword,
            },
        });
        let bytes = serde_json::to_vec(&envelope).map_err(|e| {
            MemoError::Serialization(CodecError::Encode {
                reason: e.to_string(),
            })
        })?;

        Ok(Self {
            function_dir: function_subpath(source),
            digest: Digest::of(&bytes),
        })
    }

    /// Relative directory shared by every call of the same function.
    pub fn function_dir(&self) -> &Path {
        &self.function_dir
    }

    /// Digest of the definition text and non-path arguments.
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Relative directory of this call's cache entry.
    pub fn entry_subpath(&self) -> PathBuf {
        self.function_dir.join(self.digest.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.function_dir.display(), self.digest)
    }
}

/// Returns the relative storage subpath of a function:
/// `<canonical source path without root>/<qualified name>`.
///
/// `::` becomes `.` and any character that is awkward in a file name becomes
/// `_`. Two names that sanitize alike still get distinct entries because the
/// digest covers the unsanitized name.
pub fn function_subpath(source: &impl SourceLocatable) -> PathBuf {
    let mut subpath = PathBuf::new();
    for component in source.source_path().components() {
        match component {
            Component::Normal(part) => subpath.push(sanitize(&part.to_string_lossy())),
            Component::Prefix(prefix) => {
                subpath.push(sanitize(&prefix.as_os_str().to_string_lossy()))
            }
            Component::RootDir | Component::CurDir | Component::ParentDir => {}
        }
    }
    subpath.push(sanitize(&source.qualified_name().replace("::", ".")));
    subpath
}

fn sanitize(part: &str) -> String {
    let cleaned: String = part
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        cleaned.replace('.', "_")
    } else {
        cleaned
    }
}
