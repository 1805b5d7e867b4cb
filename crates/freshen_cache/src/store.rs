//! On-disk cache entries.
//!
//! Every fingerprint owns one directory,
//! `<cache_dir>/<function subpath>/<digest>/`, holding:
//!
//! - `payload`, written by the injected codec, and
//! - `entry.meta`, a bincode [`EntryHeader`] with magic bytes, format
//!   version, the dependency snapshot, and a checksum of `payload`.
//!
//! A commit first removes the old header, stages the payload under a
//! `.partial` name, renames it into place, then stages and renames the new
//! header. Renaming the header is the commit point: a reader that finds a
//! header whose checksum matches the payload is looking at a complete entry.

use std::fs;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::path::{Path, PathBuf};

use freshen_common::ContentHash;
use freshen_config::CacheConfig;
use serde::{Deserialize, Serialize};

use crate::codec::{ItemWriter, ScalarCodec, SequenceCodec};
use crate::error::MemoError;
use crate::fingerprint::{function_subpath, Fingerprint};
use crate::snapshot::Snapshot;
use crate::source::SourceLocatable;

/// Magic bytes identifying a freshen entry header.
const ENTRY_MAGIC: [u8; 4] = *b"FRSH";

/// Current entry format version. Increment on breaking changes to the header.
const ENTRY_FORMAT_VERSION: u32 = 1;

/// File name of the entry header.
const HEADER_FILE: &str = "entry.meta";

/// File name of the entry payload.
const PAYLOAD_FILE: &str = "payload";

/// Extension of files that are still being written.
const PARTIAL_EXT: &str = "partial";

/// Distinguishes concurrent writers of one entry within a process.
static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Whether an entry holds one value or a sequence of items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// A single result value.
    Scalar,
    /// An ordered sequence of items.
    Sequence,
}

/// Header stored next to every payload for validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryHeader {
    /// Magic bytes: must be `b"FRSH"`.
    pub magic: [u8; 4],

    /// Entry format version.
    pub format_version: u32,

    /// Crate version that wrote the entry.
    pub freshen_version: String,

    /// Shape of the payload.
    pub kind: EntryKind,

    /// Dependency state recorded when the entry was written.
    pub snapshot: Snapshot,

    /// Content hash of the payload file.
    pub checksum: ContentHash,
}

/// A present, validated entry.
#[derive(Debug, Clone)]
pub struct CachedEntry {
    /// Location of the payload, ready for the codec to read.
    pub payload: PathBuf,

    /// Snapshot recorded at commit time.
    pub snapshot: Snapshot,
}

/// Maps fingerprints to entry directories and reads/writes entries.
#[derive(Debug, Clone)]
pub struct CacheStore {
    cache_dir: PathBuf,
}

impl CacheStore {
    /// Creates a store rooted at the configured cache directory.
    ///
    /// Nothing is created on disk until the first commit.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            cache_dir: config.cache_dir.clone(),
        }
    }

    /// Root cache directory.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Directory holding every entry of the function described by `source`.
    ///
    /// Removing it deletes that function's whole cache.
    pub fn function_dir(&self, source: &impl SourceLocatable) -> PathBuf {
        self.cache_dir.join(function_subpath(source))
    }

    /// Directory of the entry for `fingerprint`.
    pub fn entry_dir(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.cache_dir.join(fingerprint.entry_subpath())
    }

    /// Looks up a valid entry of the given kind.
    ///
    /// Returns `None` if the entry is absent, unreadable, from another format
    /// or crate version, of another kind, or its payload fails the checksum.
    /// Absence is a normal miss, never an error.
    pub fn lookup(&self, fingerprint: &Fingerprint, kind: EntryKind) -> Option<CachedEntry> {
        let dir = self.entry_dir(fingerprint);
        match load_entry(&dir, kind) {
            Ok(entry) => Some(entry),
            Err(MemoError::Storage { source, .. }) if source.kind() == ErrorKind::NotFound => {
                tracing::debug!(entry = %fingerprint, "no cache entry");
                None
            }
            Err(e) => {
                tracing::debug!(entry = %fingerprint, error = %e, "discarding unusable cache entry");
                None
            }
        }
    }

    /// Starts replacing the entry for `fingerprint`.
    ///
    /// Creates the entry directory if needed and invalidates any existing
    /// entry, so until [`PendingEntry::commit`] succeeds the fingerprint reads
    /// as a miss.
    pub fn begin(&self, fingerprint: &Fingerprint, kind: EntryKind) -> Result<PendingEntry, MemoError> {
        let dir = self.entry_dir(fingerprint);
        fs::create_dir_all(&dir).map_err(MemoError::storage(&dir))?;

        let header = dir.join(HEADER_FILE);
        match fs::remove_file(&header) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(MemoError::storage(&header)(e)),
        }

        let tag = format!(
            "{}-{}",
            std::process::id(),
            STAGING_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let staging = dir.join(format!("{PAYLOAD_FILE}.{tag}.{PARTIAL_EXT}"));
        Ok(PendingEntry {
            dir,
            kind,
            staging,
            tag,
            committed: false,
        })
    }

    /// Writes `value` as the scalar entry for `fingerprint`.
    pub fn commit<T, C>(
        &self,
        fingerprint: &Fingerprint,
        value: &T,
        snapshot: &Snapshot,
        codec: &C,
    ) -> Result<(), MemoError>
    where
        C: ScalarCodec<T>,
    {
        let pending = self.begin(fingerprint, EntryKind::Scalar)?;
        codec.write(value, pending.staging_path())?;
        pending.commit(snapshot)?;
        tracing::debug!(entry = %fingerprint, "committed cache entry");
        Ok(())
    }

    /// Opens a recorder that writes the sequence entry for `fingerprint` item
    /// by item.
    pub fn record<T, C>(
        &self,
        fingerprint: &Fingerprint,
        codec: &C,
    ) -> Result<SequenceRecorder<C::Writer>, MemoError>
    where
        C: SequenceCodec<T>,
    {
        let pending = self.begin(fingerprint, EntryKind::Sequence)?;
        let writer = codec.writer(pending.staging_path())?;
        Ok(SequenceRecorder {
            writer,
            pending,
            label: fingerprint.to_string(),
        })
    }

    /// Deletes every entry of the function described by `source`.
    ///
    /// Returns `false` if the function had no cache directory. This is an
    /// explicit operator action; the store never deletes entries on its own.
    pub fn clear_function(&self, source: &impl SourceLocatable) -> Result<bool, MemoError> {
        let dir = self.function_dir(source);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(MemoError::storage(&dir)(e)),
        }
    }
}

fn load_entry(dir: &Path, kind: EntryKind) -> Result<CachedEntry, MemoError> {
    let header_path = dir.join(HEADER_FILE);
    let raw = fs::read(&header_path).map_err(MemoError::storage(&header_path))?;

    let invalid = |reason: String| MemoError::InvalidHeader {
        path: header_path.clone(),
        reason,
    };
    let (header, _): (EntryHeader, usize) =
        bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| invalid(e.to_string()))?;

    if header.magic != ENTRY_MAGIC {
        return Err(invalid("bad magic bytes".to_string()));
    }
    if header.format_version != ENTRY_FORMAT_VERSION {
        return Err(invalid(format!(
            "format version {} (expected {ENTRY_FORMAT_VERSION})",
            header.format_version
        )));
    }
    if header.freshen_version != env!("CARGO_PKG_VERSION") {
        return Err(invalid(format!("written by freshen {}", header.freshen_version)));
    }
    if header.kind != kind {
        return Err(invalid(format!("holds a {:?} entry", header.kind)));
    }

    let payload = dir.join(PAYLOAD_FILE);
    let actual = checksum(&payload)?;
    if actual != header.checksum {
        return Err(MemoError::ChecksumMismatch {
            path: payload,
            expected: header.checksum.to_string(),
            actual: actual.to_string(),
        });
    }

    Ok(CachedEntry {
        payload,
        snapshot: header.snapshot,
    })
}

fn checksum(path: &Path) -> Result<ContentHash, MemoError> {
    let file = fs::File::open(path).map_err(MemoError::storage(path))?;
    ContentHash::from_reader(std::io::BufReader::new(file)).map_err(MemoError::storage(path))
}

/// An entry being written. Dropping it without committing deletes the
/// staged payload and leaves the fingerprint as a miss.
#[derive(Debug)]
pub struct PendingEntry {
    dir: PathBuf,
    kind: EntryKind,
    staging: PathBuf,
    tag: String,
    committed: bool,
}

impl PendingEntry {
    /// Where the codec must write the payload.
    pub fn staging_path(&self) -> &Path {
        &self.staging
    }

    /// Publishes the staged payload together with `snapshot`.
    pub fn commit(mut self, snapshot: &Snapshot) -> Result<(), MemoError> {
        let checksum = checksum(&self.staging)?;
        let payload = self.dir.join(PAYLOAD_FILE);
        fs::rename(&self.staging, &payload).map_err(MemoError::storage(&payload))?;
        self.committed = true;

        let header = EntryHeader {
            magic: ENTRY_MAGIC,
            format_version: ENTRY_FORMAT_VERSION,
            freshen_version: env!("CARGO_PKG_VERSION").to_string(),
            kind: self.kind,
            snapshot: snapshot.clone(),
            checksum,
        };
        let bytes = bincode::serde::encode_to_vec(&header, bincode::config::standard()).map_err(
            |e| MemoError::InvalidHeader {
                path: self.dir.join(HEADER_FILE),
                reason: e.to_string(),
            },
        )?;

        let staged_header = self
            .dir
            .join(format!("{HEADER_FILE}.{}.{PARTIAL_EXT}", self.tag));
        let final_header = self.dir.join(HEADER_FILE);
        fs::write(&staged_header, &bytes).map_err(MemoError::storage(&staged_header))?;
        fs::rename(&staged_header, &final_header).map_err(MemoError::storage(&final_header))
    }
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.staging);
        }
    }
}

/// Writes a sequence entry one item at a time.
///
/// Only [`SequenceRecorder::finish`] publishes the entry; a recorder that is
/// dropped early leaves no entry behind.
pub struct SequenceRecorder<W> {
    // declared before `pending` so the file closes before the staged path is removed
    writer: W,
    pending: PendingEntry,
    label: String,
}

impl<W> SequenceRecorder<W> {
    /// Appends one item to the staged payload.
    pub fn push<T>(&mut self, item: &T) -> Result<(), MemoError>
    where
        W: ItemWriter<T>,
    {
        self.writer.push(item).map_err(MemoError::from)
    }

    /// Flushes the payload and commits the entry with `snapshot`.
    pub fn finish<T>(self, snapshot: &Snapshot) -> Result<(), MemoError>
    where
        W: ItemWriter<T>,
    {
        let Self {
            writer,
            pending,
            label,
        } = self;
        writer.finish()?;
        pending.commit(snapshot)?;
        tracing::debug!(entry = %label, "committed sequence entry");
        Ok(())
    }
}
