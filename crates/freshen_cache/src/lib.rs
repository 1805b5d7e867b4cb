//! Transparent, persistent memoization of functions.
//!
//! A wrapped function is keyed by its own source text and by its non-path
//! arguments. Arguments naming existing files are tracked by modification
//! time instead of by value, together with the file that defines the
//! function, so editing an input file or the function itself invalidates the
//! stored result on the next call.
//!
//! [`CachedFn`] wraps functions returning a single value. [`CachedIter`]
//! wraps functions producing a sequence, streaming items to the caller while
//! recording them, and replaying them lazily on later calls.
//!
//! Results are stored under `<cache_dir>/<function path>/<digest>/` as a
//! payload file plus a checksummed header that is written last, so an
//! interrupted write never leaves an entry that looks valid.

#![warn(missing_docs)]

pub mod args;
pub mod classify;
pub mod codec;
pub mod error;
pub mod fingerprint;
mod probe;
pub mod scalar;
pub mod sequence;
pub mod snapshot;
pub mod source;
pub mod store;

pub use args::{ArgRole, CallArgs};
pub use classify::{classify, trackable_paths};
pub use codec::{
    BincodeCodec, FnCodec, ItemStream, ItemWriter, JsonCodec, ScalarCodec, SequenceCodec,
};
pub use error::{CodecError, MemoError};
pub use fingerprint::{function_subpath, Fingerprint};
pub use freshen_config::CacheConfig;
pub use probe::Outcome;
pub use scalar::{BoxError, CachedFn};
pub use sequence::{CachedIter, Replay};
pub use snapshot::{DependencyId, Snapshot, Stamp};
pub use source::{func_path, FunctionSource, SourceLocatable};
pub use store::{CacheStore, CachedEntry, EntryKind, PendingEntry, SequenceRecorder};
