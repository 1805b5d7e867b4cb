//! Memoization of single-valued functions.

use std::sync::Arc;

use freshen_config::CacheConfig;

use crate::args::CallArgs;
use crate::codec::{BincodeCodec, ScalarCodec};
use crate::error::MemoError;
use crate::probe::{Outcome, Probe};
use crate::source::{FunctionSource, SourceLocatable};
use crate::store::{CacheStore, EntryKind};

/// Error type accepted from wrapped functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A function wrapped with a persistent, staleness-checked cache.
///
/// On every call the wrapper fingerprints the function source and the
/// non-path arguments, snapshots the modification times of the source file
/// and any path arguments, and returns the stored result only when the stored
/// snapshot matches. Otherwise the function runs and its result replaces the
/// entry.
///
/// ```ignore
/// let config = CacheConfig::new("/var/cache/app");
/// let load = CachedFn::new(config, source_of!(read_report)?, read_report);
/// let report: String = load.call(&CallArgs::new().arg("report.csv"))?;
/// ```
pub struct CachedFn<F, S = FunctionSource, C = BincodeCodec> {
    config: Arc<CacheConfig>,
    store: CacheStore,
    source: S,
    func: F,
    codec: C,
}

impl<F, S: SourceLocatable> CachedFn<F, S, BincodeCodec> {
    /// Wraps `func`, described by `source`, using the default codec.
    pub fn new(config: impl Into<Arc<CacheConfig>>, source: S, func: F) -> Self {
        let config = config.into();
        Self {
            store: CacheStore::new(&config),
            config,
            source,
            func,
            codec: BincodeCodec,
        }
    }
}

impl<F, S: SourceLocatable, C> CachedFn<F, S, C> {
    /// Replaces the serializer pair used for results.
    pub fn with_codec<C2>(self, codec: C2) -> CachedFn<F, S, C2> {
        CachedFn {
            config: self.config,
            store: self.store,
            source: self.source,
            func: self.func,
            codec,
        }
    }

    /// Configuration this wrapper was created with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Source description of the wrapped function.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// The underlying entry store.
    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Calls the wrapped function through the cache.
    pub fn call<T, E>(&self, args: &CallArgs) -> Result<T, MemoError>
    where
        F: Fn(&CallArgs) -> Result<T, E>,
        E: Into<BoxError>,
        C: ScalarCodec<T>,
    {
        self.call_traced(args).map(|(value, _)| value)
    }

    /// Like [`CachedFn::call`], also reporting whether the cache was hit.
    pub fn call_traced<T, E>(&self, args: &CallArgs) -> Result<(T, Outcome), MemoError>
    where
        F: Fn(&CallArgs) -> Result<T, E>,
        E: Into<BoxError>,
        C: ScalarCodec<T>,
    {
        let probe = Probe::run(&self.store, &self.source, args, EntryKind::Scalar)?;

        if let Some(payload) = &probe.fresh {
            match self.codec.read(payload).map_err(MemoError::from) {
                Ok(value) => {
                    tracing::debug!(entry = %probe.fingerprint, "cache hit");
                    return Ok((value, Outcome::Hit));
                }
                Err(e) if e.is_storage() => {
                    tracing::debug!(entry = %probe.fingerprint, error = %e, "payload unreadable, recomputing");
                }
                Err(e) => return Err(e),
            }
        }

        tracing::debug!(entry = %probe.fingerprint, "cache miss");
        let value = (self.func)(args).map_err(|e| MemoError::Function(e.into()))?;

        let snapshot = probe.commit_snapshot(&self.source);
        match self
            .store
            .commit(&probe.fingerprint, &value, &snapshot, &self.codec)
        {
            Ok(()) => {}
            Err(e) if e.is_storage() => {
                tracing::warn!(entry = %probe.fingerprint, error = %e, "failed to persist result");
            }
            Err(e) => return Err(e),
        }
        Ok((value, Outcome::Miss))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::error::CodecError;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        dir: tempfile::TempDir,
        source: FunctionSource,
        config: CacheConfig,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("double.rs");
        std::fs::write(&src, "fn double(x: i64) -> i64 { x * 2 }\n").unwrap();
        let source = FunctionSource::locate(&src, "demo::double").unwrap();
        let config = CacheConfig::new(dir.path().join("cache"));
        Fixture { dir, source, config }
    }

    #[test]
    fn second_call_is_a_hit() {
        let fx = fixture();
        let runs = AtomicUsize::new(0);
        let double = CachedFn::new(fx.config.clone(), fx.source.clone(), |args: &CallArgs| {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>(args.i64_at(0).unwrap_or(0) * 2)
        });

        let args = CallArgs::new().arg(21);
        assert_eq!(double.call_traced(&args).unwrap(), (42, Outcome::Miss));
        assert_eq!(double.call_traced(&args).unwrap(), (42, Outcome::Hit));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn function_error_is_not_cached() {
        let fx = fixture();
        let runs = AtomicUsize::new(0);
        let failing = CachedFn::new(fx.config.clone(), fx.source.clone(), |_: &CallArgs| {
            runs.fetch_add(1, Ordering::SeqCst);
            Err::<i64, _>(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
        });

        let args = CallArgs::new().arg(1);
        assert!(matches!(failing.call(&args), Err(MemoError::Function(_))));
        assert!(matches!(failing.call(&args), Err(MemoError::Function(_))));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn non_finite_arguments_never_share_an_entry() {
        let fx = fixture();
        let runs = AtomicUsize::new(0);
        let echo = CachedFn::new(fx.config.clone(), fx.source.clone(), |args: &CallArgs| {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>(args.get(0).cloned())
        })
        .with_codec(JsonCodec);

        assert_eq!(echo.call_traced(&CallArgs::new().arg(())).unwrap().1, Outcome::Miss);
        for v in [f64::INFINITY, f64::NEG_INFINITY, f64::NAN] {
            let result = echo.call::<Option<serde_json::Value>, _>(&CallArgs::new().arg(v));
            assert!(matches!(result, Err(MemoError::Serialization(_))), "{v}");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unwritable_cache_still_returns_value() {
        let fx = fixture();
        // a regular file where the cache directory should be
        let blocker = fx.dir.path().join("blocked");
        std::fs::write(&blocker, "not a directory").unwrap();
        let double = CachedFn::new(CacheConfig::new(&blocker), fx.source.clone(), |args: &CallArgs| {
            Ok::<_, std::io::Error>(args.i64_at(0).unwrap_or(0) * 2)
        });

        let args = CallArgs::new().arg(4);
        assert_eq!(double.call_traced(&args).unwrap(), (8, Outcome::Miss));
        assert_eq!(double.call_traced(&args).unwrap(), (8, Outcome::Miss));
    }

    #[test]
    fn corrupt_payload_decode_error_propagates() {
        let fx = fixture();
        let codec = crate::codec::FnCodec::new(
            |value: &i64, path: &Path| {
                std::fs::write(path, value.to_string()).map_err(CodecError::from_io(path))
            },
            |path: &Path| {
                Err::<i64, _>(CodecError::Decode {
                    path: path.to_path_buf(),
                    reason: "refusing to decode".to_string(),
                })
            },
        );
        let double = CachedFn::new(fx.config.clone(), fx.source.clone(), |args: &CallArgs| {
            Ok::<_, std::io::Error>(args.i64_at(0).unwrap_or(0) * 2)
        })
        .with_codec(codec);

        let args = CallArgs::new().arg(3);
        assert_eq!(double.call(&args).unwrap(), 6);
        assert!(matches!(double.call(&args), Err(MemoError::Serialization(_))));
    }

    #[test]
    fn json_codec_override() {
        let fx = fixture();
        let greet = CachedFn::new(fx.config.clone(), fx.source.clone(), |args: &CallArgs| {
            Ok::<_, std::io::Error>(format!("hello {}", args.str_at(0).unwrap_or("?")))
        })
        .with_codec(JsonCodec);

        let args = CallArgs::new().arg("world");
        assert_eq!(greet.call(&args).unwrap(), "hello world");
        let (value, outcome) = greet.call_traced(&args).unwrap();
        assert_eq!(value, "hello world");
        assert_eq!(outcome, Outcome::Hit);
    }

    #[test]
    fn accessors_expose_configuration() {
        let fx = fixture();
        let f = CachedFn::new(fx.config.clone(), fx.source.clone(), |_: &CallArgs| {
            Ok::<_, std::io::Error>(0i64)
        });
        assert_eq!(f.config(), &fx.config);
        assert_eq!(f.source().qualified_name(), "demo::double");
        assert_eq!(f.store().cache_dir(), fx.config.cache_dir());
    }
}
