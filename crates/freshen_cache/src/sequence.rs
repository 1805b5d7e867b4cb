//! Memoization of sequence-producing functions.
//!
//! On a miss the producer's items are forwarded to the caller one at a time
//! and recorded in the same pass. The entry is published only after the
//! producer is drained without error; on a hit the items are replayed lazily
//! from storage.

use std::sync::Arc;

use freshen_config::CacheConfig;

use crate::args::CallArgs;
use crate::codec::{BincodeCodec, ItemStream, ItemWriter, SequenceCodec};
use crate::error::MemoError;
use crate::probe::{Outcome, Probe};
use crate::scalar::BoxError;
use crate::snapshot::Snapshot;
use crate::source::{FunctionSource, SourceLocatable};
use crate::store::{CacheStore, EntryKind, SequenceRecorder};

/// A sequence-producing function wrapped with a persistent cache.
///
/// The producer returns any iterable of `Result<T, E>`. Each call yields a
/// [`Replay`], which must be consumed to the end for a miss to be cached.
pub struct CachedIter<G, S = FunctionSource, C = BincodeCodec> {
    config: Arc<CacheConfig>,
    store: CacheStore,
    source: S,
    producer: G,
    codec: C,
}

impl<G, S: SourceLocatable> CachedIter<G, S, BincodeCodec> {
    /// Wraps `producer`, described by `source`, using the default codec.
    pub fn new(config: impl Into<Arc<CacheConfig>>, source: S, producer: G) -> Self {
        let config = config.into();
        Self {
            store: CacheStore::new(&config),
            config,
            source,
            producer,
            codec: BincodeCodec,
        }
    }
}

impl<G, S: SourceLocatable, C> CachedIter<G, S, C> {
    /// Replaces the serializer pair used for items.
    pub fn with_codec<C2>(self, codec: C2) -> CachedIter<G, S, C2> {
        CachedIter {
            config: self.config,
            store: self.store,
            source: self.source,
            producer: self.producer,
            codec,
        }
    }

    /// Configuration this wrapper was created with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Source description of the wrapped producer.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// The underlying entry store.
    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Calls the producer through the cache.
    ///
    /// Nothing is produced until the returned [`Replay`] is iterated.
    pub fn call<'a, I, T, E>(&'a self, args: &CallArgs) -> Result<Replay<'a, T>, MemoError>
    where
        G: Fn(&CallArgs) -> I,
        I: IntoIterator<Item = Result<T, E>>,
        I::IntoIter: 'a,
        E: Into<BoxError>,
        C: SequenceCodec<T>,
        C::Writer: 'a,
        T: 'a,
    {
        let probe = Probe::run(&self.store, &self.source, args, EntryKind::Sequence)?;

        if let Some(payload) = &probe.fresh {
            match self.codec.read(payload).map_err(MemoError::from) {
                Ok(items) => {
                    tracing::debug!(entry = %probe.fingerprint, "cache hit");
                    return Ok(Replay {
                        inner: ReplayInner::Cached(items),
                        outcome: Outcome::Hit,
                    });
                }
                Err(e) if e.is_storage() => {
                    tracing::debug!(entry = %probe.fingerprint, error = %e, "payload unreadable, recomputing");
                }
                Err(e) => return Err(e),
            }
        }

        tracing::debug!(entry = %probe.fingerprint, "cache miss");
        let recorder = match self.store.record::<T, C>(&probe.fingerprint, &self.codec) {
            Ok(recorder) => Some(recorder),
            Err(e) if e.is_storage() => {
                tracing::warn!(entry = %probe.fingerprint, error = %e, "cannot record sequence");
                None
            }
            Err(e) => return Err(e),
        };

        let producer = &self.producer;
        let args = args.clone();
        let tee = Tee {
            start: Some(move || producer(&args).into_iter()),
            items: None::<I::IntoIter>,
            recorder,
            source: &self.source,
            probe,
            done: false,
        };
        Ok(Replay {
            inner: ReplayInner::Live(Box::new(tee)),
            outcome: Outcome::Miss,
        })
    }
}

/// Lazily produced items of one memoized call.
///
/// Yields `Err` at most once, after which iteration ends.
pub struct Replay<'a, T> {
    inner: ReplayInner<'a, T>,
    outcome: Outcome,
}

enum ReplayInner<'a, T> {
    Cached(ItemStream<T>),
    Live(Box<dyn Iterator<Item = Result<T, MemoError>> + 'a>),
    Done,
}

impl<T> Replay<'_, T> {
    /// Whether the items come from the cache or from the producer.
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }
}

impl<T> Iterator for Replay<'_, T> {
    type Item = Result<T, MemoError>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = match &mut self.inner {
            ReplayInner::Cached(items) => items.next().map(|r| r.map_err(MemoError::from)),
            ReplayInner::Live(items) => items.next(),
            ReplayInner::Done => return None,
        };
        if matches!(next, None | Some(Err(_))) {
            self.inner = ReplayInner::Done;
        }
        next
    }
}

/// Forwards producer items to the caller while recording them.
///
/// The producer itself is only called on the first `next()`.
struct Tee<'a, P, It, W, S> {
    start: Option<P>,
    items: Option<It>,
    recorder: Option<SequenceRecorder<W>>,
    source: &'a S,
    probe: Probe,
    done: bool,
}

impl<P, It, W, S, T, E> Iterator for Tee<'_, P, It, W, S>
where
    P: FnOnce() -> It,
    It: Iterator<Item = Result<T, E>>,
    E: Into<BoxError>,
    W: ItemWriter<T>,
    S: SourceLocatable,
{
    type Item = Result<T, MemoError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.items.is_none() {
            let start = self.start.take()?;
            self.items = Some(start());
        }
        let next = self.items.as_mut()?.next();
        match next {
            Some(Ok(item)) => {
                if let Some(recorder) = self.recorder.as_mut() {
                    if let Err(e) = recorder.push(&item) {
                        // dropping the recorder discards the staged payload
                        self.recorder = None;
                        if e.is_storage() {
                            tracing::warn!(entry = %self.probe.fingerprint, error = %e, "stopped recording sequence");
                        } else {
                            self.done = true;
                            return Some(Err(e));
                        }
                    }
                }
                Some(Ok(item))
            }
            Some(Err(e)) => {
                self.done = true;
                self.recorder = None;
                Some(Err(MemoError::Function(e.into())))
            }
            None => {
                self.done = true;
                let recorder = self.recorder.take()?;
                let snapshot: Snapshot = self.probe.commit_snapshot(self.source);
                match recorder.finish::<T>(&snapshot) {
                    Ok(()) => None,
                    Err(e) if e.is_storage() => {
                        tracing::warn!(entry = %self.probe.fingerprint, error = %e, "failed to persist sequence");
                        None
                    }
                    Err(e) => Some(Err(e)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        dir: tempfile::TempDir,
        source: FunctionSource,
        config: CacheConfig,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("span.rs");
        std::fs::write(
            &src,
            "fn span(start: i64, stop: i64) -> impl Iterator<Item = i64> { start..stop }\n",
        )
        .unwrap();
        let source = FunctionSource::locate(&src, "demo::span").unwrap();
        let config = CacheConfig::new(dir.path().join("cache"));
        Fixture {
            dir,
            source,
            config,
        }
    }

    fn span_args(start: i64, stop: i64) -> CallArgs {
        CallArgs::new().arg(start).arg(stop)
    }

    fn span(args: &CallArgs) -> impl Iterator<Item = Result<i64, std::io::Error>> {
        let start = args.i64_at(0).unwrap_or(0);
        let stop = args.i64_at(1).unwrap_or(0);
        (start..stop).map(Ok)
    }

    #[test]
    fn replays_items_in_order() {
        let fx = fixture();
        let runs = AtomicUsize::new(0);
        let cached = CachedIter::new(fx.config.clone(), fx.source.clone(), |args: &CallArgs| {
            runs.fetch_add(1, Ordering::SeqCst);
            span(args)
        });

        let first = cached.call(&span_args(2, 7)).unwrap();
        assert_eq!(first.outcome(), Outcome::Miss);
        let first: Vec<i64> = first.collect::<Result<_, _>>().unwrap();

        let second = cached.call(&span_args(2, 7)).unwrap();
        assert_eq!(second.outcome(), Outcome::Hit);
        let second: Vec<i64> = second.collect::<Result<_, _>>().unwrap();

        assert_eq!(first, vec![2, 3, 4, 5, 6]);
        assert_eq!(first, second);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn producer_is_lazy() {
        let fx = fixture();
        let counter = AtomicUsize::new(0);
        let pulled = &counter;
        let cached = CachedIter::new(fx.config.clone(), fx.source.clone(), move |args: &CallArgs| {
            span(args).inspect(move |_| {
                pulled.fetch_add(1, Ordering::SeqCst);
            })
        });

        let mut replay = cached.call(&span_args(0, 100)).unwrap();
        assert_eq!(pulled.load(Ordering::SeqCst), 0);
        assert_eq!(replay.next().unwrap().unwrap(), 0);
        assert_eq!(pulled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn producer_runs_on_first_pull() {
        let fx = fixture();
        let calls = AtomicUsize::new(0);
        let cached = CachedIter::new(fx.config.clone(), fx.source.clone(), |args: &CallArgs| {
            calls.fetch_add(1, Ordering::SeqCst);
            span(args)
        });

        let untouched = cached.call(&span_args(0, 3)).unwrap();
        assert_eq!(untouched.outcome(), Outcome::Miss);
        drop(untouched);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let mut replay = cached.call(&span_args(0, 3)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(replay.next().unwrap().unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn partially_consumed_miss_is_not_cached() {
        let fx = fixture();
        let runs = AtomicUsize::new(0);
        let cached = CachedIter::new(fx.config.clone(), fx.source.clone(), |args: &CallArgs| {
            runs.fetch_add(1, Ordering::SeqCst);
            span(args)
        });

        let taken: Vec<i64> = cached
            .call(&span_args(0, 10))
            .unwrap()
            .take(3)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(taken, vec![0, 1, 2]);

        let again = cached.call(&span_args(0, 10)).unwrap();
        assert_eq!(again.outcome(), Outcome::Miss);
        assert_eq!(again.count(), 10);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn producer_error_leaves_no_entry() {
        let fx = fixture();
        let fail = std::sync::atomic::AtomicBool::new(true);
        let cached = CachedIter::new(fx.config.clone(), fx.source.clone(), |_: &CallArgs| {
            let fail_now = fail.load(Ordering::SeqCst);
            (0..5).map(move |i| {
                if fail_now && i == 3 {
                    Err(std::io::Error::new(std::io::ErrorKind::Other, "producer broke"))
                } else {
                    Ok(i)
                }
            })
        });

        let items: Vec<Result<i64, MemoError>> = cached.call(&span_args(0, 5)).unwrap().collect();
        assert_eq!(items.len(), 4);
        assert!(matches!(items[3], Err(MemoError::Function(_))));

        fail.store(false, Ordering::SeqCst);
        let retry = cached.call(&span_args(0, 5)).unwrap();
        assert_eq!(retry.outcome(), Outcome::Miss);
        let items: Vec<i64> = retry.collect::<Result<_, _>>().unwrap();
        assert_eq!(items, vec![0, 1, 2, 3, 4]);

        assert_eq!(cached.call(&span_args(0, 5)).unwrap().outcome(), Outcome::Hit);
    }

    #[test]
    fn interleaved_replays_of_one_call_both_complete() {
        let fx = fixture();
        let cached = CachedIter::new(fx.config.clone(), fx.source.clone(), span);
        let mut a = cached.call(&span_args(0, 4)).unwrap();
        let mut b = cached.call(&span_args(0, 4)).unwrap();

        let mut from_a = Vec::new();
        let mut from_b = Vec::new();
        for _ in 0..4 {
            from_a.push(a.next().unwrap().unwrap());
            from_b.push(b.next().unwrap().unwrap());
        }
        assert!(a.next().is_none());
        assert!(b.next().is_none());
        assert_eq!(from_a, vec![0, 1, 2, 3]);
        assert_eq!(from_a, from_b);

        let hit = cached.call(&span_args(0, 4)).unwrap();
        assert_eq!(hit.outcome(), Outcome::Hit);
        assert_eq!(hit.collect::<Result<Vec<_>, _>>().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn empty_sequence_is_cached() {
        let fx = fixture();
        let cached = CachedIter::new(fx.config.clone(), fx.source.clone(), span);
        assert_eq!(cached.call(&span_args(3, 3)).unwrap().count(), 0);
        let replay = cached.call(&span_args(3, 3)).unwrap();
        assert_eq!(replay.outcome(), Outcome::Hit);
        assert_eq!(replay.count(), 0);
    }

    #[test]
    fn json_lines_codec_override() {
        let fx = fixture();
        let cached = CachedIter::new(fx.config.clone(), fx.source.clone(), |args: &CallArgs| {
            span(args).map(|r| r.map(|i| format!("item-{i}")))
        })
        .with_codec(JsonCodec);

        let miss: Vec<String> = cached.call(&span_args(0, 3)).unwrap().collect::<Result<_, _>>().unwrap();
        let hit = cached.call(&span_args(0, 3)).unwrap();
        assert_eq!(hit.outcome(), Outcome::Hit);
        let hit: Vec<String> = hit.collect::<Result<_, _>>().unwrap();
        assert_eq!(miss, hit);
        assert_eq!(hit[2], "item-2");
    }

    #[test]
    fn unwritable_cache_still_streams() {
        let fx = fixture();
        let blocker = fx.dir.path().join("blocked");
        std::fs::write(&blocker, "not a directory").unwrap();
        let cached = CachedIter::new(CacheConfig::new(&blocker), fx.source.clone(), span);

        let first = cached.call(&span_args(0, 4)).unwrap();
        assert_eq!(first.collect::<Result<Vec<_>, _>>().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(cached.call(&span_args(0, 4)).unwrap().outcome(), Outcome::Miss);
    }
}
