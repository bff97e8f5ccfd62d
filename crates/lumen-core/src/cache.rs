//! Two-tier embedding cache with single-flight computation.
//!
//! Tier A is an in-process sharded map from fingerprint to entry; tier B
//! is the persistent store, written through on insert and read through on
//! a tier A miss. Concurrent lookups of the same fingerprint coalesce:
//! exactly one caller runs the compute closure, the rest wait on a watch
//! channel and receive the winner's entry id (or its error).

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::sync::watch;

use crate::error::{PipelineError, PipelineResult};
use crate::fingerprint::{self, HashCache};
use crate::store::Store;
use crate::types::{CacheEntry, CacheStats, ContentKind, EmbeddingSet, Fingerprint};

/// Shards keyed by the first fingerprint byte.
const SHARD_COUNT: usize = 256;

type CacheKey = (Fingerprint, ContentKind);

/// Broadcast state of an in-flight computation.
#[derive(Clone)]
enum Flight {
    Pending,
    Done(i64),
    Failed(Arc<PipelineError>),
}

enum Slot {
    Ready(CacheEntry),
    Pending(watch::Receiver<Flight>),
}

/// What a lookup decided to do while holding the shard lock.
enum Action {
    Hit(i64),
    Wait(watch::Receiver<Flight>),
    Compute(watch::Sender<Flight>),
}

pub struct EmbeddingCache {
    shards: Vec<Mutex<HashMap<CacheKey, Slot>>>,
    by_id: Mutex<HashMap<i64, CacheKey>>,
    store: Arc<dyn Store>,
    /// Shared image-prefix digest memo, owned by the orchestrator.
    hash_cache: Arc<HashCache>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    pub fn new(store: Arc<dyn Store>, hash_cache: Arc<HashCache>) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            by_id: Mutex::new(HashMap::new()),
            store,
            hash_cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up or compute the embeddings for a text.
    ///
    /// At most one concurrent `compute` runs per fingerprint; waiters
    /// receive the winner's result. Returns the entry id, with the entry's
    /// reference count bumped for this use.
    pub async fn get_or_insert_text<F, Fut>(
        &self,
        text: &str,
        content_kind: ContentKind,
        compute: F,
    ) -> PipelineResult<i64>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PipelineResult<EmbeddingSet>>,
    {
        let fp = fingerprint::text_fingerprint(text);
        self.get_or_insert(fp, content_kind, compute).await
    }

    /// Look up or compute the embeddings for an image file.
    ///
    /// The key is the digest of the file's first 1 MiB, memoized through
    /// the shared hash cache.
    pub async fn get_or_insert_image<F, Fut>(&self, path: &Path, compute: F) -> PipelineResult<i64>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PipelineResult<EmbeddingSet>>,
    {
        let fp = self.hash_cache.image_fingerprint(path)?;
        self.get_or_insert(fp, ContentKind::Image, compute).await
    }

    async fn get_or_insert<F, Fut>(
        &self,
        fp: Fingerprint,
        content_kind: ContentKind,
        compute: F,
    ) -> PipelineResult<i64>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PipelineResult<EmbeddingSet>>,
    {
        let key = (fp, content_kind);
        let action = {
            let mut shard = self.lock_shard(&fp);
            match shard.get(&key) {
                Some(Slot::Ready(entry)) => Action::Hit(entry.entry_id),
                Some(Slot::Pending(rx)) => Action::Wait(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(Flight::Pending);
                    shard.insert(key, Slot::Pending(rx));
                    Action::Compute(tx)
                }
            }
        };

        match action {
            Action::Hit(entry_id) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.record_reuse(&key, entry_id).await?;
                Ok(entry_id)
            }
            Action::Wait(mut rx) => {
                let flight = rx
                    .wait_for(|f| !matches!(f, Flight::Pending))
                    .await
                    .map(|f| (*f).clone())
                    // Sender dropped without a result: the computation was
                    // torn down, surface as cancellation.
                    .map_err(|_| PipelineError::Cancelled)?;
                match flight {
                    Flight::Done(entry_id) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        self.record_reuse(&key, entry_id).await?;
                        Ok(entry_id)
                    }
                    Flight::Failed(shared) => Err(shared.into()),
                    Flight::Pending => unreachable!("wait_for filters pending"),
                }
            }
            Action::Compute(tx) => self.compute_slot(key, tx, compute).await,
        }
    }

    /// Resolve a key this caller claimed: read tier B first, then compute.
    async fn compute_slot<F, Fut>(
        &self,
        key: CacheKey,
        tx: watch::Sender<Flight>,
        compute: F,
    ) -> PipelineResult<i64>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PipelineResult<EmbeddingSet>>,
    {
        // If this future is dropped mid-flight (caller cancelled), the
        // guard clears the pending slot so the key returns to absent
        // instead of wedging every later lookup.
        let mut guard = PendingGuard {
            cache: self,
            key,
            armed: true,
        };

        match self.store.get_embedding_by_fingerprint(&key.0).await {
            Ok(Some(mut entry)) => {
                // Persisted by an earlier run: a hit that skips compute.
                self.hits.fetch_add(1, Ordering::Relaxed);
                let entry_id = entry.entry_id;
                if let Err(e) = self.store.incref(entry_id).await {
                    guard.armed = false;
                    return self.fail_slot(key, tx, e);
                }
                entry.ref_count += 1;
                entry.last_used_at = SystemTime::now();
                self.install_ready(key, entry);
                guard.armed = false;
                let _ = tx.send(Flight::Done(entry_id));
                return Ok(entry_id);
            }
            Ok(None) => {}
            Err(e) => {
                guard.armed = false;
                return self.fail_slot(key, tx, e);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let set = match compute().await {
            Ok(set) => set,
            Err(e) => {
                guard.armed = false;
                return self.fail_slot(key, tx, e);
            }
        };
        if let Err(e) = set.validate() {
            guard.armed = false;
            return self.fail_slot(key, tx, e);
        }

        let now = SystemTime::now();
        let mut entry = CacheEntry {
            entry_id: 0,
            fingerprint: key.0,
            content_kind: key.1,
            embeddings: Arc::new(set),
            ref_count: 1,
            created_at: now,
            last_used_at: now,
        };
        match self.store.insert_embedding(&entry).await {
            Ok(entry_id) => {
                entry.entry_id = entry_id;
                self.install_ready(key, entry);
                guard.armed = false;
                let _ = tx.send(Flight::Done(entry_id));
                Ok(entry_id)
            }
            Err(e) => {
                guard.armed = false;
                self.fail_slot(key, tx, e)
            }
        }
    }

    /// Tear down a pending slot and release waiters with the error.
    fn fail_slot(
        &self,
        key: CacheKey,
        tx: watch::Sender<Flight>,
        error: PipelineError,
    ) -> PipelineResult<i64> {
        self.lock_shard(&key.0).remove(&key);
        let _ = tx.send(Flight::Failed(Arc::new(error.replicate())));
        Err(error)
    }

    fn install_ready(&self, key: CacheKey, entry: CacheEntry) {
        self.by_id
            .lock()
            .expect("cache id index poisoned")
            .insert(entry.entry_id, key);
        self.lock_shard(&key.0).insert(key, Slot::Ready(entry));
    }

    /// Persist and mirror a reuse of an existing entry.
    async fn record_reuse(&self, key: &CacheKey, entry_id: i64) -> PipelineResult<()> {
        self.store.incref(entry_id).await?;
        if let Some(Slot::Ready(entry)) = self.lock_shard(&key.0).get_mut(key) {
            entry.ref_count += 1;
            entry.last_used_at = SystemTime::now();
        }
        Ok(())
    }

    /// Immutable view of a cached entry's vectors.
    pub fn embeddings_of(&self, entry_id: i64) -> Option<Arc<EmbeddingSet>> {
        let key = *self.by_id.lock().expect("cache id index poisoned").get(&entry_id)?;
        match self.lock_shard(&key.0).get(&key) {
            Some(Slot::Ready(entry)) => Some(Arc::clone(&entry.embeddings)),
            _ => None,
        }
    }

    /// Bump an entry's reference count in both tiers.
    pub async fn incref(&self, entry_id: i64) -> PipelineResult<()> {
        let key = self.key_of(entry_id);
        self.store.incref(entry_id).await?;
        if let Some(key) = key {
            if let Some(Slot::Ready(entry)) = self.lock_shard(&key.0).get_mut(&key) {
                entry.ref_count += 1;
            }
        }
        Ok(())
    }

    /// Drop one reference in both tiers. Entries at zero become eligible
    /// for `cleanup_unused`.
    pub async fn decref(&self, entry_id: i64) -> PipelineResult<()> {
        let key = self.key_of(entry_id);
        self.store.decref(entry_id).await?;
        if let Some(key) = key {
            if let Some(Slot::Ready(entry)) = self.lock_shard(&key.0).get_mut(&key) {
                entry.ref_count = entry.ref_count.saturating_sub(1);
            }
        }
        Ok(())
    }

    /// Evict zero-reference entries from both tiers.
    ///
    /// Returns the store-side removal count, which covers entries that
    /// were never resident in tier A.
    pub async fn cleanup_unused(&self) -> PipelineResult<usize> {
        for shard in &self.shards {
            let mut shard = shard.lock().expect("cache shard poisoned");
            let dead: Vec<CacheKey> = shard
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready(entry) if entry.ref_count == 0 => Some(*key),
                    _ => None,
                })
                .collect();
            if dead.is_empty() {
                continue;
            }
            let mut by_id = self.by_id.lock().expect("cache id index poisoned");
            for key in dead {
                if let Some(Slot::Ready(entry)) = shard.remove(&key) {
                    by_id.remove(&entry.entry_id);
                }
            }
        }
        self.store.delete_unused_embeddings().await
    }

    /// Current size and hit accounting.
    pub fn stats(&self) -> CacheStats {
        let size = self
            .shards
            .iter()
            .map(|s| {
                s.lock()
                    .expect("cache shard poisoned")
                    .values()
                    .filter(|slot| matches!(slot, Slot::Ready(_)))
                    .count()
            })
            .sum();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let denominator = hits + misses;
        CacheStats {
            size,
            hits,
            misses,
            hit_rate: if denominator == 0 {
                0.0
            } else {
                hits as f64 / denominator as f64
            },
        }
    }

    /// True when no key is in the computing state. Used by shutdown and
    /// cancellation assertions.
    pub fn no_pending_computations(&self) -> bool {
        self.shards.iter().all(|s| {
            s.lock()
                .expect("cache shard poisoned")
                .values()
                .all(|slot| matches!(slot, Slot::Ready(_)))
        })
    }

    fn key_of(&self, entry_id: i64) -> Option<CacheKey> {
        self.by_id
            .lock()
            .expect("cache id index poisoned")
            .get(&entry_id)
            .copied()
    }

    fn lock_shard(&self, fp: &Fingerprint) -> std::sync::MutexGuard<'_, HashMap<CacheKey, Slot>> {
        self.shards[fp.shard() % SHARD_COUNT]
            .lock()
            .expect("cache shard poisoned")
    }
}

/// Clears a claimed pending slot if its computation never resolved.
struct PendingGuard<'a> {
    cache: &'a EmbeddingCache,
    key: CacheKey,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.lock_shard(&self.key.0).remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::MemoryStore;
    use crate::types::CLIP_L_DIM;
    use std::sync::atomic::AtomicUsize;

    fn unit_set() -> EmbeddingSet {
        let mut v = vec![0.0f32; CLIP_L_DIM];
        v[0] = 1.0;
        EmbeddingSet {
            text_clip_l: Some(v),
            ..Default::default()
        }
    }

    fn cache_with_store() -> (Arc<MemoryStore>, EmbeddingCache) {
        let store = Arc::new(MemoryStore::new());
        let cache = EmbeddingCache::new(
            store.clone() as Arc<dyn Store>,
            Arc::new(HashCache::new()),
        );
        (store, cache)
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let (_store, cache) = cache_with_store();

        let id1 = cache
            .get_or_insert_text("a red cube", ContentKind::Prompt, || async {
                Ok(unit_set())
            })
            .await
            .unwrap();
        let id2 = cache
            .get_or_insert_text("a red cube", ContentKind::Prompt, || async {
                panic!("must not recompute")
            })
            .await
            .unwrap();

        assert_eq!(id1, id2);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.size, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_single_flight_stress() {
        let (_store, cache) = cache_with_store();
        let cache = Arc::new(cache);
        let invocations = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let cache = Arc::clone(&cache);
            let invocations = Arc::clone(&invocations);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_insert_text("a red cube", ContentKind::Prompt, move || async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        // Give peers time to pile onto the pending slot.
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(unit_set())
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 31);
        assert!(cache.no_pending_computations());
    }

    #[tokio::test]
    async fn test_failed_compute_releases_waiters_and_resets() {
        let (_store, cache) = cache_with_store();
        let cache = Arc::new(cache);

        let err = cache
            .get_or_insert_text("bad", ContentKind::Prompt, || async {
                Err(PipelineError::EncoderFatal {
                    message: "graph corrupt".to_string(),
                })
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind_label(), "encoder_fatal");
        assert!(cache.no_pending_computations());

        // The key returned to absent: a later call computes again.
        let id = cache
            .get_or_insert_text("bad", ContentKind::Prompt, || async { Ok(unit_set()) })
            .await
            .unwrap();
        assert!(id > 0);
    }

    #[tokio::test]
    async fn test_tier_b_read_through_counts_as_hit() {
        let (store, cache) = cache_with_store();

        // Seed tier B directly, bypassing tier A.
        let now = SystemTime::now();
        let seeded = CacheEntry {
            entry_id: 0,
            fingerprint: fingerprint::text_fingerprint("warm"),
            content_kind: ContentKind::Prompt,
            embeddings: Arc::new(unit_set()),
            ref_count: 1,
            created_at: now,
            last_used_at: now,
        };
        let seeded_id = store.insert_embedding(&seeded).await.unwrap();

        let id = cache
            .get_or_insert_text("warm", ContentKind::Prompt, || async {
                panic!("tier B must satisfy this lookup")
            })
            .await
            .unwrap();
        assert_eq!(id, seeded_id);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[tokio::test]
    async fn test_same_text_different_kind_is_distinct() {
        let (_store, cache) = cache_with_store();
        let a = cache
            .get_or_insert_text("sunset", ContentKind::Prompt, || async { Ok(unit_set()) })
            .await
            .unwrap();
        let b = cache
            .get_or_insert_text("sunset", ContentKind::NegativePrompt, || async {
                Ok(unit_set())
            })
            .await
            .unwrap();
        // Distinct tier A slots even though the fingerprint matches; the
        // store deduplicates by fingerprint so ids may collide there.
        assert_eq!(cache.stats().size, 2);
        let _ = (a, b);
    }

    #[tokio::test]
    async fn test_refcounts_and_cleanup() {
        let (store, cache) = cache_with_store();

        let id = cache
            .get_or_insert_text("a red cube", ContentKind::Prompt, || async {
                Ok(unit_set())
            })
            .await
            .unwrap();
        // First use holds one reference.
        assert_eq!(store.entry_ref_count(id), Some(1));

        cache.incref(id).await.unwrap();
        assert_eq!(store.entry_ref_count(id), Some(2));

        cache.decref(id).await.unwrap();
        cache.decref(id).await.unwrap();
        assert_eq!(store.entry_ref_count(id), Some(0));

        let removed = cache.cleanup_unused().await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cache.stats().size, 0);
        assert_eq!(store.zero_ref_entry_count(), 0);
        assert!(cache.embeddings_of(id).is_none());
    }

    #[tokio::test]
    async fn test_cleanup_spares_referenced_entries() {
        let (store, cache) = cache_with_store();
        let id = cache
            .get_or_insert_text("keep me", ContentKind::Prompt, || async { Ok(unit_set()) })
            .await
            .unwrap();
        let removed = cache.cleanup_unused().await.unwrap();
        assert_eq!(removed, 0);
        assert_eq!(store.entry_ref_count(id), Some(1));
        assert!(cache.embeddings_of(id).is_some());
    }

    #[tokio::test]
    async fn test_invalid_compute_result_rejected() {
        let (_store, cache) = cache_with_store();
        let err = cache
            .get_or_insert_text("bad dims", ContentKind::Prompt, || async {
                Ok(EmbeddingSet {
                    text_clip_l: Some(vec![1.0; 3]),
                    ..Default::default()
                })
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind_label(), "encoder_fatal");
        assert!(cache.no_pending_computations());
    }
}
