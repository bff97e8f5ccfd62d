//! Pipeline orchestration: the public entry points.
//!
//! The orchestrator exclusively owns the encoder pool (behind the batch
//! scheduler), the embedding cache, and the hash cache. External callers
//! drive it through `preload_prompts`, `process_one`, `process_all`,
//! `statistics`, and `shutdown`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::StreamExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::cache::EmbeddingCache;
use crate::config::{Config, StoreConfig};
use crate::dedup;
use crate::encoder::{BatchEncoder, EncoderKind, EncoderPool};
use crate::error::{LumenError, PipelineError, PipelineResult};
use crate::fingerprint::{self, HashCache};
use crate::store::Store;
use crate::types::{
    ContentKind, EmbeddingSet, ImageEmbeddingRequest, ImageRecord, ProgressStage,
    RepresentativeGroup, Statistics,
};

use super::progress::{report_stage, ProgressReporter, ProgressSink};
use super::scheduler::{BatchScheduler, WorkItem};

/// Run accounting exposed through `statistics()`.
#[derive(Default)]
struct RunCounters {
    processed: AtomicU64,
    failed: AtomicU64,
    failures_by_kind: Mutex<HashMap<String, u64>>,
}

impl RunCounters {
    fn record_failure(&self, error: &PipelineError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        *self
            .failures_by_kind
            .lock()
            .expect("failure counters poisoned")
            .entry(error.kind_label().to_string())
            .or_insert(0) += 1;
    }
}

pub struct PipelineOrchestrator {
    store: Arc<dyn Store>,
    cache: Arc<EmbeddingCache>,
    scheduler: Arc<BatchScheduler>,
    hash_cache: Arc<HashCache>,
    store_cfg: StoreConfig,
    /// Bound on concurrently in-flight images during bulk runs.
    max_in_flight: usize,
    cancel: CancellationToken,
    counters: RunCounters,
    shutdown_done: AtomicBool,
}

impl PipelineOrchestrator {
    /// Construct the orchestrator, loading every configured encoder
    /// session. Fails fast on configuration problems.
    pub fn new(config: &Config, store: Arc<dyn Store>) -> Result<Self, LumenError> {
        config.validate()?;
        let pool = Arc::new(EncoderPool::from_config(config)?);
        Ok(Self::with_encoder(config, store, pool))
    }

    /// Construct around an existing encoder backend.
    ///
    /// This is the seam for alternative inference runtimes; `new` is the
    /// ONNX-backed production path.
    pub fn with_encoder(
        config: &Config,
        store: Arc<dyn Store>,
        encoder: Arc<dyn BatchEncoder>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let hash_cache = Arc::new(HashCache::new());
        let cache = Arc::new(EmbeddingCache::new(
            Arc::clone(&store),
            Arc::clone(&hash_cache),
        ));
        let scheduler = Arc::new(BatchScheduler::new(
            encoder,
            &config.batching,
            cancel.child_token(),
        ));
        let max_in_flight =
            config.batching.image_batch_size * config.batching.queue_capacity_multiplier;

        Self {
            store,
            cache,
            scheduler,
            hash_cache,
            store_cfg: config.store.clone(),
            max_in_flight: max_in_flight.max(1),
            cancel,
            counters: RunCounters::default(),
            shutdown_done: AtomicBool::new(false),
        }
    }

    /// Warm the cache with every distinct prompt pair the store knows.
    ///
    /// Idempotent: already-cached pairs are hits. Per-pair failures are
    /// recorded and skipped; only cancellation aborts the pass.
    pub async fn preload_prompts(
        &self,
        limit: Option<usize>,
        progress: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), LumenError> {
        if self.is_cancelled(cancel) {
            return Err(PipelineError::Cancelled.into());
        }
        let pairs = self
            .with_store_retry("distinct_prompt_pairs", || {
                self.store.distinct_prompt_pairs(limit)
            })
            .await?;
        tracing::info!(pairs = pairs.len(), "preloading prompt embeddings");

        let reporter = ProgressReporter::new(progress, ProgressStage::Encoding, pairs.len() as u64);
        let outcomes: Vec<PipelineResult<()>> = futures_util::stream::iter(pairs)
            .map(|(prompt, negative)| {
                let reporter = &reporter;
                async move {
                    let result = self.warm_pair(&prompt, &negative, cancel).await;
                    reporter.advance(1);
                    result
                }
            })
            .buffer_unordered(self.max_in_flight)
            .collect()
            .await;
        reporter.finish(None);

        for outcome in outcomes {
            match outcome {
                Ok(()) => {}
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled.into()),
                Err(e) => {
                    tracing::warn!("prompt preload failure: {e}");
                    self.counters.record_failure(&e);
                }
            }
        }
        Ok(())
    }

    /// Generate and persist embeddings for a single image. Returns after
    /// the store write succeeds.
    pub async fn process_one(
        &self,
        request: ImageEmbeddingRequest,
        cancel: &CancellationToken,
    ) -> Result<(), LumenError> {
        if self.is_cancelled(cancel) {
            return Err(PipelineError::Cancelled.into());
        }
        let record = request.record;

        let mut set = match self.prompt_embeddings(&record.params.prompt).await {
            Ok(set) => set,
            Err(e) => {
                self.counters.record_failure(&e);
                return Err(e.into());
            }
        };

        // The image vector goes through the scheduler as a work item so it
        // batches with concurrent callers.
        let (result_sink, result) = oneshot::channel();
        self.scheduler
            .enqueue(WorkItem {
                image_id: record.id,
                image_path: Some(record.path.clone()),
                prompt_fp: fingerprint::prompt_fingerprint(
                    &record.params.prompt,
                    &record.params.negative_prompt,
                ),
                prompt_text: record.params.prompt.clone(),
                needs_text: false,
                needs_image: true,
                result_sink,
            })
            .await;
        match result.await.unwrap_or(Err(PipelineError::Cancelled)) {
            Ok(image_set) => set.merge(&image_set),
            // A pool without a vision session still persists text vectors.
            Err(PipelineError::EncoderUnavailable(_)) => {}
            Err(e) => {
                self.counters.record_failure(&e);
                return Err(e.into());
            }
        }

        set.validate()?;
        self.with_store_retry("store_image_embeddings", || {
            self.store.store_image_embeddings(record.id, &set, true)
        })
        .await?;
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// The deduplicated bulk path: plan, encode representatives, fan out.
    ///
    /// `batch_size` bounds how many representative images are in flight at
    /// once. Individual failures mark their group failed and the run
    /// continues; only cancellation and configuration problems abort.
    pub async fn process_all(
        &self,
        batch_size: usize,
        progress: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), LumenError> {
        if self.is_cancelled(cancel) {
            return Err(PipelineError::Cancelled.into());
        }

        let total_images = self
            .with_store_retry("image_count", || self.store.image_count())
            .await? as u64;
        report_stage(&progress, ProgressStage::Hashing, 0, total_images);
        self.with_store_retry("compute_and_persist_metadata_hashes", || {
            self.store.compute_and_persist_metadata_hashes()
        })
        .await?;
        report_stage(&progress, ProgressStage::Hashing, total_images, total_images);

        let records = self
            .with_store_retry("images_missing_embeddings", || {
                self.store.images_missing_embeddings()
            })
            .await?;
        let record_count = records.len() as u64;
        report_stage(&progress, ProgressStage::Selecting, 0, record_count);
        let groups = dedup::plan(&records);
        report_stage(&progress, ProgressStage::Selecting, record_count, record_count);
        tracing::info!(
            images = records.len(),
            groups = groups.len(),
            "deduplication plan ready"
        );

        let by_id: HashMap<i64, ImageRecord> =
            records.into_iter().map(|r| (r.id, r)).collect();
        let reporter =
            ProgressReporter::new(progress.clone(), ProgressStage::Encoding, groups.len() as u64);

        let limit = batch_size.clamp(1, self.max_in_flight);
        let outcomes: Vec<PipelineResult<()>> = futures_util::stream::iter(groups)
            .map(|group| {
                let record = by_id.get(&group.representative_image_id).cloned();
                let reporter = &reporter;
                async move {
                    let result = self.encode_representative(&group, record, cancel).await;
                    reporter.advance(1);
                    result
                }
            })
            .buffer_unordered(limit)
            .collect()
            .await;
        reporter.finish(None);

        let mut cancelled = false;
        for outcome in outcomes {
            match outcome {
                Ok(()) => {
                    self.counters.processed.fetch_add(1, Ordering::Relaxed);
                }
                Err(PipelineError::Cancelled) => cancelled = true,
                Err(e) => {
                    tracing::warn!("representative encoding failed: {e}");
                    self.counters.record_failure(&e);
                }
            }
        }
        if cancelled || self.is_cancelled(cancel) {
            return Err(PipelineError::Cancelled.into());
        }

        // Fan-out happens only after every representative finished or
        // failed; groups without stored embeddings are skipped store-side.
        report_stage(&progress, ProgressStage::Fanout, 0, 1);
        let copied = self
            .with_store_retry("copy_embeddings_to_group_non_representatives", || {
                self.store.copy_embeddings_to_group_non_representatives()
            })
            .await?;
        report_stage(&progress, ProgressStage::Fanout, 1, 1);
        tracing::info!(copied, "embedding fan-out complete");

        report_stage(&progress, ProgressStage::Done, total_images, total_images);
        Ok(())
    }

    /// Current cache, throughput, and queue accounting.
    pub fn statistics(&self) -> Statistics {
        Statistics {
            cache: self.cache.stats(),
            images_processed: self.counters.processed.load(Ordering::Relaxed),
            images_failed: self.counters.failed.load(Ordering::Relaxed),
            failures_by_kind: self
                .counters
                .failures_by_kind
                .lock()
                .expect("failure counters poisoned")
                .clone(),
            queue_depth: self.scheduler.queue_depth(),
        }
    }

    /// Handle for cooperative cancellation of everything this
    /// orchestrator runs.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel outstanding work, drain the scheduler, release the hash
    /// cache. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown_done.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.scheduler.shutdown().await;
        self.hash_cache.clear();
        tracing::info!("pipeline orchestrator shut down");
    }

    /// Encode one representative and persist its vectors.
    async fn encode_representative(
        &self,
        group: &RepresentativeGroup,
        record: Option<ImageRecord>,
        cancel: &CancellationToken,
    ) -> PipelineResult<()> {
        if self.is_cancelled(cancel) {
            return Err(PipelineError::Cancelled);
        }
        let Some(record) = record else {
            return Err(PipelineError::Store {
                message: format!(
                    "representative {} missing from the planned record set",
                    group.representative_image_id
                ),
            });
        };

        let mut set = self.prompt_embeddings(&record.params.prompt).await?;

        if self.scheduler.configured(EncoderKind::Vision) {
            // Image vectors key on the file's leading bytes, so re-runs
            // and byte-identical copies skip the encoder entirely.
            let scheduler = Arc::clone(&self.scheduler);
            let path = record.path.clone();
            let entry_id = self
                .cache
                .get_or_insert_image(&record.path, move || async move {
                    let vector = scheduler.submit_image(path).await?;
                    Ok(EmbeddingSet {
                        image_vision: Some(vector),
                        ..Default::default()
                    })
                })
                .await?;
            if let Some(view) = self.cache.embeddings_of(entry_id) {
                set.image_vision = view.image_vision.clone();
            }
        }

        set.validate()?;
        self.with_store_retry("store_image_embeddings", || {
            self.store.store_image_embeddings(record.id, &set, true)
        })
        .await?;
        tracing::debug!(
            image_id = record.id,
            members = group.member_image_ids.len(),
            "representative embeddings stored"
        );
        Ok(())
    }

    /// Cache-backed prompt vectors across all configured text encoders.
    async fn prompt_embeddings(&self, prompt: &str) -> PipelineResult<EmbeddingSet> {
        let entry_id = self.ensure_text_cached(prompt, ContentKind::Prompt).await?;
        Ok(self
            .cache
            .embeddings_of(entry_id)
            .map(|view| (*view).clone())
            .unwrap_or_default())
    }

    async fn ensure_text_cached(&self, text: &str, kind: ContentKind) -> PipelineResult<i64> {
        let scheduler = Arc::clone(&self.scheduler);
        let owned = text.to_string();
        self.cache
            .get_or_insert_text(text, kind, move || async move {
                scheduler.text_embedding_set(&owned).await
            })
            .await
    }

    async fn warm_pair(
        &self,
        prompt: &str,
        negative: &str,
        cancel: &CancellationToken,
    ) -> PipelineResult<()> {
        if self.is_cancelled(cancel) {
            return Err(PipelineError::Cancelled);
        }
        self.ensure_text_cached(prompt, ContentKind::Prompt).await?;
        self.ensure_text_cached(negative, ContentKind::NegativePrompt)
            .await?;
        Ok(())
    }

    fn is_cancelled(&self, caller: &CancellationToken) -> bool {
        caller.is_cancelled() || self.cancel.is_cancelled()
    }

    /// Run a store operation under the configured deadline, retrying
    /// transient failures with linear backoff.
    async fn with_store_retry<T, F, Fut>(&self, operation: &str, mut f: F) -> PipelineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        let deadline = Duration::from_secs(self.store_cfg.io_timeout_secs);
        let mut attempt: u32 = 0;
        loop {
            let result = match tokio::time::timeout(deadline, f()).await {
                Ok(result) => result,
                Err(_) => Err(PipelineError::StoreTimeout {
                    operation: operation.to_string(),
                    timeout_ms: deadline.as_millis() as u64,
                }),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable_io() && attempt < self.store_cfg.retry_attempts => {
                    attempt += 1;
                    let backoff =
                        Duration::from_millis(self.store_cfg.retry_delay_ms * attempt as u64);
                    tracing::warn!(
                        operation,
                        attempt,
                        "store operation failed, retrying in {backoff:?}: {e}"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
