//! Bounded batch scheduling in front of the encoder pool.
//!
//! One bounded queue and one consumer task per configured encoder session.
//! Producers suspend when a queue is full; consumers form batches by size
//! or linger timeout and dispatch them through the `BatchEncoder` seam.
//! A transient inference failure halves the batch and retries; survivors
//! of the final retry fail with `EncoderFatal`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BatchingConfig;
use crate::encoder::{BatchEncoder, EncoderKind};
use crate::error::{PipelineError, PipelineResult};
use crate::types::{EmbeddingSet, Fingerprint};

/// Split-and-retry budget for a transiently failing batch.
const MAX_BATCH_RETRIES: u32 = 3;

/// One unit of per-image work for the scheduler.
///
/// The scheduler fans the item out to every relevant session queue and
/// delivers the merged set through `result_sink`.
pub struct WorkItem {
    pub image_id: i64,
    pub image_path: Option<PathBuf>,
    pub prompt_fp: Fingerprint,
    pub prompt_text: String,
    pub needs_text: bool,
    pub needs_image: bool,
    pub result_sink: oneshot::Sender<PipelineResult<EmbeddingSet>>,
}

/// A single queued encode request for one session.
struct EncodeJob {
    input: JobInput,
    sink: oneshot::Sender<PipelineResult<Vec<f32>>>,
}

enum JobInput {
    Text(String),
    Image(PathBuf),
}

pub struct BatchScheduler {
    queues: HashMap<EncoderKind, mpsc::Sender<EncodeJob>>,
    depth: Arc<AtomicUsize>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BatchScheduler {
    /// Spawn one consumer per configured encoder kind.
    pub fn new(
        encoder: Arc<dyn BatchEncoder>,
        batching: &BatchingConfig,
        cancel: CancellationToken,
    ) -> Self {
        let depth = Arc::new(AtomicUsize::new(0));
        let mut queues = HashMap::new();
        let mut workers = Vec::new();

        for kind in EncoderKind::ALL {
            if !encoder.configured(kind) {
                continue;
            }
            let batch_size = if kind.is_text() {
                batching.text_batch_size
            } else {
                batching.image_batch_size
            }
            .max(1);
            let capacity = batch_size * batching.queue_capacity_multiplier.max(1);
            let linger = Duration::from_millis(batching.batch_linger_ms);

            let (tx, rx) = mpsc::channel(capacity);
            queues.insert(kind, tx);
            workers.push(tokio::spawn(consume(
                kind,
                rx,
                Arc::clone(&encoder),
                batch_size,
                linger,
                cancel.clone(),
                Arc::clone(&depth),
            )));
        }

        Self {
            queues,
            depth,
            cancel,
            workers: Mutex::new(workers),
        }
    }

    /// Queue one text for a session and await its vector.
    ///
    /// Suspends while the session's queue is full (back-pressure).
    pub async fn submit_text(&self, kind: EncoderKind, text: String) -> PipelineResult<Vec<f32>> {
        self.submit(kind, JobInput::Text(text)).await
    }

    /// Queue one image path for the vision session and await its vector.
    pub async fn submit_image(&self, path: PathBuf) -> PipelineResult<Vec<f32>> {
        self.submit(EncoderKind::Vision, JobInput::Image(path)).await
    }

    async fn submit(&self, kind: EncoderKind, input: JobInput) -> PipelineResult<Vec<f32>> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let queue = self
            .queues
            .get(&kind)
            .ok_or(PipelineError::EncoderUnavailable(kind))?;

        let (sink, result) = oneshot::channel();
        self.depth.fetch_add(1, Ordering::Relaxed);
        if queue.send(EncodeJob { input, sink }).await.is_err() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            return Err(PipelineError::Cancelled);
        }
        result.await.unwrap_or(Err(PipelineError::Cancelled))
    }

    /// Encode one text across every configured text session concurrently.
    pub async fn text_embedding_set(&self, text: &str) -> PipelineResult<EmbeddingSet> {
        let mut pending = Vec::new();
        for kind in EncoderKind::ALL {
            if !kind.is_text() || !self.queues.contains_key(&kind) {
                continue;
            }
            pending.push(async move { (kind, self.submit_text(kind, text.to_string()).await) });
        }

        let mut set = EmbeddingSet::default();
        for (kind, result) in futures_util::future::join_all(pending).await {
            let vector = result?;
            match kind {
                EncoderKind::SemanticText => set.text_semantic = Some(vector),
                EncoderKind::ClipLText => set.text_clip_l = Some(vector),
                EncoderKind::ClipGText => set.text_clip_g = Some(vector),
                EncoderKind::Vision => unreachable!("text kinds only"),
            }
        }
        Ok(set)
    }

    /// Fan a work item out to the sessions it needs and deliver the
    /// merged result through its sink.
    pub async fn enqueue(&self, item: WorkItem) {
        let WorkItem {
            image_id,
            image_path,
            prompt_fp,
            prompt_text,
            needs_text,
            needs_image,
            result_sink,
        } = item;
        tracing::trace!(image_id, prompt_fp = %prompt_fp, "work item enqueued");

        let text = async {
            if needs_text {
                self.text_embedding_set(&prompt_text).await.map(Some)
            } else {
                Ok(None)
            }
        };
        let image = async {
            match (needs_image, image_path) {
                (true, Some(path)) => self.submit_image(path).await.map(Some),
                _ => Ok(None),
            }
        };

        let result = match tokio::join!(text, image) {
            (Ok(text), Ok(image)) => {
                let mut set = EmbeddingSet::default();
                if let Some(text) = text {
                    set.merge(&text);
                }
                set.image_vision = image;
                Ok(set)
            }
            (Err(e), _) | (_, Err(e)) => Err(e),
        };

        let _ = result_sink.send(result);
    }

    /// Whether a queue exists for the given encoder kind.
    pub fn configured(&self, kind: EncoderKind) -> bool {
        self.queues.contains_key(&kind)
    }

    /// Items queued but not yet dispatched.
    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Stop consuming: refuse new enqueues, finish the in-flight batches,
    /// fail queued items with `Cancelled`. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let workers = std::mem::take(&mut *self.workers.lock().expect("worker list poisoned"));
        for worker in workers {
            let _ = worker.await;
        }
    }
}

/// Consumer loop for one session queue.
async fn consume(
    kind: EncoderKind,
    mut rx: mpsc::Receiver<EncodeJob>,
    encoder: Arc<dyn BatchEncoder>,
    batch_size: usize,
    linger: Duration,
    cancel: CancellationToken,
    depth: Arc<AtomicUsize>,
) {
    loop {
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            job = rx.recv() => job,
        };
        let Some(first) = first else { break };
        depth.fetch_sub(1, Ordering::Relaxed);

        // Form a batch: fill to batch_size or until the linger window
        // since the oldest pending item closes.
        let mut batch = vec![first];
        let deadline = tokio::time::Instant::now() + linger;
        while batch.len() < batch_size {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                job = rx.recv() => match job {
                    Some(job) => {
                        depth.fetch_sub(1, Ordering::Relaxed);
                        batch.push(job);
                    }
                    None => break,
                },
            }
        }

        tracing::debug!(%kind, size = batch.len(), "dispatching batch");
        dispatch(&encoder, kind, batch, MAX_BATCH_RETRIES).await;
    }

    // Cancellation or producer teardown: fail whatever is still queued.
    rx.close();
    while let Ok(job) = rx.try_recv() {
        depth.fetch_sub(1, Ordering::Relaxed);
        let _ = job.sink.send(Err(PipelineError::Cancelled));
    }
}

/// Run one batch, splitting and retrying on transient failures.
async fn dispatch(
    encoder: &Arc<dyn BatchEncoder>,
    kind: EncoderKind,
    mut batch: Vec<EncodeJob>,
    retries_left: u32,
) {
    match run_batch(encoder, kind, &batch).await {
        Ok(outcomes) => {
            if outcomes.len() != batch.len() {
                let message = format!(
                    "{kind} returned {} results for a batch of {}",
                    outcomes.len(),
                    batch.len()
                );
                for job in batch {
                    let _ = job.sink.send(Err(PipelineError::EncoderFatal {
                        message: message.clone(),
                    }));
                }
                return;
            }
            for (job, outcome) in batch.into_iter().zip(outcomes) {
                let _ = job.sink.send(outcome);
            }
        }
        Err(PipelineError::EncoderTransient { message }) if retries_left > 0 => {
            tracing::warn!(
                %kind,
                size = batch.len(),
                retries_left,
                "transient encoder failure, splitting batch: {message}"
            );
            if batch.len() > 1 {
                let right = batch.split_off(batch.len() / 2);
                Box::pin(dispatch(encoder, kind, batch, retries_left - 1)).await;
                Box::pin(dispatch(encoder, kind, right, retries_left - 1)).await;
            } else {
                Box::pin(dispatch(encoder, kind, batch, retries_left - 1)).await;
            }
        }
        Err(error) => {
            // Out of retries, or a non-transient failure: fail every item.
            let final_error = match error {
                PipelineError::EncoderTransient { message } => PipelineError::EncoderFatal {
                    message: format!("transient failure persisted through retries: {message}"),
                },
                other => other,
            };
            for job in batch {
                let _ = job.sink.send(Err(final_error.replicate()));
            }
        }
    }
}

/// Execute the blocking encode call off the async runtime.
async fn run_batch(
    encoder: &Arc<dyn BatchEncoder>,
    kind: EncoderKind,
    batch: &[EncodeJob],
) -> PipelineResult<Vec<PipelineResult<Vec<f32>>>> {
    let encoder = Arc::clone(encoder);
    if kind.is_text() {
        let texts: Vec<String> = batch
            .iter()
            .map(|job| match &job.input {
                JobInput::Text(text) => text.clone(),
                JobInput::Image(_) => unreachable!("image job on a text queue"),
            })
            .collect();
        let vectors = tokio::task::spawn_blocking(move || encoder.encode_text(kind, &texts))
            .await
            .map_err(|e| PipelineError::EncoderFatal {
                message: format!("encoder task join failed: {e}"),
            })??;
        Ok(vectors.into_iter().map(Ok).collect())
    } else {
        let paths: Vec<PathBuf> = batch
            .iter()
            .map(|job| match &job.input {
                JobInput::Image(path) => path.clone(),
                JobInput::Text(_) => unreachable!("text job on the vision queue"),
            })
            .collect();
        tokio::task::spawn_blocking(move || encoder.encode_images(&paths))
            .await
            .map_err(|e| PipelineError::EncoderFatal {
                message: format!("encoder task join failed: {e}"),
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CLIP_G_DIM, CLIP_L_DIM, SEMANTIC_DIM, VISION_DIM};
    use std::sync::atomic::AtomicU32;

    fn unit_vec(dim: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; dim];
        v[0] = 1.0;
        v
    }

    fn dim_for(kind: EncoderKind) -> usize {
        match kind {
            EncoderKind::SemanticText => SEMANTIC_DIM,
            EncoderKind::ClipLText => CLIP_L_DIM,
            EncoderKind::ClipGText => CLIP_G_DIM,
            EncoderKind::Vision => VISION_DIM,
        }
    }

    /// Counts calls and batch sizes; optionally fails transiently.
    struct StubEncoder {
        text_batches: Mutex<Vec<usize>>,
        image_batches: Mutex<Vec<usize>>,
        transient_failures: AtomicU32,
    }

    impl StubEncoder {
        fn new() -> Self {
            Self {
                text_batches: Mutex::new(Vec::new()),
                image_batches: Mutex::new(Vec::new()),
                transient_failures: AtomicU32::new(0),
            }
        }

        fn failing(times: u32) -> Self {
            let stub = Self::new();
            stub.transient_failures.store(times, Ordering::SeqCst);
            stub
        }
    }

    impl BatchEncoder for StubEncoder {
        fn configured(&self, _kind: EncoderKind) -> bool {
            true
        }

        fn encode_text(
            &self,
            kind: EncoderKind,
            batch: &[String],
        ) -> PipelineResult<Vec<Vec<f32>>> {
            if self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(PipelineError::EncoderTransient {
                    message: "simulated".to_string(),
                });
            }
            self.text_batches.lock().unwrap().push(batch.len());
            Ok(batch.iter().map(|_| unit_vec(dim_for(kind))).collect())
        }

        fn encode_images(
            &self,
            paths: &[PathBuf],
        ) -> PipelineResult<Vec<PipelineResult<Vec<f32>>>> {
            self.image_batches.lock().unwrap().push(paths.len());
            Ok(paths
                .iter()
                .map(|p| {
                    if p.to_string_lossy().contains("corrupt") {
                        Err(PipelineError::ImageDecode {
                            path: p.clone(),
                            message: "broken header".to_string(),
                        })
                    } else {
                        Ok(unit_vec(VISION_DIM))
                    }
                })
                .collect())
        }
    }

    fn scheduler_with(stub: Arc<StubEncoder>, linger_ms: u64) -> BatchScheduler {
        let batching = BatchingConfig {
            text_batch_size: 4,
            image_batch_size: 4,
            batch_linger_ms: linger_ms,
            queue_capacity_multiplier: 4,
        };
        BatchScheduler::new(stub, &batching, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_single_item_flushes_after_linger() {
        let stub = Arc::new(StubEncoder::new());
        let scheduler = scheduler_with(Arc::clone(&stub), 5);

        let vector = scheduler
            .submit_text(EncoderKind::ClipLText, "a red cube".to_string())
            .await
            .unwrap();
        assert_eq!(vector.len(), CLIP_L_DIM);
        assert_eq!(*stub.text_batches.lock().unwrap(), vec![1]);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_items_batch_together() {
        let stub = Arc::new(StubEncoder::new());
        let scheduler = Arc::new(scheduler_with(Arc::clone(&stub), 50));

        let mut handles = Vec::new();
        for i in 0..4 {
            let scheduler = Arc::clone(&scheduler);
            handles.push(tokio::spawn(async move {
                scheduler
                    .submit_text(EncoderKind::ClipGText, format!("prompt {i}"))
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        // Four producers against a linger of 50 ms coalesce into one batch.
        let batches = stub.text_batches.lock().unwrap().clone();
        assert_eq!(batches.iter().sum::<usize>(), 4);
        assert!(batches.len() <= 2, "expected coalesced batches: {batches:?}");
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_failure_splits_and_recovers() {
        // Fail the full batch once; the two halves then succeed.
        let stub = Arc::new(StubEncoder::failing(1));
        let scheduler = Arc::new(scheduler_with(Arc::clone(&stub), 50));

        let mut handles = Vec::new();
        for i in 0..4 {
            let scheduler = Arc::clone(&scheduler);
            handles.push(tokio::spawn(async move {
                scheduler
                    .submit_text(EncoderKind::SemanticText, format!("prompt {i}"))
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        let batches = stub.text_batches.lock().unwrap().clone();
        // Successful dispatches are the two halves of the failed batch.
        assert_eq!(batches.iter().sum::<usize>(), 4);
        assert!(batches.len() >= 2);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_exhausted_retries_become_fatal() {
        let stub = Arc::new(StubEncoder::failing(u32::MAX));
        let scheduler = scheduler_with(Arc::clone(&stub), 5);

        let err = scheduler
            .submit_text(EncoderKind::ClipLText, "doomed".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.kind_label(), "encoder_fatal");
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_bad_image_fails_alone() {
        let stub = Arc::new(StubEncoder::new());
        let scheduler = Arc::new(scheduler_with(Arc::clone(&stub), 50));

        let good = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.submit_image(PathBuf::from("ok.png")).await })
        };
        let bad = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(
                async move { scheduler.submit_image(PathBuf::from("corrupt.png")).await },
            )
        };

        assert!(good.await.unwrap().is_ok());
        let err = bad.await.unwrap().unwrap_err();
        assert_eq!(err.kind_label(), "image_decode");
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_scheduler_refuses_submissions() {
        let stub = Arc::new(StubEncoder::new());
        let cancel = CancellationToken::new();
        let batching = BatchingConfig::default();
        let scheduler = BatchScheduler::new(stub, &batching, cancel.clone());

        cancel.cancel();
        let err = scheduler
            .submit_text(EncoderKind::ClipLText, "late".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.kind_label(), "cancelled");
        scheduler.shutdown().await;
        assert_eq!(scheduler.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_work_item_fans_out_text_and_image() {
        let stub = Arc::new(StubEncoder::new());
        let scheduler = Arc::new(scheduler_with(Arc::clone(&stub), 5));

        let (tx, rx) = oneshot::channel();
        let item = WorkItem {
            image_id: 7,
            image_path: Some(PathBuf::from("seven.png")),
            prompt_fp: crate::fingerprint::prompt_fingerprint("a red cube", ""),
            prompt_text: "a red cube".to_string(),
            needs_text: true,
            needs_image: true,
            result_sink: tx,
        };
        scheduler.enqueue(item).await;

        let set = rx.await.unwrap().unwrap();
        assert!(set.text_semantic.is_some());
        assert!(set.text_clip_l.is_some());
        assert!(set.text_clip_g.is_some());
        assert!(set.image_vision.is_some());
        assert!(set.validate().is_ok());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_unconfigured_kind_is_unavailable() {
        struct VisionOnly;
        impl BatchEncoder for VisionOnly {
            fn configured(&self, kind: EncoderKind) -> bool {
                kind == EncoderKind::Vision
            }
            fn encode_text(
                &self,
                _kind: EncoderKind,
                _batch: &[String],
            ) -> PipelineResult<Vec<Vec<f32>>> {
                unreachable!()
            }
            fn encode_images(
                &self,
                paths: &[PathBuf],
            ) -> PipelineResult<Vec<PipelineResult<Vec<f32>>>> {
                Ok(paths.iter().map(|_| Ok(unit_vec(VISION_DIM))).collect())
            }
        }

        let batching = BatchingConfig::default();
        let scheduler = BatchScheduler::new(Arc::new(VisionOnly), &batching, CancellationToken::new());
        let err = scheduler
            .submit_text(EncoderKind::ClipLText, "nope".to_string())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::EncoderUnavailable(EncoderKind::ClipLText)
        ));
        scheduler.shutdown().await;
    }
}
