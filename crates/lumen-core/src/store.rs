//! The persistent store collaborator.
//!
//! The pipeline does not implement long-term persistence; it talks to this
//! trait. Implementations are expected to be transactional: related writes
//! (an embedding row plus its reference-count bump) commit atomically.

use async_trait::async_trait;

use crate::error::PipelineResult;
use crate::types::{CacheEntry, EmbeddingSet, Fingerprint, ImageRecord, RepresentativeGroup};

#[async_trait]
pub trait Store: Send + Sync {
    /// Look up a persisted embedding entry by content fingerprint.
    async fn get_embedding_by_fingerprint(
        &self,
        fp: &Fingerprint,
    ) -> PipelineResult<Option<CacheEntry>>;

    /// Persist a new embedding entry, returning its assigned id.
    async fn insert_embedding(&self, entry: &CacheEntry) -> PipelineResult<i64>;

    async fn incref(&self, entry_id: i64) -> PipelineResult<()>;

    async fn decref(&self, entry_id: i64) -> PipelineResult<()>;

    /// Delete all entries whose reference count is zero.
    async fn delete_unused_embeddings(&self) -> PipelineResult<usize>;

    /// Distinct `(prompt, negative_prompt)` pairs known to the store.
    async fn distinct_prompt_pairs(
        &self,
        limit: Option<usize>,
    ) -> PipelineResult<Vec<(String, String)>>;

    /// Images that do not yet have persisted embeddings.
    async fn images_missing_embeddings(&self) -> PipelineResult<Vec<ImageRecord>>;

    /// Bulk helper: fill in missing metadata hashes store-side.
    async fn compute_and_persist_metadata_hashes(&self) -> PipelineResult<()>;

    /// Store-side representative selection. Must satisfy the same contract
    /// as the in-process planner.
    async fn select_representatives(&self) -> PipelineResult<Vec<RepresentativeGroup>>;

    /// Persist the vectors computed for one image.
    async fn store_image_embeddings(
        &self,
        image_id: i64,
        embeddings: &EmbeddingSet,
        is_representative: bool,
    ) -> PipelineResult<()>;

    /// Copy every representative's vectors to the non-representative
    /// members of its group. Returns the number of images written.
    async fn copy_embeddings_to_group_non_representatives(&self) -> PipelineResult<usize>;

    async fn image_count(&self) -> PipelineResult<usize>;

    async fn image_needs_embedding(&self, image_id: i64) -> PipelineResult<bool>;
}
