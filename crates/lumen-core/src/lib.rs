//! Lumen Core - Embedding generation and deduplication for AI image
//! libraries.
//!
//! Lumen turns a corpus of generated images and their prompts into dense
//! vector embeddings suitable for nearest-neighbor search, deduplicating
//! the work along the way: identical prompts and identical generation
//! parameter groups share one computed vector.
//!
//! # Architecture
//!
//! ```text
//! Scanner -> Orchestrator -> Planner -> Scheduler
//!     -> (Tokenizers + Preprocessor) -> Encoder Pool -> Cache + Store
//! ```
//!
//! Control flow is pull-based: per-session consumer tasks pull work items
//! into batches, producers suspend on full queues, and results flow back
//! through the reference-counted embedding cache.
//!
//! # Usage
//!
//! ```rust,ignore
//! use lumen_core::{Config, PipelineOrchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> lumen_core::Result<()> {
//!     let config = Config::load()?;
//!     let orchestrator = PipelineOrchestrator::new(&config, store)?;
//!
//!     let cancel = CancellationToken::new();
//!     orchestrator.preload_prompts(None, progress, &cancel).await?;
//!     orchestrator.process_all(32, progress, &cancel).await?;
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod dedup;
pub mod encoder;
pub mod error;
pub mod fingerprint;
pub(crate) mod math;
pub mod pipeline;
pub mod store;
pub mod tokenizer;
pub mod types;

// Re-exports for convenient access
pub use cache::EmbeddingCache;
pub use config::Config;
pub use encoder::{BatchEncoder, ClipVariant, EncoderKind, EncoderPool, EncoderSession};
pub use error::{ConfigError, LumenError, PipelineError, PipelineResult, Result};
pub use pipeline::{BatchScheduler, PipelineOrchestrator, ProgressSink, WorkItem};
pub use store::Store;
pub use tokenizer::{ClipBpeTokenizer, TextTokenizer, WordPieceTokenizer};
pub use types::{
    CacheEntry, CacheStats, ContentKind, EmbeddingSet, Fingerprint, GenerationParameters,
    ImageEmbeddingRequest, ImageRecord, Progress, ProgressStage, RepresentativeGroup, Statistics,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
