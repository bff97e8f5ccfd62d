//! Core data types for the Lumen embedding pipeline.
//!
//! These types flow between the planner, the cache, the scheduler, and the
//! persistent store. They are deliberately plain data: all policy lives in
//! the components that consume them.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::PipelineError;
use crate::math;

/// Dimension of the semantic text embedding.
pub const SEMANTIC_DIM: usize = 1024;

/// Dimension of the CLIP-L text embedding.
pub const CLIP_L_DIM: usize = 768;

/// Dimension of the CLIP-G text embedding.
pub const CLIP_G_DIM: usize = 1280;

/// Dimension of the vision embedding.
pub const VISION_DIM: usize = 1280;

/// Tolerance for the unit-norm check on stored vectors.
pub const NORM_EPSILON: f32 = 1e-6;

/// A 32-byte content digest used as a cache key and group identifier.
///
/// Rendered as a 64-character lowercase hex string wherever a textual key
/// is required, including its serde representation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    /// Render as 64 lowercase hex characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Fingerprint(arr))
    }

    /// Shard selector: the first digest byte.
    pub fn shard(&self) -> usize {
        self.0[0] as usize
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&s)
            .ok_or_else(|| D::Error::custom(format!("invalid fingerprint hex: {s}")))
    }
}

/// What a cache entry's vectors were computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Prompt,
    NegativePrompt,
    Image,
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContentKind::Prompt => "prompt",
            ContentKind::NegativePrompt => "negative_prompt",
            ContentKind::Image => "image",
        };
        f.write_str(s)
    }
}

/// How an image was produced. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    pub prompt: String,
    pub negative_prompt: String,
    pub model_name: String,
    pub seed: i64,
    pub steps: u32,
    pub cfg_scale: f64,
    pub sampler: String,
    pub scheduler: String,
    pub width: u32,
    pub height: u32,
}

/// One scanned image known to the store.
///
/// `width` and `height` are the decoded pixel dimensions of the file on
/// disk; `params.width`/`params.height` record what the generator was asked
/// for. The two differ for upscaled variants of a render.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: i64,
    pub path: PathBuf,
    pub file_size: u64,
    pub width: u32,
    pub height: u32,
    pub params: GenerationParameters,
    /// Digest of the canonical parameter string, filled in by the planner
    /// when absent.
    pub metadata_hash: Option<Fingerprint>,
}

/// The full set of vectors computed for one piece of content.
///
/// A `None` component means the corresponding encoder was not configured,
/// or does not apply to the content kind. Present components carry fixed
/// dimensions and unit L2 norm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingSet {
    pub text_semantic: Option<Vec<f32>>,
    pub text_clip_l: Option<Vec<f32>>,
    pub text_clip_g: Option<Vec<f32>>,
    pub image_vision: Option<Vec<f32>>,
}

impl EmbeddingSet {
    /// True when no component is present.
    pub fn is_empty(&self) -> bool {
        self.text_semantic.is_none()
            && self.text_clip_l.is_none()
            && self.text_clip_g.is_none()
            && self.image_vision.is_none()
    }

    /// Check dimension fixity and unit norm for every present component.
    ///
    /// The zero vector is accepted for degenerate empty-input cases.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let checks: [(&str, &Option<Vec<f32>>, usize); 4] = [
            ("text_semantic", &self.text_semantic, SEMANTIC_DIM),
            ("text_clip_l", &self.text_clip_l, CLIP_L_DIM),
            ("text_clip_g", &self.text_clip_g, CLIP_G_DIM),
            ("image_vision", &self.image_vision, VISION_DIM),
        ];
        for (name, component, dim) in checks {
            let Some(v) = component else { continue };
            if v.len() != dim {
                return Err(PipelineError::EncoderFatal {
                    message: format!("{name} has dimension {}, expected {dim}", v.len()),
                });
            }
            if !math::is_unit_or_zero(v, NORM_EPSILON) {
                return Err(PipelineError::EncoderFatal {
                    message: format!("{name} is not L2-normalized"),
                });
            }
        }
        Ok(())
    }

    /// Merge another set into this one, taking components this set lacks.
    pub fn merge(&mut self, other: &EmbeddingSet) {
        if self.text_semantic.is_none() {
            self.text_semantic = other.text_semantic.clone();
        }
        if self.text_clip_l.is_none() {
            self.text_clip_l = other.text_clip_l.clone();
        }
        if self.text_clip_g.is_none() {
            self.text_clip_g = other.text_clip_g.clone();
        }
        if self.image_vision.is_none() {
            self.image_vision = other.image_vision.clone();
        }
    }
}

/// A cached, reference-counted embedding computation.
///
/// The cache hands out `Arc` views of the vectors; the entry itself is
/// owned exclusively by the cache (and mirrored in the store).
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Store-assigned id, 0 until the write-through insert completes.
    pub entry_id: i64,
    pub fingerprint: Fingerprint,
    pub content_kind: ContentKind,
    pub embeddings: Arc<EmbeddingSet>,
    pub ref_count: u32,
    pub created_at: SystemTime,
    pub last_used_at: SystemTime,
}

/// A class of near-duplicate images sharing one metadata fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepresentativeGroup {
    pub metadata_fp: Fingerprint,
    pub representative_image_id: i64,
    pub member_image_ids: BTreeSet<i64>,
}

/// Pipeline stage reported through the progress sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Hashing,
    Selecting,
    Encoding,
    Fanout,
    Done,
}

/// One progress report delivered to the caller-supplied sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub stage: ProgressStage,
    pub current: u64,
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Cache accounting exposed through `statistics()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Entries resident in the in-memory tier
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, 0 when nothing was looked up yet
    pub hit_rate: f64,
}

/// A snapshot of pipeline counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub cache: CacheStats,
    /// Images whose embeddings were persisted in this orchestrator's lifetime
    pub images_processed: u64,
    /// Images that failed permanently
    pub images_failed: u64,
    /// Failure counts keyed by error kind label
    pub failures_by_kind: std::collections::HashMap<String, u64>,
    /// Work items currently queued for the encoder sessions
    pub queue_depth: usize,
}

/// Argument to `process_one`: the image to embed and persist.
#[derive(Debug, Clone)]
pub struct ImageEmbeddingRequest {
    pub record: ImageRecord,
}
