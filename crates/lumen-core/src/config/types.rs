//! Sub-configuration structs with pipeline defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::{CLIP_G_DIM, CLIP_L_DIM, SEMANTIC_DIM, VISION_DIM};

/// Which encoder sessions to load. Any subset may be configured; absent
/// sections leave the corresponding `EmbeddingSet` component null.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodersConfig {
    pub semantic: Option<SemanticEncoderConfig>,
    pub clip_l: Option<ClipEncoderConfig>,
    pub clip_g: Option<ClipEncoderConfig>,
    pub vision: Option<VisionEncoderConfig>,
}

/// The WordPiece-fed semantic text encoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticEncoderConfig {
    /// Path to the exported inference graph
    pub model_path: PathBuf,

    /// Line-indexed vocabulary file
    pub vocab_path: PathBuf,

    /// Accelerator to bind (0-based); None runs on CPU
    pub device: Option<u32>,

    /// Maximum token sequence length
    pub max_len: usize,

    /// Output vector dimension
    pub dim: usize,
}

impl Default for SemanticEncoderConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            vocab_path: PathBuf::new(),
            device: None,
            max_len: 512,
            dim: SEMANTIC_DIM,
        }
    }
}

/// A CLIP text encoder (L or G variant).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipEncoderConfig {
    pub model_path: PathBuf,

    /// Token-to-id vocabulary JSON
    pub vocab_path: PathBuf,

    /// Ordered BPE merges list
    pub merges_path: PathBuf,

    pub device: Option<u32>,

    /// Fixed token sequence length
    pub context_len: usize,

    /// Output vector dimension: 768 for L, 1280 for G
    pub dim: usize,
}

impl Default for ClipEncoderConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            vocab_path: PathBuf::new(),
            merges_path: PathBuf::new(),
            device: None,
            context_len: 77,
            dim: CLIP_L_DIM,
        }
    }
}

impl ClipEncoderConfig {
    /// A config pre-sized for the G variant.
    pub fn clip_g() -> Self {
        Self {
            dim: CLIP_G_DIM,
            ..Self::default()
        }
    }
}

/// The vision encoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionEncoderConfig {
    pub model_path: PathBuf,

    pub device: Option<u32>,

    /// Square input edge length in pixels
    pub image_size: u32,

    /// Output vector dimension
    pub dim: usize,
}

impl Default for VisionEncoderConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            device: None,
            image_size: 224,
            dim: VISION_DIM,
        }
    }
}

/// Batch formation and queue sizing for the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Items per text batch
    pub text_batch_size: usize,

    /// Items per image batch
    pub image_batch_size: usize,

    /// Max wait since the oldest pending item before a partial batch runs
    pub batch_linger_ms: u64,

    /// Producer-facing queue capacity, as a multiple of the batch size
    pub queue_capacity_multiplier: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            text_batch_size: 64,
            image_batch_size: 32,
            batch_linger_ms: 25,
            queue_capacity_multiplier: 4,
        }
    }
}

/// How a session treats device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryMode {
    /// Exact-size allocations, restricted workspace, default algorithms
    Conservative,
    /// Power-of-two arena growth, unrestricted workspace, exhaustive
    /// algorithm search
    Aggressive,
}

/// Inference session knobs shared by every encoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub memory_mode: MemoryMode,

    /// Hard cap on device memory per session, 0 = unbounded
    pub mem_limit_bytes: u64,

    /// Total device memory available per accelerator, 0 = unenforced
    pub device_capacity_bytes: u64,

    /// Helper thread counts; 0 lets the runtime decide
    pub inter_op_threads: usize,
    pub intra_op_threads: usize,

    /// Graph optimization: "all" unless a model mis-optimizes
    /// ("disable", "basic", "extended", "all")
    pub graph_opt_level: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            memory_mode: MemoryMode::Conservative,
            mem_limit_bytes: 0,
            device_capacity_bytes: 0,
            inter_op_threads: 0,
            intra_op_threads: 0,
            graph_opt_level: "all".to_string(),
        }
    }
}

/// Store I/O resilience settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Deadline for one store operation
    pub io_timeout_secs: u64,

    /// Max retries for transient store failures
    pub retry_attempts: u32,

    /// Linear backoff step between retries
    pub retry_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            io_timeout_secs: 30,
            retry_attempts: 10,
            retry_delay_ms: 500,
        }
    }
}
