//! Encoder sessions and the pool that dispatches batches to them.
//!
//! The pool holds up to four sessions (semantic text, CLIP-L text, CLIP-G
//! text, vision); any subset may be configured. Vectors never leave the
//! pool un-normalized.

pub(crate) mod preprocess;
pub(crate) mod session;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::error::{ConfigError, PipelineError, PipelineResult};
use crate::math;
use crate::tokenizer::{ClipBpeTokenizer, TextTokenizer, WordPieceTokenizer};
use crate::types::EmbeddingSet;

pub use preprocess::{load_image, load_image_from_bytes, preprocess, stack_batch};
pub use session::{EncoderSession, Pooling};

/// Identifies one encoder session slot in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncoderKind {
    SemanticText,
    ClipLText,
    ClipGText,
    Vision,
}

impl EncoderKind {
    /// All slots, in dispatch order.
    pub const ALL: [EncoderKind; 4] = [
        EncoderKind::SemanticText,
        EncoderKind::ClipLText,
        EncoderKind::ClipGText,
        EncoderKind::Vision,
    ];

    pub fn is_text(&self) -> bool {
        !matches!(self, EncoderKind::Vision)
    }

    /// Input tensors the bound graph must accept.
    pub fn required_inputs(&self) -> &'static [&'static str] {
        match self {
            EncoderKind::SemanticText => &["input_ids", "attention_mask"],
            EncoderKind::ClipLText | EncoderKind::ClipGText => &["input_ids"],
            EncoderKind::Vision => &["pixel_values"],
        }
    }
}

impl fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EncoderKind::SemanticText => "semantic-text",
            EncoderKind::ClipLText => "clip-l-text",
            EncoderKind::ClipGText => "clip-g-text",
            EncoderKind::Vision => "vision",
        };
        f.write_str(s)
    }
}

/// Which CLIP text encoder to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipVariant {
    L,
    G,
}

/// The batch-level encoding seam the scheduler dispatches through.
///
/// `EncoderPool` is the production implementation; tests substitute stubs
/// so scheduling behavior can be exercised without ONNX graphs.
pub trait BatchEncoder: Send + Sync + 'static {
    /// Whether the given session slot is configured.
    fn configured(&self, kind: EncoderKind) -> bool;

    /// Encode a homogeneous text batch. Blocking.
    fn encode_text(&self, kind: EncoderKind, batch: &[String]) -> PipelineResult<Vec<Vec<f32>>>;

    /// Encode an image batch with per-item decode outcomes. Blocking.
    ///
    /// The outer error covers whole-batch inference failures; inner errors
    /// are per-item decode problems that must not sink the batch.
    fn encode_images(&self, paths: &[PathBuf]) -> PipelineResult<Vec<PipelineResult<Vec<f32>>>>;
}

/// One text session plus the tokenizer feeding it.
struct TextEncoder {
    session: EncoderSession,
    tokenizer: TextTokenizer,
}

impl TextEncoder {
    fn encode_batch(&self, texts: &[String]) -> PipelineResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let encoded: Vec<_> = texts.iter().map(|t| self.tokenizer.encode(t)).collect();
        let seq_len = encoded
            .iter()
            .map(|e| e.input_ids.len())
            .max()
            .unwrap_or(0);

        // Flatten to row-major [batch, seq_len], padding short rows with
        // id 0 and mask 0.
        let batch = encoded.len();
        let mut input_ids = vec![0i64; batch * seq_len];
        let mut attention_mask = vec![0i64; batch * seq_len];
        for (row, e) in encoded.iter().enumerate() {
            let base = row * seq_len;
            input_ids[base..base + e.input_ids.len()].copy_from_slice(&e.input_ids);
            attention_mask[base..base + e.attention_mask.len()]
                .copy_from_slice(&e.attention_mask);
        }

        let mask = self
            .tokenizer
            .wants_attention_mask()
            .then_some(attention_mask);
        let mut vectors = self.session.run_text(batch, seq_len, input_ids, mask)?;
        for v in vectors.iter_mut() {
            math::l2_normalize_in_place(v);
        }
        Ok(vectors)
    }
}

/// The vision session plus its preprocessing size.
struct VisionEncoder {
    session: EncoderSession,
    image_size: u32,
}

impl VisionEncoder {
    /// Encode a batch of image files, reporting decode failures per item.
    fn encode_batch(&self, paths: &[PathBuf]) -> PipelineResult<Vec<PipelineResult<Vec<f32>>>> {
        let mut slots: Vec<Option<PipelineError>> = Vec::with_capacity(paths.len());
        let mut tensors = Vec::new();
        for path in paths {
            match load_image(path).map(|img| preprocess(&img, self.image_size)) {
                Ok(tensor) => {
                    tensors.push(tensor);
                    slots.push(None);
                }
                Err(e) => {
                    tracing::debug!(path = %path.display(), "image skipped: {e}");
                    slots.push(Some(e));
                }
            }
        }

        let mut vectors = if tensors.is_empty() {
            Vec::new()
        } else {
            let batch = stack_batch(&tensors);
            let mut vectors = self.session.run_vision(batch)?;
            for v in vectors.iter_mut() {
                math::l2_normalize_in_place(v);
            }
            vectors
        };

        // Scatter inference results back into per-item slots.
        let mut results = Vec::with_capacity(paths.len());
        let mut next = 0usize;
        for slot in slots {
            match slot {
                Some(e) => results.push(Err(e)),
                None => {
                    results.push(Ok(std::mem::take(&mut vectors[next])));
                    next += 1;
                }
            }
        }
        Ok(results)
    }
}

/// Dispatches tensor batches to whichever sessions are configured.
pub struct EncoderPool {
    semantic: Option<TextEncoder>,
    clip_l: Option<TextEncoder>,
    clip_g: Option<TextEncoder>,
    vision: Option<VisionEncoder>,
}

impl EncoderPool {
    /// Build sessions and tokenizers for every configured encoder.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let session_cfg = &config.session;
        let mut budget = DeviceBudget::new(session_cfg.device_capacity_bytes);

        let semantic = config
            .encoders
            .semantic
            .as_ref()
            .map(|c| -> Result<TextEncoder, ConfigError> {
                budget.claim(c.device, session_cfg.mem_limit_bytes)?;
                let tokenizer = WordPieceTokenizer::from_file(&c.vocab_path, c.max_len)?;
                let session = EncoderSession::load(
                    EncoderKind::SemanticText,
                    &c.model_path,
                    c.device,
                    session_cfg,
                    "last_hidden_state",
                    Pooling::Mean,
                    c.dim,
                )?;
                Ok(TextEncoder {
                    session,
                    tokenizer: TextTokenizer::WordPiece(tokenizer),
                })
            })
            .transpose()?;

        let load_clip = |kind: EncoderKind,
                             c: &crate::config::ClipEncoderConfig,
                             budget: &mut DeviceBudget|
         -> Result<TextEncoder, ConfigError> {
            budget.claim(c.device, session_cfg.mem_limit_bytes)?;
            let tokenizer =
                ClipBpeTokenizer::from_files(&c.vocab_path, &c.merges_path, c.context_len)?;
            let session = EncoderSession::load(
                kind,
                &c.model_path,
                c.device,
                session_cfg,
                "last_hidden_state",
                Pooling::FirstToken,
                c.dim,
            )?;
            Ok(TextEncoder {
                session,
                tokenizer: TextTokenizer::ClipBpe(tokenizer),
            })
        };

        let clip_l = config
            .encoders
            .clip_l
            .as_ref()
            .map(|c| load_clip(EncoderKind::ClipLText, c, &mut budget))
            .transpose()?;
        let clip_g = config
            .encoders
            .clip_g
            .as_ref()
            .map(|c| load_clip(EncoderKind::ClipGText, c, &mut budget))
            .transpose()?;

        let vision = config
            .encoders
            .vision
            .as_ref()
            .map(|c| -> Result<VisionEncoder, ConfigError> {
                budget.claim(c.device, session_cfg.mem_limit_bytes)?;
                let session = EncoderSession::load(
                    EncoderKind::Vision,
                    &c.model_path,
                    c.device,
                    session_cfg,
                    "pooler_output",
                    Pooling::PoolerOutput,
                    c.dim,
                )?;
                Ok(VisionEncoder {
                    session,
                    image_size: c.image_size,
                })
            })
            .transpose()?;

        Ok(Self {
            semantic,
            clip_l,
            clip_g,
            vision,
        })
    }

    fn text_encoder(&self, kind: EncoderKind) -> PipelineResult<&TextEncoder> {
        let slot = match kind {
            EncoderKind::SemanticText => self.semantic.as_ref(),
            EncoderKind::ClipLText => self.clip_l.as_ref(),
            EncoderKind::ClipGText => self.clip_g.as_ref(),
            EncoderKind::Vision => None,
        };
        slot.ok_or(PipelineError::EncoderUnavailable(kind))
    }

    /// Encode texts with the semantic encoder, 1024-d normalized vectors.
    pub fn encode_text_semantic(&self, batch: &[String]) -> PipelineResult<Vec<Vec<f32>>> {
        self.text_encoder(EncoderKind::SemanticText)?
            .encode_batch(batch)
    }

    /// Encode texts with one of the CLIP text encoders.
    pub fn encode_text_clip(
        &self,
        variant: ClipVariant,
        batch: &[String],
    ) -> PipelineResult<Vec<Vec<f32>>> {
        let kind = match variant {
            ClipVariant::L => EncoderKind::ClipLText,
            ClipVariant::G => EncoderKind::ClipGText,
        };
        self.text_encoder(kind)?.encode_batch(batch)
    }

    /// Encode images, failing the whole call on the first bad item.
    pub fn encode_image(&self, paths: &[PathBuf]) -> PipelineResult<Vec<Vec<f32>>> {
        self.encode_images(paths)?.into_iter().collect()
    }

    /// Encode the prompt and image across all configured sessions
    /// concurrently, returning the merged set.
    pub async fn encode_all(
        self: &Arc<Self>,
        prompt: &str,
        image_path: Option<&Path>,
    ) -> PipelineResult<EmbeddingSet> {
        let mut tasks = Vec::new();
        for kind in EncoderKind::ALL {
            if !self.configured(kind) {
                continue;
            }
            if kind == EncoderKind::Vision && image_path.is_none() {
                continue;
            }
            let pool = Arc::clone(self);
            let prompt = prompt.to_string();
            let image = image_path.map(Path::to_path_buf);
            tasks.push(tokio::task::spawn_blocking(move || {
                let vector = match kind {
                    EncoderKind::Vision => {
                        let path = image.expect("vision task requires a path");
                        pool.encode_image(std::slice::from_ref(&path))?
                            .pop()
                            .ok_or_else(|| PipelineError::EncoderFatal {
                                message: "vision encoder returned no vector".to_string(),
                            })?
                    }
                    _ => pool
                        .encode_text(kind, std::slice::from_ref(&prompt))?
                        .pop()
                        .ok_or_else(|| PipelineError::EncoderFatal {
                            message: format!("{kind} returned no vector"),
                        })?,
                };
                Ok::<_, PipelineError>((kind, vector))
            }));
        }

        let mut set = EmbeddingSet::default();
        for task in tasks {
            let (kind, vector) = task.await.map_err(|e| PipelineError::EncoderFatal {
                message: format!("encoder task join failed: {e}"),
            })??;
            match kind {
                EncoderKind::SemanticText => set.text_semantic = Some(vector),
                EncoderKind::ClipLText => set.text_clip_l = Some(vector),
                EncoderKind::ClipGText => set.text_clip_g = Some(vector),
                EncoderKind::Vision => set.image_vision = Some(vector),
            }
        }
        Ok(set)
    }
}

impl BatchEncoder for EncoderPool {
    fn configured(&self, kind: EncoderKind) -> bool {
        match kind {
            EncoderKind::SemanticText => self.semantic.is_some(),
            EncoderKind::ClipLText => self.clip_l.is_some(),
            EncoderKind::ClipGText => self.clip_g.is_some(),
            EncoderKind::Vision => self.vision.is_some(),
        }
    }

    fn encode_text(&self, kind: EncoderKind, batch: &[String]) -> PipelineResult<Vec<Vec<f32>>> {
        self.text_encoder(kind)?.encode_batch(batch)
    }

    fn encode_images(&self, paths: &[PathBuf]) -> PipelineResult<Vec<PipelineResult<Vec<f32>>>> {
        self.vision
            .as_ref()
            .ok_or(PipelineError::EncoderUnavailable(EncoderKind::Vision))?
            .encode_batch(paths)
    }
}

/// Tracks claimed device memory so the pool refuses sessions that would
/// exceed the configured capacity.
struct DeviceBudget {
    capacity: u64,
    claimed: std::collections::HashMap<u32, u64>,
}

impl DeviceBudget {
    fn new(capacity: u64) -> Self {
        Self {
            capacity,
            claimed: std::collections::HashMap::new(),
        }
    }

    fn claim(&mut self, device: Option<u32>, mem_limit: u64) -> Result<(), ConfigError> {
        let (Some(device), true) = (device, self.capacity > 0) else {
            return Ok(());
        };
        let claimed = self.claimed.entry(device).or_insert(0);
        let requested = if mem_limit > 0 {
            mem_limit
        } else {
            // An unbounded session on a budgeted device claims it whole.
            self.capacity
        };
        if *claimed + requested > self.capacity {
            return Err(ConfigError::Validation(format!(
                "device {device} memory budget exceeded: {} + {requested} > {}",
                *claimed, self.capacity
            )));
        }
        *claimed += requested;
        Ok(())
    }
}
