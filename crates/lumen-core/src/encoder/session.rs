//! ONNX Runtime session management for one encoder graph.
//!
//! Each session wraps a single loaded graph bound to one device. `run` is
//! a blocking FFI call and most runtimes do not document concurrent `run`
//! on one session as safe, so the session serializes callers behind a
//! `Mutex`; parallelism comes from distinct sessions on distinct devices.

use std::path::Path;
use std::sync::Mutex;

use ndarray::Array4;
use ort::ep::cuda::ConvAlgorithmSearch;
use ort::ep::{
    ArenaExtendStrategy, CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider,
    ExecutionProviderDispatch,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;

use crate::config::{MemoryMode, SessionConfig};
use crate::error::{ConfigError, PipelineError, PipelineResult};

use super::EncoderKind;

/// How a raw graph output becomes one vector per batch row.
///
/// Which variant a given export needs depends on how the graph was
/// produced; the per-model defaults live in the pool and are pinned by the
/// recorded-vector tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pooling {
    /// Row 0 of `last_hidden_state` per batch entry (CLIP text convention)
    FirstToken,
    /// Attention-mask-weighted mean over `last_hidden_state`
    Mean,
    /// The graph's own pooled output, shape `[batch, dim]`
    PoolerOutput,
}

#[derive(Debug)]
pub struct EncoderSession {
    kind: EncoderKind,
    session: Mutex<Session>,
    output_name: String,
    pooling: Pooling,
    dim: usize,
    /// True when a CUDA provider was registered for this session.
    accelerated: bool,
}

impl EncoderSession {
    /// Load a graph and bind it to `device` (None or unavailable = CPU).
    ///
    /// Device unavailability is not an error: the session falls back to
    /// CPU and logs a warning. A missing or unusable graph file is.
    pub fn load(
        kind: EncoderKind,
        model_path: &Path,
        device: Option<u32>,
        session_cfg: &SessionConfig,
        output_name: &str,
        pooling: Pooling,
        dim: usize,
    ) -> Result<Self, ConfigError> {
        if !model_path.exists() {
            return Err(ConfigError::ModelMissing {
                path: model_path.to_path_buf(),
            });
        }

        let (eps, accelerated) = execution_providers(kind, device, session_cfg);

        let builder = Session::builder()
            .and_then(|b| b.with_optimization_level(opt_level(session_cfg)))
            .map_err(|e| ConfigError::ModelMalformed {
                path: model_path.to_path_buf(),
                message: format!("session builder failed: {e}"),
            })?;
        let builder = apply_threads(builder, session_cfg).map_err(|e| {
            ConfigError::ModelMalformed {
                path: model_path.to_path_buf(),
                message: format!("thread configuration failed: {e}"),
            }
        })?;

        // Registration failures degrade to CPU rather than failing load.
        let builder = match builder.with_execution_providers(eps) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(%kind, "execution provider setup failed, using CPU: {e}");
                let b = Session::builder()
                    .and_then(|b| b.with_optimization_level(opt_level(session_cfg)))
                    .map_err(|e| ConfigError::ModelMalformed {
                        path: model_path.to_path_buf(),
                        message: format!("session builder failed: {e}"),
                    })?;
                apply_threads(b, session_cfg).map_err(|e| ConfigError::ModelMalformed {
                    path: model_path.to_path_buf(),
                    message: format!("thread configuration failed: {e}"),
                })?
            }
        };

        let session =
            builder
                .commit_from_file(model_path)
                .map_err(|e| ConfigError::ModelMalformed {
                    path: model_path.to_path_buf(),
                    message: format!("failed to load graph: {e}"),
                })?;

        // The graph must expose the inputs this encoder kind feeds.
        let input_names: Vec<String> = session
            .inputs()
            .iter()
            .map(|i| i.name().to_string())
            .collect();
        for required in kind.required_inputs() {
            if !input_names.iter().any(|n| n == required) {
                return Err(ConfigError::ModelMalformed {
                    path: model_path.to_path_buf(),
                    message: format!("graph lacks required input {required}"),
                });
            }
        }

        tracing::info!(
            %kind,
            model = %model_path.display(),
            inputs = ?input_names,
            accelerated,
            "loaded encoder session"
        );

        Ok(Self {
            kind,
            session: Mutex::new(session),
            output_name: output_name.to_string(),
            pooling,
            dim,
            accelerated,
        })
    }

    pub fn kind(&self) -> EncoderKind {
        self.kind
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn is_accelerated(&self) -> bool {
        self.accelerated
    }

    /// Run a text batch of `batch x seq_len` token ids.
    ///
    /// Returns one un-normalized `dim`-sized vector per batch row.
    pub fn run_text(
        &self,
        batch: usize,
        seq_len: usize,
        input_ids: Vec<i64>,
        attention_mask: Option<Vec<i64>>,
    ) -> PipelineResult<Vec<Vec<f32>>> {
        debug_assert_eq!(input_ids.len(), batch * seq_len);
        let mask_for_pooling = attention_mask.clone();

        let shape = vec![batch as i64, seq_len as i64];
        let ids_value = Value::from_array((shape.clone(), input_ids)).map_err(transient)?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| PipelineError::EncoderFatal {
                message: format!("session lock poisoned: {e}"),
            })?;
        let outputs = match attention_mask {
            Some(mask) => {
                let mask_value = Value::from_array((shape, mask)).map_err(transient)?;
                session.run(ort::inputs![
                    "input_ids" => ids_value,
                    "attention_mask" => mask_value
                ])
            }
            None => session.run(ort::inputs!["input_ids" => ids_value]),
        }
        .map_err(transient)?;

        let output = outputs
            .iter()
            .find(|(name, _)| *name == self.output_name)
            .ok_or_else(|| PipelineError::OutputMissing {
                name: self.output_name.clone(),
            })?;
        let (shape, data) =
            output
                .1
                .try_extract_tensor::<f32>()
                .map_err(|e| PipelineError::EncoderFatal {
                    message: format!("failed to extract {}: {e}", self.output_name),
                })?;

        self.pool(shape, data, batch, seq_len, mask_for_pooling.as_deref())
    }

    /// Run a vision batch of NCHW pixel values.
    pub fn run_vision(&self, pixel_values: Array4<f32>) -> PipelineResult<Vec<Vec<f32>>> {
        let batch = pixel_values.shape()[0];
        let shape: Vec<i64> = pixel_values.shape().iter().map(|&d| d as i64).collect();
        let flat: Vec<f32> = pixel_values.iter().copied().collect();
        let value = Value::from_array((shape, flat)).map_err(transient)?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| PipelineError::EncoderFatal {
                message: format!("session lock poisoned: {e}"),
            })?;
        let outputs = session
            .run(ort::inputs!["pixel_values" => value])
            .map_err(transient)?;

        let output = outputs
            .iter()
            .find(|(name, _)| *name == self.output_name)
            .ok_or_else(|| PipelineError::OutputMissing {
                name: self.output_name.clone(),
            })?;
        let (shape, data) =
            output
                .1
                .try_extract_tensor::<f32>()
                .map_err(|e| PipelineError::EncoderFatal {
                    message: format!("failed to extract {}: {e}", self.output_name),
                })?;

        self.pool(shape, data, batch, 0, None)
    }

    /// Pool a raw output tensor down to one vector per batch row.
    fn pool(
        &self,
        shape: &[i64],
        data: &[f32],
        batch: usize,
        seq_len: usize,
        mask: Option<&[i64]>,
    ) -> PipelineResult<Vec<Vec<f32>>> {
        let vectors = match self.pooling {
            Pooling::PoolerOutput => {
                let dim = pooled_dim(shape, 2)?;
                data.chunks(dim).take(batch).map(|c| c.to_vec()).collect()
            }
            Pooling::FirstToken => {
                let dim = pooled_dim(shape, 3)?;
                let seq = shape[1] as usize;
                (0..batch)
                    .map(|b| data[b * seq * dim..b * seq * dim + dim].to_vec())
                    .collect::<Vec<_>>()
            }
            Pooling::Mean => {
                let dim = pooled_dim(shape, 3)?;
                let seq = shape[1] as usize;
                (0..batch)
                    .map(|b| {
                        let rows = &data[b * seq * dim..(b + 1) * seq * dim];
                        let row_mask =
                            mask.map(|m| &m[b * seq_len..b * seq_len + seq.min(seq_len)]);
                        mean_pool(rows, seq, dim, row_mask)
                    })
                    .collect::<Vec<_>>()
            }
        };

        self.check_dims(&vectors)?;
        Ok(vectors)
    }

    fn check_dims(&self, vectors: &[Vec<f32>]) -> PipelineResult<()> {
        for v in vectors {
            if v.len() != self.dim {
                return Err(PipelineError::EncoderFatal {
                    message: format!(
                        "{} produced {}-dim vectors, expected {}",
                        self.kind,
                        v.len(),
                        self.dim
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Average the rows marked real by the mask (all rows when absent).
fn mean_pool(rows: &[f32], seq: usize, dim: usize, mask: Option<&[i64]>) -> Vec<f32> {
    let mut acc = vec![0.0f32; dim];
    let mut count = 0usize;
    for s in 0..seq {
        let keep = mask.map_or(true, |m| m.get(s).copied().unwrap_or(0) == 1);
        if !keep {
            continue;
        }
        for d in 0..dim {
            acc[d] += rows[s * dim + d];
        }
        count += 1;
    }
    if count > 0 {
        let inv = 1.0 / count as f32;
        for x in acc.iter_mut() {
            *x *= inv;
        }
    }
    acc
}

fn pooled_dim(shape: &[i64], expected_rank: usize) -> PipelineResult<usize> {
    if shape.len() != expected_rank {
        return Err(PipelineError::EncoderFatal {
            message: format!("unexpected output shape {shape:?}, expected rank {expected_rank}"),
        });
    }
    Ok(shape[expected_rank - 1] as usize)
}

fn transient<E: std::fmt::Display>(e: E) -> PipelineError {
    PipelineError::EncoderTransient {
        message: e.to_string(),
    }
}

fn opt_level(cfg: &SessionConfig) -> GraphOptimizationLevel {
    match cfg.graph_opt_level.as_str() {
        "disable" => GraphOptimizationLevel::Disable,
        "basic" => GraphOptimizationLevel::Level1,
        "extended" => GraphOptimizationLevel::Level2,
        // "all" unless a specific model mis-optimizes
        _ => GraphOptimizationLevel::Level3,
    }
}

fn apply_threads(
    builder: ort::session::builder::SessionBuilder,
    cfg: &SessionConfig,
) -> Result<ort::session::builder::SessionBuilder, ort::Error> {
    let builder = if cfg.intra_op_threads > 0 {
        builder.with_intra_threads(cfg.intra_op_threads)?
    } else {
        builder
    };
    if cfg.inter_op_threads > 0 {
        builder.with_inter_threads(cfg.inter_op_threads)
    } else {
        Ok(builder)
    }
}

/// Build the provider list: CUDA when requested and present, CPU always
/// appended as the terminal fallback.
fn execution_providers(
    kind: EncoderKind,
    device: Option<u32>,
    cfg: &SessionConfig,
) -> (Vec<ExecutionProviderDispatch>, bool) {
    let mut eps = Vec::new();
    let mut accelerated = false;

    if let Some(device_id) = device {
        let mut cuda = CUDAExecutionProvider::default().with_device_id(device_id as i32);
        if cfg.mem_limit_bytes > 0 {
            cuda = cuda.with_memory_limit(cfg.mem_limit_bytes as usize);
        }
        cuda = match cfg.memory_mode {
            MemoryMode::Conservative => cuda
                .with_arena_extend_strategy(ArenaExtendStrategy::SameAsRequested)
                .with_conv_max_workspace(false)
                .with_conv_algorithm_search(ConvAlgorithmSearch::Default),
            MemoryMode::Aggressive => cuda
                .with_arena_extend_strategy(ArenaExtendStrategy::NextPowerOfTwo)
                .with_conv_max_workspace(true)
                .with_conv_algorithm_search(ConvAlgorithmSearch::Exhaustive),
        };

        if cuda.is_available().unwrap_or(false) {
            eps.push(cuda.build());
            accelerated = true;
        } else {
            tracing::warn!(
                %kind,
                device_id,
                "CUDA device unavailable, falling back to CPU execution"
            );
        }
    }

    eps.push(CPUExecutionProvider::default().build());
    (eps, accelerated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_pool_uniform_without_mask() {
        // Two sequence rows, dim 2: mean of [1,2] and [3,4].
        let rows = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(mean_pool(&rows, 2, 2, None), vec![2.0, 3.0]);
    }

    #[test]
    fn test_mean_pool_respects_mask() {
        let rows = [1.0, 2.0, 100.0, 200.0];
        let mask = [1i64, 0];
        assert_eq!(mean_pool(&rows, 2, 2, Some(&mask)), vec![1.0, 2.0]);
    }

    #[test]
    fn test_mean_pool_empty_mask_is_zero() {
        let rows = [1.0, 2.0];
        let mask = [0i64];
        assert_eq!(mean_pool(&rows, 1, 2, Some(&mask)), vec![0.0, 0.0]);
    }

    #[test]
    fn test_pooled_dim_checks_rank() {
        assert_eq!(pooled_dim(&[2, 77, 768], 3).unwrap(), 768);
        assert_eq!(pooled_dim(&[2, 1280], 2).unwrap(), 1280);
        assert!(pooled_dim(&[2, 1280], 3).is_err());
    }

    #[test]
    fn test_load_missing_model_fails() {
        let cfg = SessionConfig::default();
        let err = EncoderSession::load(
            EncoderKind::Vision,
            Path::new("/nonexistent/visual.onnx"),
            None,
            &cfg,
            "pooler_output",
            Pooling::PoolerOutput,
            1280,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ModelMissing { .. }));
    }
}
