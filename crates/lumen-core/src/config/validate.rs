//! Configuration validation with range and schema checks.

use crate::error::ConfigError;
use crate::types::{CLIP_G_DIM, CLIP_L_DIM, SEMANTIC_DIM, VISION_DIM};

use super::Config;

impl Config {
    /// Validate values are usable before any session is constructed.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.batching.text_batch_size == 0 {
            return Err(ConfigError::Validation(
                "batching.text_batch_size must be > 0".into(),
            ));
        }
        if self.batching.image_batch_size == 0 {
            return Err(ConfigError::Validation(
                "batching.image_batch_size must be > 0".into(),
            ));
        }
        if self.batching.queue_capacity_multiplier == 0 {
            return Err(ConfigError::Validation(
                "batching.queue_capacity_multiplier must be > 0".into(),
            ));
        }
        if !matches!(
            self.session.graph_opt_level.as_str(),
            "disable" | "basic" | "extended" | "all"
        ) {
            return Err(ConfigError::Validation(format!(
                "session.graph_opt_level must be one of disable/basic/extended/all, got {:?}",
                self.session.graph_opt_level
            )));
        }
        if self.store.io_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "store.io_timeout_secs must be > 0".into(),
            ));
        }

        // The embedding schema is fixed; a mismatched dimension here would
        // poison every vector comparison downstream.
        if let Some(c) = &self.encoders.semantic {
            if c.dim != SEMANTIC_DIM {
                return Err(ConfigError::Validation(format!(
                    "encoders.semantic.dim must be {SEMANTIC_DIM}, got {}",
                    c.dim
                )));
            }
            if c.max_len < 2 {
                return Err(ConfigError::Validation(
                    "encoders.semantic.max_len must be at least 2".into(),
                ));
            }
        }
        if let Some(c) = &self.encoders.clip_l {
            if c.dim != CLIP_L_DIM {
                return Err(ConfigError::Validation(format!(
                    "encoders.clip_l.dim must be {CLIP_L_DIM}, got {}",
                    c.dim
                )));
            }
            if c.context_len < 2 {
                return Err(ConfigError::Validation(
                    "encoders.clip_l.context_len must be at least 2".into(),
                ));
            }
        }
        if let Some(c) = &self.encoders.clip_g {
            if c.dim != CLIP_G_DIM {
                return Err(ConfigError::Validation(format!(
                    "encoders.clip_g.dim must be {CLIP_G_DIM}, got {}",
                    c.dim
                )));
            }
            if c.context_len < 2 {
                return Err(ConfigError::Validation(
                    "encoders.clip_g.context_len must be at least 2".into(),
                ));
            }
        }
        if let Some(c) = &self.encoders.vision {
            if c.dim != VISION_DIM {
                return Err(ConfigError::Validation(format!(
                    "encoders.vision.dim must be {VISION_DIM}, got {}",
                    c.dim
                )));
            }
            if c.image_size == 0 {
                return Err(ConfigError::Validation(
                    "encoders.vision.image_size must be > 0".into(),
                ));
            }
        }

        Ok(())
    }
}
