//! MusicGen architecture record.
//!
//! Shapes of the decoder KV cache and the codebook layout come from the
//! model's `config.json`. The values here mirror the exported
//! musicgen-small ONNX ensemble.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, Result};

/// Architecture parameters of the MusicGen decoder ensemble.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Token vocabulary size per codebook.
    pub vocab_size: u32,

    /// Decoder transformer layer count.
    pub num_hidden_layers: u32,

    /// Attention heads per layer.
    pub num_attention_heads: u32,

    /// Embedding dimension.
    pub d_model: u32,

    /// Per-head key/value dimension.
    pub d_kv: u32,

    /// Output sample rate in Hz.
    pub sample_rate: u32,

    /// Parallel codebook streams (4 for MusicGen).
    pub codebooks: u32,

    /// Pad token id used by the delay pattern.
    pub pad_token_id: i64,
}

impl ModelConfig {
    /// Parameters for the musicgen-small export.
    pub fn musicgen_small() -> Self {
        Self {
            vocab_size: 2048,
            num_hidden_layers: 24,
            num_attention_heads: 16,
            d_model: 1024,
            d_kv: 64,
            sample_rate: 32000,
            codebooks: 4,
            pad_token_id: 2048,
        }
    }

    /// Reads the architecture record from the asset directory's
    /// `config.json`.
    ///
    /// The exported ensemble ships the Hugging Face config with nested
    /// `decoder` and `text_encoder` sections; fields the export omits fall
    /// back to the musicgen-small values, and a missing file means the
    /// defaults outright.
    pub fn from_model_dir(model_dir: &Path) -> Result<Self> {
        let path = model_dir.join("config.json");
        if !path.exists() {
            return Ok(Self::musicgen_small());
        }

        let raw = std::fs::read_to_string(&path)
            .map_err(|e| DaemonError::model_load_failed(format!("cannot read config.json: {e}")))?;
        let json: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
            DaemonError::model_load_failed(format!("cannot parse config.json: {e}"))
        })?;

        let defaults = Self::musicgen_small();
        let decoder = json.get("decoder");
        let text_encoder = json.get("text_encoder");
        let u32_field = |section: Option<&serde_json::Value>, name: &str, fallback: u32| {
            section
                .and_then(|s| s.get(name))
                .and_then(|v| v.as_u64())
                .map(|v| v as u32)
                .unwrap_or(fallback)
        };

        let config = Self {
            vocab_size: u32_field(decoder, "vocab_size", defaults.vocab_size),
            num_hidden_layers: u32_field(decoder, "num_hidden_layers", defaults.num_hidden_layers),
            num_attention_heads: u32_field(
                decoder,
                "num_attention_heads",
                defaults.num_attention_heads,
            ),
            d_model: u32_field(text_encoder, "d_model", defaults.d_model),
            d_kv: u32_field(text_encoder, "d_kv", defaults.d_kv),
            sample_rate: defaults.sample_rate,
            codebooks: defaults.codebooks,
            pad_token_id: decoder
                .and_then(|d| d.get("pad_token_id"))
                .and_then(|v| v.as_i64())
                .unwrap_or(defaults.pad_token_id),
        };

        if let Some(problem) = config.validate() {
            return Err(DaemonError::model_load_failed(format!(
                "config.json is inconsistent: {problem}"
            )));
        }
        Ok(config)
    }

    /// Consistency check. Returns a message describing the first problem,
    /// or None when the record is usable.
    pub fn validate(&self) -> Option<String> {
        if self.vocab_size == 0 || self.num_hidden_layers == 0 || self.num_attention_heads == 0 {
            return Some("vocab_size, layers, and heads must all be non-zero".to_string());
        }
        if self.d_kv != self.d_model / self.num_attention_heads {
            return Some(format!(
                "d_kv ({}) must equal d_model / heads ({})",
                self.d_kv,
                self.d_model / self.num_attention_heads
            ));
        }
        if self.codebooks != 4 {
            return Some(format!("codebooks must be 4, got {}", self.codebooks));
        }
        None
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::musicgen_small()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_config_is_valid() {
        let config = ModelConfig::musicgen_small();
        assert!(config.validate().is_none());
        assert_eq!(config.codebooks, 4);
        assert_eq!(config.sample_rate, 32000);
        assert_eq!(config.pad_token_id, 2048);
    }

    #[test]
    fn validation_catches_head_mismatch() {
        let mut config = ModelConfig::musicgen_small();
        config.d_kv = 128;
        assert!(config.validate().is_some());
    }

    #[test]
    fn validation_catches_wrong_codebooks() {
        let mut config = ModelConfig::musicgen_small();
        config.codebooks = 8;
        assert!(config.validate().is_some());
    }

    #[test]
    fn missing_config_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ModelConfig::from_model_dir(dir.path()).unwrap();
        assert_eq!(config.num_hidden_layers, 24);
        assert_eq!(config.pad_token_id, 2048);
    }

    #[test]
    fn config_file_overrides_nested_fields() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{
                "decoder": {"num_hidden_layers": 48, "num_attention_heads": 32, "pad_token_id": 2047},
                "text_encoder": {"d_model": 2048, "d_kv": 64}
            }"#,
        )
        .unwrap();

        let config = ModelConfig::from_model_dir(dir.path()).unwrap();
        assert_eq!(config.num_hidden_layers, 48);
        assert_eq!(config.num_attention_heads, 32);
        assert_eq!(config.pad_token_id, 2047);
        assert_eq!(config.d_model, 2048);
        // omitted fields keep the small-model values
        assert_eq!(config.vocab_size, 2048);
    }

    #[test]
    fn inconsistent_config_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"decoder": {}, "text_encoder": {"d_model": 1024, "d_kv": 128}}"#,
        )
        .unwrap();
        assert!(ModelConfig::from_model_dir(dir.path()).is_err());
    }

    #[test]
    fn unparseable_config_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), b"{ not json").unwrap();
        assert!(ModelConfig::from_model_dir(dir.path()).is_err());
    }
}
