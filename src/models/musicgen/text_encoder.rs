//! Prompt encoding for MusicGen: byte-pair tokenization plus the T5 text
//! encoder session. The encoder runs once per generation; its outputs feed
//! every decoder step as cross-attention keys/values.

use std::path::Path;

use ort::session::Session;
use ort::value::{DynValue, Tensor};
use tokenizers::Tokenizer;

use crate::error::{DaemonError, Result};
use crate::models::loader::load_session;

pub struct MusicGenTextEncoder {
    tokenizer: Tokenizer,
    session: Session,
}

impl std::fmt::Debug for MusicGenTextEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MusicGenTextEncoder").finish_non_exhaustive()
    }
}

impl MusicGenTextEncoder {
    /// Loads `tokenizer.json` and `text_encoder.onnx` from the asset
    /// directory.
    pub fn load(
        model_dir: &Path,
        providers: &[ort::execution_providers::ExecutionProviderDispatch],
        threads: Option<u32>,
    ) -> Result<Self> {
        let mut tokenizer = Tokenizer::from_file(model_dir.join("tokenizer.json"))
            .map_err(|e| DaemonError::model_load_failed(format!("cannot load tokenizer: {e}")))?;
        tokenizer
            .with_padding(None)
            .with_truncation(None)
            .map_err(|e| {
                DaemonError::model_load_failed(format!("cannot configure tokenizer: {e}"))
            })?;

        let session = load_session(&model_dir.join("text_encoder.onnx"), providers, threads)?;
        Ok(Self { tokenizer, session })
    }

    /// Encodes a prompt into hidden states and an attention mask, both as
    /// dynamic tensors ready to feed the decoder.
    pub fn encode(&mut self, prompt: &str) -> Result<(DynValue, DynValue)> {
        let ids: Vec<i64> = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| DaemonError::inference(format!("tokenization failed: {e}")))?
            .get_ids()
            .iter()
            .map(|&id| id as i64)
            .collect();
        let len = ids.len();

        let input_ids = Tensor::from_array(([1, len], ids))
            .map_err(|e| DaemonError::inference(format!("cannot build input_ids: {e}")))?;
        let attention = Tensor::from_array(([1, len], vec![1i64; len]))
            .map_err(|e| DaemonError::inference(format!("cannot build attention mask: {e}")))?;

        let mut outputs = self
            .session
            .run(ort::inputs![input_ids, attention])
            .map_err(|e| DaemonError::inference(format!("text encoder failed: {e}")))?;

        let hidden_states = outputs
            .remove("last_hidden_state")
            .ok_or_else(|| DaemonError::inference("text encoder returned no last_hidden_state"))?;

        // the decoder wants its own copy of the mask
        let decoder_mask = Tensor::from_array(([1, len], vec![1i64; len]))
            .map_err(|e| DaemonError::inference(format!("cannot build decoder mask: {e}")))?;

        Ok((hidden_states, decoder_mask.into_dyn()))
    }
}
