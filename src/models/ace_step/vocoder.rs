//! Vocoder: mel-spectrogram to a 44.1 kHz waveform.

use std::path::Path;

use ndarray::Array3;
use ort::session::Session;

use crate::error::{DaemonError, Result};
use crate::models::loader::load_session;

use super::tensors::f32_tensor;

/// Native output rate of the vocoder.
pub const VOCODER_SAMPLE_RATE: u32 = 44100;

pub struct Vocoder {
    session: Session,
}

impl std::fmt::Debug for Vocoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vocoder").finish_non_exhaustive()
    }
}

impl Vocoder {
    /// Loads `vocoder.onnx`.
    pub fn load(
        model_dir: &Path,
        providers: &[ort::execution_providers::ExecutionProviderDispatch],
        threads: Option<u32>,
    ) -> Result<Self> {
        let session = load_session(&model_dir.join("vocoder.onnx"), providers, threads)?;
        Ok(Self { session })
    }

    /// Synthesizes mono samples from a `(1, mel_bins, time)` spectrogram.
    pub fn synthesize(&mut self, mel: &Array3<f32>) -> Result<Vec<f32>> {
        let tensor = f32_tensor(mel.shape().to_vec(), mel.iter().copied().collect(), "mel")?;

        let mut outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(|e| DaemonError::inference(format!("vocoder failed: {e}")))?;

        let key = outputs
            .keys()
            .next()
            .map(|k| k.to_string())
            .ok_or_else(|| DaemonError::inference("vocoder produced no outputs"))?;
        let audio = outputs
            .remove(&key)
            .ok_or_else(|| DaemonError::inference("cannot take vocoder output"))?;

        // output may be (samples,), (1, samples), or (1, 1, samples)
        let (_, data) = audio
            .try_extract_tensor::<f32>()
            .map_err(|e| DaemonError::inference(format!("cannot extract audio: {e}")))?;
        Ok(data.to_vec())
    }

    pub fn sample_rate(&self) -> u32 {
        VOCODER_SAMPLE_RATE
    }
}
