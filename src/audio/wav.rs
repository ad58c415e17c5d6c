//! WAV output for generated audio.
//!
//! Tracks are written as 16-bit PCM. Samples arrive from the engines as f32
//! in [-1, 1] and are clamped before quantization.

use std::path::Path;

use hound::{SampleFormat, WavSpec, WavWriter};

use crate::error::{DaemonError, Result};

/// Channel layout for the written file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelLayout {
    /// Single channel.
    #[default]
    Mono,
    /// The mono signal duplicated into left and right.
    StereoDuplicated,
}

impl ChannelLayout {
    fn channels(self) -> u16 {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::StereoDuplicated => 2,
        }
    }
}

fn quantize(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Writes f32 samples as a 16-bit PCM WAV file.
pub fn write_wav(
    samples: &[f32],
    path: &Path,
    sample_rate: u32,
    layout: ChannelLayout,
) -> Result<()> {
    let spec = WavSpec {
        channels: layout.channels(),
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec)
        .map_err(|e| DaemonError::inference(format!("cannot create WAV file: {e}")))?;

    for &sample in samples {
        let value = quantize(sample);
        writer
            .write_sample(value)
            .map_err(|e| DaemonError::inference(format!("WAV write failed: {e}")))?;
        if layout == ChannelLayout::StereoDuplicated {
            writer
                .write_sample(value)
                .map_err(|e| DaemonError::inference(format!("WAV write failed: {e}")))?;
        }
    }

    writer
        .finalize()
        .map_err(|e| DaemonError::inference(format!("WAV finalize failed: {e}")))
}

/// Reads a 16-bit PCM WAV back as f32 samples (first channel only).
pub fn read_wav(path: &Path) -> Result<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| DaemonError::inference(format!("cannot open WAV file: {e}")))?;
    let spec = reader.spec();
    let channels = spec.channels as usize;

    let samples: Vec<f32> = reader
        .samples::<i16>()
        .step_by(channels)
        .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| DaemonError::inference(format!("WAV read failed: {e}")))?;

    Ok((samples, spec.sample_rate))
}

/// Audio duration in seconds for a sample count.
pub fn samples_to_duration(sample_count: usize, sample_rate: u32) -> f32 {
    sample_count as f32 / sample_rate as f32
}
