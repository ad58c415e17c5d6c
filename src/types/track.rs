//! Track entity: one generated audio artifact in the cache.
//!
//! A track is immutable once written. Its id is a content address computed
//! from the generation parameters, so re-requesting the same tuple always
//! lands on the same cache entry.

use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::Backend;

/// A successfully generated audio file plus its metadata sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    /// Content address: first 16 hex chars of the SHA-256 of the
    /// generation tuple.
    pub track_id: String,

    /// Absolute path of the WAV file.
    pub path: PathBuf,

    /// Prompt the track was generated from.
    pub prompt: String,

    /// Actual audio duration in seconds.
    pub duration_sec: f32,

    /// Output sample rate in Hz (32000 for musicgen, 48000 for ace_step).
    pub sample_rate: u32,

    /// Seed the generation ran with.
    pub seed: u64,

    /// Back-end that produced this track.
    pub backend: Backend,

    /// Model identifier, part of the content address.
    pub model_version: String,

    /// Wall-clock generation time in seconds.
    pub generation_time_sec: f32,

    /// Creation timestamp.
    pub created_at: SystemTime,
}

impl Track {
    /// Builds a track record for a finished generation.
    ///
    /// `track_id` is the id computed from the *request* tuple at submission
    /// time; `duration_sec` is the measured duration of the audio actually
    /// written, which may differ from the requested integer by a fraction
    /// of a second.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        track_id: String,
        path: PathBuf,
        prompt: String,
        duration_sec: f32,
        sample_rate: u32,
        seed: u64,
        backend: Backend,
        model_version: String,
        generation_time_sec: f32,
    ) -> Self {
        Self {
            track_id,
            path,
            prompt,
            duration_sec,
            sample_rate,
            seed,
            backend,
            model_version,
            generation_time_sec,
            created_at: SystemTime::now(),
        }
    }
}

/// Computes the content address for a generation tuple.
///
/// The address is the first 16 hex characters of
/// `sha256(prompt:seed:duration:model_version:backend)`. Two requests with
/// the same tuple always map to the same track.
pub fn compute_track_id(
    prompt: &str,
    seed: u64,
    duration_sec: u32,
    model_version: &str,
    backend: Backend,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(b":");
    hasher.update(seed.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(duration_sec.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(model_version.as_bytes());
    hasher.update(b":");
    hasher.update(backend.as_str().as_bytes());
    let digest = hasher.finalize();

    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}
