//! Back-end dispatch.
//!
//! Two back-ends share the daemon substrate: the autoregressive MusicGen
//! ensemble and the ACE-Step diffusion pipeline. Dispatch is a tagged union;
//! only one back-end's sessions are resident at a time.

use serde::{Deserialize, Serialize};

use crate::audio::resample_to_48k;
use crate::error::{DaemonError, Result};
use crate::types::CancelFlag;

use super::ace_step::{self, AceStepModels, SchedulerType};
use super::musicgen::{self, MusicGenModels};

/// Available generation back-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Autoregressive 4-codebook transformer, 32 kHz output, up to 120 s.
    #[default]
    MusicGen,
    /// Latent diffusion transformer, 48 kHz output, up to 240 s.
    AceStep,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::MusicGen => "musicgen",
            Backend::AceStep => "ace_step",
        }
    }

    /// Human name for `get_backends` output.
    pub fn display_name(&self) -> &'static str {
        match self {
            Backend::MusicGen => "MusicGen",
            Backend::AceStep => "ACE-Step",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "musicgen" | "music_gen" => Some(Backend::MusicGen),
            "ace_step" | "acestep" => Some(Backend::AceStep),
            _ => None,
        }
    }

    pub fn min_duration_sec(&self) -> u32 {
        5
    }

    pub fn max_duration_sec(&self) -> u32 {
        match self {
            Backend::MusicGen => 120,
            Backend::AceStep => 240,
        }
    }

    /// Prompt length ceiling in characters.
    pub fn max_prompt_chars(&self) -> usize {
        match self {
            Backend::MusicGen => 1000,
            Backend::AceStep => 512,
        }
    }

    /// Sample rate of the WAV the daemon writes for this back-end.
    pub fn sample_rate(&self) -> u32 {
        match self {
            Backend::MusicGen => 32000,
            Backend::AceStep => 48000,
        }
    }

    pub fn all() -> [Backend; 2] {
        [Backend::MusicGen, Backend::AceStep]
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state reported for a back-end in `get_backends`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    /// Required asset files are missing.
    NotInstalled,
    /// An asset fetch is running.
    Downloading,
    /// Sessions are being created on the worker.
    Loading,
    /// Assets present (and sessions loadable on demand).
    Ready,
    /// The last load or fetch attempt failed.
    Error,
}

impl BackendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendStatus::NotInstalled => "not_installed",
            BackendStatus::Downloading => "downloading",
            BackendStatus::Loading => "loading",
            BackendStatus::Ready => "ready",
            BackendStatus::Error => "error",
        }
    }
}

/// Runtime status overlay for the back-ends.
///
/// File checks answer "installed or not"; this overlay layers the transient
/// states on top: the fetcher marks `Downloading`, the worker marks
/// `Loading` while sessions are built, and failures pin `Error` until the
/// next successful transition.
#[derive(Default)]
pub struct BackendStates {
    overrides: std::sync::Mutex<std::collections::HashMap<Backend, BackendStatus>>,
}

impl BackendStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, backend: Backend, status: BackendStatus) {
        self.overrides
            .lock()
            .expect("backend state lock poisoned")
            .insert(backend, status);
    }

    /// Drops the transient override so file checks decide again.
    pub fn clear(&self, backend: Backend) {
        self.overrides
            .lock()
            .expect("backend state lock poisoned")
            .remove(&backend);
    }

    pub fn get(&self, backend: Backend) -> Option<BackendStatus> {
        self.overrides
            .lock()
            .expect("backend state lock poisoned")
            .get(&backend)
            .copied()
    }
}

/// Everything an engine needs to run one generation.
#[derive(Debug, Clone)]
pub struct GenerateSpec {
    pub prompt: String,
    pub duration_sec: u32,
    pub seed: u64,
    /// Diffusion-only; ignored by MusicGen.
    pub inference_steps: u32,
    /// Diffusion-only; ignored by MusicGen.
    pub scheduler: SchedulerType,
    /// Diffusion-only; MusicGen uses its fixed internal scale.
    pub guidance_scale: f32,
}

/// Resident model sessions for the active back-end.
pub enum LoadedModels {
    None,
    MusicGen(MusicGenModels),
    AceStep(AceStepModels),
}

impl std::fmt::Debug for LoadedModels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadedModels::None => f.write_str("LoadedModels::None"),
            LoadedModels::MusicGen(_) => f.write_str("LoadedModels::MusicGen"),
            LoadedModels::AceStep(_) => f.write_str("LoadedModels::AceStep"),
        }
    }
}

impl Default for LoadedModels {
    fn default() -> Self {
        LoadedModels::None
    }
}

impl LoadedModels {
    /// Back-end of the resident sessions, if any.
    pub fn backend(&self) -> Option<Backend> {
        match self {
            LoadedModels::None => None,
            LoadedModels::MusicGen(_) => Some(Backend::MusicGen),
            LoadedModels::AceStep(_) => Some(Backend::AceStep),
        }
    }

    pub fn version(&self) -> Option<&str> {
        match self {
            LoadedModels::None => None,
            LoadedModels::MusicGen(m) => Some(m.version()),
            LoadedModels::AceStep(m) => Some(m.version()),
        }
    }

    /// Runs one generation on the resident back-end.
    ///
    /// `on_progress` receives (current, total) in the back-end's own units
    /// (token frames or user-visible diffusion steps). The cancel flag is
    /// polled between steps; an observed cancel surfaces as
    /// [`DaemonError::cancelled`].
    ///
    /// Output samples are at the back-end's contract rate:
    /// 32 kHz for MusicGen, 48 kHz (resampled from the vocoder's 44.1 kHz)
    /// for ACE-Step.
    pub fn generate(
        &mut self,
        spec: &GenerateSpec,
        cancel: &CancelFlag,
        on_progress: &dyn Fn(usize, usize),
    ) -> Result<Vec<f32>> {
        match self {
            LoadedModels::None => Err(DaemonError::model_load_failed("no back-end loaded")),
            LoadedModels::MusicGen(models) => {
                musicgen::generate(models, spec, cancel, on_progress)
            }
            LoadedModels::AceStep(models) => {
                let samples = ace_step::generate(models, spec, cancel, on_progress)?;
                resample_to_48k(&samples)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_parsing() {
        assert_eq!(Backend::parse("musicgen"), Some(Backend::MusicGen));
        assert_eq!(Backend::parse("MusicGen"), Some(Backend::MusicGen));
        assert_eq!(Backend::parse("ace_step"), Some(Backend::AceStep));
        assert_eq!(Backend::parse("ACE-Step"), Some(Backend::AceStep));
        assert_eq!(Backend::parse("acestep"), Some(Backend::AceStep));
        assert_eq!(Backend::parse("riffusion"), None);
    }

    #[test]
    fn backend_limits() {
        assert_eq!(Backend::MusicGen.max_duration_sec(), 120);
        assert_eq!(Backend::AceStep.max_duration_sec(), 240);
        assert_eq!(Backend::MusicGen.min_duration_sec(), 5);
        assert_eq!(Backend::MusicGen.max_prompt_chars(), 1000);
        assert_eq!(Backend::AceStep.max_prompt_chars(), 512);
    }

    #[test]
    fn backend_sample_rates() {
        assert_eq!(Backend::MusicGen.sample_rate(), 32000);
        assert_eq!(Backend::AceStep.sample_rate(), 48000);
    }

    #[test]
    fn serde_uses_snake_case() {
        assert_eq!(
            serde_json::to_string(&Backend::AceStep).unwrap(),
            "\"ace_step\""
        );
        let parsed: Backend = serde_json::from_str("\"musicgen\"").unwrap();
        assert_eq!(parsed, Backend::MusicGen);
    }

    #[test]
    fn empty_models_refuse_to_generate() {
        let mut models = LoadedModels::None;
        let spec = GenerateSpec {
            prompt: "x".to_string(),
            duration_sec: 10,
            seed: 1,
            inference_steps: 60,
            scheduler: SchedulerType::Euler,
            guidance_scale: 15.0,
        };
        let err = models
            .generate(&spec, &CancelFlag::new(), &|_, _| {})
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ModelLoadFailed);
    }
}
