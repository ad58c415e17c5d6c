//! Daemon configuration.
//!
//! Runtime settings: which back-end is the default, where model assets and
//! the track cache live, which execution device to use, and the cache/queue
//! limits. The config is loadable from a JSON file and overridable from the
//! command line; unspecified paths fall back to platform defaults.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, ErrorCode, Result};
use crate::models::Backend;

/// Execution device for ONNX inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Pick the best available provider (CUDA > CoreML > CPU).
    #[default]
    Auto,
    /// Force CPU execution.
    Cpu,
    /// NVIDIA CUDA.
    Cuda,
    /// Apple CoreML / Metal.
    Metal,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Auto => "auto",
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
            Device::Metal => "metal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Some(Device::Auto),
            "cpu" => Some(Device::Cpu),
            "cuda" => Some(Device::Cuda),
            "metal" | "coreml" => Some(Device::Metal),
            _ => None,
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_queue_limit() -> usize {
    10
}

fn default_cache_max_mb() -> u64 {
    2048
}

fn default_ace_step_steps() -> u32 {
    60
}

fn default_ace_step_scheduler() -> String {
    "euler".to_string()
}

fn default_ace_step_guidance() -> f32 {
    15.0
}

/// Runtime configuration for the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Back-end used when a request does not name one.
    pub default_backend: Backend,

    /// MusicGen asset directory. None means the platform default.
    pub musicgen_model_path: Option<PathBuf>,

    /// ACE-Step asset directory. None means the platform default.
    pub ace_step_model_path: Option<PathBuf>,

    /// Track cache directory. None means the platform default.
    pub cache_path: Option<PathBuf>,

    /// LRU size ceiling for the track cache, in megabytes.
    pub cache_max_mb: u64,

    /// Optional count ceiling for the track cache.
    pub cache_max_tracks: Option<usize>,

    /// Execution device for inference.
    pub device: Device,

    /// Intra-op thread count for ONNX Runtime. None means auto.
    pub threads: Option<u32>,

    /// Admission bound for the job queue.
    pub queue_limit: usize,

    /// Default diffusion step count for ACE-Step requests.
    pub ace_step_default_steps: u32,

    /// Default scheduler name for ACE-Step requests.
    pub ace_step_default_scheduler: String,

    /// Default guidance scale for ACE-Step requests.
    pub ace_step_default_guidance: f32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            default_backend: Backend::MusicGen,
            musicgen_model_path: None,
            ace_step_model_path: None,
            cache_path: None,
            cache_max_mb: default_cache_max_mb(),
            cache_max_tracks: None,
            device: Device::Auto,
            threads: None,
            queue_limit: default_queue_limit(),
            ace_step_default_steps: default_ace_step_steps(),
            ace_step_default_scheduler: default_ace_step_scheduler(),
            ace_step_default_guidance: default_ace_step_guidance(),
        }
    }
}

impl DaemonConfig {
    /// Loads a configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            DaemonError::with_context(
                ErrorCode::ModelLoadFailed,
                format!("cannot read config file: {e}"),
                path.display().to_string(),
            )
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            DaemonError::with_context(
                ErrorCode::ModelLoadFailed,
                format!("cannot parse config file: {e}"),
                path.display().to_string(),
            )
        })
    }

    /// Asset directory for the given back-end.
    pub fn model_dir(&self, backend: Backend) -> PathBuf {
        let configured = match backend {
            Backend::MusicGen => &self.musicgen_model_path,
            Backend::AceStep => &self.ace_step_model_path,
        };
        configured
            .clone()
            .unwrap_or_else(|| default_data_dir().join(backend.as_str()))
    }

    /// Directory holding generated tracks and their sidecar metadata.
    pub fn tracks_dir(&self) -> PathBuf {
        self.cache_path
            .clone()
            .unwrap_or_else(|| default_cache_dir().join("tracks"))
    }

    /// Cache size ceiling in bytes.
    pub fn cache_max_bytes(&self) -> u64 {
        self.cache_max_mb.saturating_mul(1024 * 1024)
    }

    /// Checks the configuration for nonsense values. Returns a message on
    /// failure, None when the configuration is usable.
    pub fn validate(&self) -> Option<String> {
        if let Some(threads) = self.threads {
            if threads == 0 || threads > 256 {
                return Some(format!("threads must be 1-256, got {threads}"));
            }
        }
        if self.queue_limit == 0 {
            return Some("queue_limit must be at least 1".to_string());
        }
        if self.cache_max_mb == 0 {
            return Some("cache_max_mb must be at least 1".to_string());
        }
        if !(1..=200).contains(&self.ace_step_default_steps) {
            return Some(format!(
                "ace_step_default_steps must be 1-200, got {}",
                self.ace_step_default_steps
            ));
        }
        if !(1.0..=30.0).contains(&self.ace_step_default_guidance) {
            return Some(format!(
                "ace_step_default_guidance must be 1.0-30.0, got {}",
                self.ace_step_default_guidance
            ));
        }
        None
    }
}

/// Platform data directory for model assets.
///
/// Linux: `~/.local/share/cadenced`, macOS: `~/Library/Application
/// Support/cadenced`, Windows: `%LOCALAPPDATA%\cadenced`.
fn default_data_dir() -> PathBuf {
    if let Some(dirs) = directories::ProjectDirs::from("", "", "cadenced") {
        dirs.data_dir().to_path_buf()
    } else {
        PathBuf::from("./models")
    }
}

/// Platform cache directory for generated audio.
fn default_cache_dir() -> PathBuf {
    if let Some(dirs) = directories::ProjectDirs::from("", "", "cadenced") {
        dirs.cache_dir().to_path_buf()
    } else {
        PathBuf::from("./cache")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_parsing() {
        assert_eq!(Device::parse("auto"), Some(Device::Auto));
        assert_eq!(Device::parse("CPU"), Some(Device::Cpu));
        assert_eq!(Device::parse("cuda"), Some(Device::Cuda));
        assert_eq!(Device::parse("coreml"), Some(Device::Metal));
        assert_eq!(Device::parse("tpu"), None);
    }

    #[test]
    fn defaults_are_valid() {
        let config = DaemonConfig::default();
        assert!(config.validate().is_none());
        assert_eq!(config.queue_limit, 10);
        assert_eq!(config.ace_step_default_steps, 60);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = DaemonConfig::default();
        config.threads = Some(0);
        assert!(config.validate().is_some());

        let mut config = DaemonConfig::default();
        config.queue_limit = 0;
        assert!(config.validate().is_some());

        let mut config = DaemonConfig::default();
        config.ace_step_default_guidance = 40.0;
        assert!(config.validate().is_some());
    }

    #[test]
    fn model_dirs_differ_per_backend() {
        let config = DaemonConfig::default();
        assert_ne!(
            config.model_dir(Backend::MusicGen),
            config.model_dir(Backend::AceStep)
        );
    }

    #[test]
    fn cache_ceiling_in_bytes() {
        let mut config = DaemonConfig::default();
        config.cache_max_mb = 3;
        assert_eq!(config.cache_max_bytes(), 3 * 1024 * 1024);
    }

    #[test]
    fn partial_config_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"default_backend":"ace_step","queue_limit":5}"#).unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.default_backend, Backend::AceStep);
        assert_eq!(config.queue_limit, 5);
        assert_eq!(config.cache_max_mb, default_cache_max_mb());
    }
}
