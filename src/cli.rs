//! Command-line interface.
//!
//! Two modes share the pipeline: `--daemon` starts the JSON-RPC server, and
//! a bare `--prompt` runs one generation to a WAV file for smoke testing
//! without an editor attached.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{DaemonConfig, Device};
use crate::error::{DaemonError, ErrorCode, Result};

/// Offline text-to-music generation daemon.
#[derive(Parser, Debug)]
#[command(name = "cadenced", version)]
#[command(about = "Offline text-to-music generation over JSON-RPC stdio")]
pub struct Cli {
    /// Run as a JSON-RPC daemon on stdin/stdout.
    #[arg(long)]
    pub daemon: bool,

    /// One-shot mode: text prompt describing the music.
    #[arg(short, long)]
    pub prompt: Option<String>,

    /// One-shot mode: duration in seconds.
    #[arg(short, long, default_value = "10")]
    pub duration: u32,

    /// One-shot mode: random seed for reproducible output.
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// One-shot mode: output WAV path.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// One-shot mode: back-end to use (musicgen or ace_step).
    #[arg(short, long)]
    pub backend: Option<String>,

    /// Path to a JSON configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the execution device (auto, cpu, cuda, metal).
    #[arg(long)]
    pub device: Option<String>,

    /// Override the track cache directory.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Override the MusicGen asset directory.
    #[arg(long)]
    pub musicgen_dir: Option<PathBuf>,

    /// Override the ACE-Step asset directory.
    #[arg(long)]
    pub ace_step_dir: Option<PathBuf>,

    /// Override the intra-op thread count.
    #[arg(long)]
    pub threads: Option<u32>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    pub fn is_daemon_mode(&self) -> bool {
        self.daemon
    }

    pub fn is_one_shot(&self) -> bool {
        !self.daemon && self.prompt.is_some()
    }

    /// Output path for one-shot mode.
    pub fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| PathBuf::from("output.wav"))
    }

    /// Builds the effective configuration: file (if given), then flag
    /// overrides.
    pub fn build_config(&self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::load(path)?,
            None => DaemonConfig::default(),
        };

        if let Some(device) = &self.device {
            config.device = Device::parse(device).ok_or_else(|| {
                DaemonError::with_context(
                    ErrorCode::ModelLoadFailed,
                    format!("unknown device \"{device}\" (expected auto, cpu, cuda, or metal)"),
                    device.clone(),
                )
            })?;
        }
        if let Some(dir) = &self.cache_dir {
            config.cache_path = Some(dir.clone());
        }
        if let Some(dir) = &self.musicgen_dir {
            config.musicgen_model_path = Some(dir.clone());
        }
        if let Some(dir) = &self.ace_step_dir {
            config.ace_step_model_path = Some(dir.clone());
        }
        if let Some(threads) = self.threads {
            config.threads = Some(threads);
        }

        if let Some(problem) = config.validate() {
            return Err(DaemonError::with_context(
                ErrorCode::ModelLoadFailed,
                format!("invalid configuration: {problem}"),
                problem,
            ));
        }
        Ok(config)
    }
}
