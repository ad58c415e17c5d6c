//! cadenced: an offline text-to-music generation daemon.
//!
//! Prompts come in over a line-delimited JSON-RPC 2.0 stream on
//! stdin/stdout; audio comes out as WAV files in a content-addressed cache,
//! with progress streamed back as notifications. Two ONNX back-ends share
//! the job/queue/cache substrate: an autoregressive 4-codebook transformer
//! (musicgen) and a latent-diffusion pipeline (ace_step).
//!
//! # Modules
//!
//! - [`config`] / [`cli`]: runtime configuration and the command line
//! - [`error`]: stable error codes shared with the RPC surface
//! - [`types`]: tracks, jobs, model architecture records
//! - [`audio`]: WAV output and resampling
//! - [`cache`]: the on-disk track store with LRU eviction
//! - [`generation`]: queue, job table, worker thread, progress
//! - [`models`]: the two inference back-ends and their asset handling
//! - [`rpc`]: protocol framing, dispatch, and method handlers

pub mod audio;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod generation;
pub mod models;
pub mod rpc;
pub mod types;

pub use config::{DaemonConfig, Device};
pub use error::{DaemonError, ErrorCode, Result};
pub use models::Backend;
pub use types::{compute_track_id, GenerationJob, JobPriority, JobStatus, Track};
