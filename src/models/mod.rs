//! Model back-ends and their shared infrastructure.
//!
//! - [`musicgen`]: autoregressive 4-codebook back-end
//! - [`ace_step`]: latent-diffusion back-end
//! - [`backend`]: the tagged union dispatching between them
//! - [`device`]: execution-provider selection
//! - [`loader`]: session loading and asset presence checks
//! - [`fetch`]: one-time asset downloader

pub mod ace_step;
pub mod backend;
pub mod device;
pub mod fetch;
pub mod loader;
pub mod musicgen;

/// Token frames per second of audio in the AR back-end.
pub const TOKENS_PER_SECOND: usize = 50;

pub use backend::{Backend, BackendStates, BackendStatus, GenerateSpec, LoadedModels};
pub use fetch::{fetch_backend_assets, DownloadProgress};
pub use loader::{backend_version, is_installed, load_backend};
