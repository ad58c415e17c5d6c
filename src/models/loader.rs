//! Session loading and asset presence checks.

use std::path::{Path, PathBuf};

use ort::execution_providers::ExecutionProviderDispatch;
use ort::session::Session;

use crate::config::DaemonConfig;
use crate::error::{DaemonError, Result};

use super::backend::{Backend, LoadedModels};
use super::device::{device_name, providers_for};
use super::{ace_step, musicgen};

/// Opens one ONNX session with the configured providers and thread count.
pub fn load_session(
    model_path: &Path,
    providers: &[ExecutionProviderDispatch],
    threads: Option<u32>,
) -> Result<Session> {
    if !model_path.exists() {
        return Err(DaemonError::model_not_found(format!(
            "model file not found: {}",
            model_path.display()
        )));
    }

    let mut builder = Session::builder()
        .map_err(|e| DaemonError::model_load_failed(format!("cannot create session builder: {e}")))?;

    if !providers.is_empty() {
        builder = builder
            .with_execution_providers(providers.to_vec())
            .map_err(|e| {
                DaemonError::model_load_failed(format!("cannot register providers: {e}"))
            })?;
    }
    if let Some(threads) = threads {
        builder = builder.with_intra_threads(threads as usize).map_err(|e| {
            DaemonError::model_load_failed(format!("cannot set thread count: {e}"))
        })?;
    }

    builder.commit_from_file(model_path).map_err(|e| {
        DaemonError::model_load_failed(format!("cannot load {}: {e}", model_path.display()))
    })
}

/// Checks that every file in `required` exists under `dir`. The error lists
/// everything that is missing.
pub fn missing_files(dir: &Path, required: &[&str]) -> Result<()> {
    let missing: Vec<&str> = required
        .iter()
        .filter(|file| !dir.join(file).exists())
        .copied()
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(DaemonError::model_not_found(format!(
            "missing model files in {}: {}",
            dir.display(),
            missing.join(", ")
        )))
    }
}

/// Required file list for a back-end.
pub fn required_files(backend: Backend) -> &'static [&'static str] {
    match backend {
        Backend::MusicGen => musicgen::REQUIRED_FILES,
        Backend::AceStep => ace_step::REQUIRED_FILES,
    }
}

/// Download sources for a back-end.
pub fn asset_urls(backend: Backend) -> &'static [(&'static str, &'static str)] {
    match backend {
        Backend::MusicGen => musicgen::ASSET_URLS,
        Backend::AceStep => ace_step::ASSET_URLS,
    }
}

/// True when every required asset of the back-end exists in `dir`.
pub fn is_installed(backend: Backend, dir: &Path) -> bool {
    missing_files(dir, required_files(backend)).is_ok()
}

/// Model-version string derived from the installed assets.
pub fn backend_version(backend: Backend, dir: &Path) -> String {
    match backend {
        Backend::MusicGen => musicgen::detect_version(dir),
        Backend::AceStep => ace_step::detect_version(dir),
    }
}

/// Loads the session set for a back-end.
pub fn load_backend(backend: Backend, config: &DaemonConfig) -> Result<LoadedModels> {
    let dir: PathBuf = config.model_dir(backend);
    let providers = providers_for(config.device);
    let device = device_name(config.device);

    match backend {
        Backend::MusicGen => Ok(LoadedModels::MusicGen(musicgen::MusicGenModels::load(
            &dir,
            &providers,
            config.threads,
            device,
        )?)),
        Backend::AceStep => Ok(LoadedModels::AceStep(ace_step::AceStepModels::load(
            &dir,
            &providers,
            config.threads,
            device,
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_files_lists_all_gaps() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.onnx"), b"x").unwrap();

        let err = missing_files(dir.path(), &["a.onnx", "b.onnx", "c.json"]).unwrap_err();
        assert!(err.message.contains("b.onnx"));
        assert!(err.message.contains("c.json"));
        assert!(!err.message.contains("a.onnx,"));
    }

    #[test]
    fn all_present_is_ok() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.onnx"), b"x").unwrap();
        assert!(missing_files(dir.path(), &["a.onnx"]).is_ok());
    }

    #[test]
    fn not_installed_without_assets() {
        let dir = tempdir().unwrap();
        assert!(!is_installed(Backend::MusicGen, dir.path()));
        assert!(!is_installed(Backend::AceStep, dir.path()));
    }

    #[test]
    fn installed_when_required_files_exist() {
        let dir = tempdir().unwrap();
        for file in required_files(Backend::MusicGen) {
            std::fs::write(dir.path().join(file), b"stub").unwrap();
        }
        assert!(is_installed(Backend::MusicGen, dir.path()));
    }

    #[test]
    fn version_strings_are_stable() {
        let dir = tempdir().unwrap();
        assert!(backend_version(Backend::MusicGen, dir.path()).starts_with("musicgen-small"));
        assert_eq!(backend_version(Backend::AceStep, dir.path()), "ace-step-v1");
    }
}
