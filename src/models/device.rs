//! Execution-provider selection for ONNX Runtime.
//!
//! `Device::Auto` probes which accelerators actually register on this
//! machine and picks the first working one, in CUDA > CoreML > CPU order.

use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider,
    ExecutionProviderDispatch,
};
use ort::session::Session;
use tracing::debug;

use crate::config::Device;

/// A provider that registered successfully on this machine.
pub struct DetectedProvider {
    /// Display name used in logs and `get_backends` output.
    pub name: &'static str,
    pub provider: ExecutionProviderDispatch,
}

/// Probes the accelerators available on this machine.
///
/// Each candidate is registered against a throwaway session builder; the
/// ones that succeed are returned in priority order. CPU is always last and
/// always present.
pub fn detect_providers() -> Vec<DetectedProvider> {
    let mut detected = Vec::new();

    if let Ok(mut builder) = Session::builder() {
        let cuda = CUDAExecutionProvider::default();
        if cuda.register(&mut builder).is_ok() {
            detected.push(DetectedProvider {
                name: "CUDA",
                provider: cuda.build(),
            });
        }
    }

    if let Ok(mut builder) = Session::builder() {
        let coreml = CoreMLExecutionProvider::default();
        if coreml.register(&mut builder).is_ok() {
            detected.push(DetectedProvider {
                name: "CoreML",
                provider: coreml.build(),
            });
        }
    }

    detected.push(DetectedProvider {
        name: "CPU",
        provider: CPUExecutionProvider::default().build(),
    });

    debug!(
        providers = ?detected.iter().map(|p| p.name).collect::<Vec<_>>(),
        "execution providers detected"
    );
    detected
}

/// Resolves the configured device to the provider list handed to each
/// session builder.
pub fn providers_for(device: Device) -> Vec<ExecutionProviderDispatch> {
    match device {
        Device::Auto => match detect_providers().into_iter().next() {
            Some(first) => vec![first.provider],
            None => vec![CPUExecutionProvider::default().build()],
        },
        Device::Cpu => vec![CPUExecutionProvider::default().build()],
        Device::Cuda => vec![CUDAExecutionProvider::default().build()],
        Device::Metal => vec![CoreMLExecutionProvider::default().build()],
    }
}

/// Display name of the device that `providers_for` resolves to.
pub fn device_name(device: Device) -> &'static str {
    match device {
        Device::Auto => detect_providers()
            .first()
            .map(|p| p.name)
            .unwrap_or("CPU"),
        Device::Cpu => "CPU",
        Device::Cuda => "CUDA",
        Device::Metal => "CoreML",
    }
}
