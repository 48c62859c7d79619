pub mod client;
pub mod cluster;
pub mod common;
pub mod gatherer;
pub mod orchestrator;
pub mod probe;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::GpuCheckError;
pub type Result<T> = std::result::Result<T, Error>;

/// Name of the resource advertised by the NVIDIA device plugin.
pub const NVIDIA_GPU_RESOURCE_NAME: &str = "nvidia.com/gpu";

/// Manifest of the daemon set that installs NVIDIA drivers on GPU nodes.
pub const DEFAULT_DRIVER_INSTALLER_MANIFEST: &str = "https://raw.githubusercontent.com/GoogleCloudPlatform/container-engine-accelerators/master/daemonset.yaml";

pub const GPUCHECK_VERSION: &str = env!("CARGO_PKG_VERSION");
