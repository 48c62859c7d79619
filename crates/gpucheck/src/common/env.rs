macro_rules! create_gpucheck_env {
    ($name: literal) => {
        concat!("GPUCHECK_", $name)
    };
}

/// Location of the driver installer daemon set manifest.
pub const NVIDIA_DRIVER_INSTALLER_DAEMONSET: &str = "NVIDIA_DRIVER_INSTALLER_DAEMONSET";

pub const GPUCHECK_OUTPUT_MODE: &str = create_gpucheck_env!("OUTPUT_MODE");
pub const GPUCHECK_DEBUG: &str = create_gpucheck_env!("DEBUG");
pub const GPUCHECK_KUBECTL: &str = create_gpucheck_env!("KUBECTL");
pub const GPUCHECK_NAMESPACE: &str = create_gpucheck_env!("NAMESPACE");
