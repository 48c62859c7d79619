use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use crate::client::output::outputs::Outputs;
use crate::cluster::quantity::parse_quantity;
use crate::common::env::{
    GPUCHECK_DEBUG, GPUCHECK_KUBECTL, GPUCHECK_NAMESPACE, GPUCHECK_OUTPUT_MODE,
    NVIDIA_DRIVER_INSTALLER_DAEMONSET,
};
use crate::gatherer::ResourceConstraint;
use crate::orchestrator::{
    DEFAULT_DEVICE_PLUGIN_NAME, DEFAULT_DEVICE_PLUGIN_NAMESPACE, DEFAULT_NAMESPACE,
    DEFAULT_WORKLOAD_IMAGE,
};

/// Creates a newtype around a value parsed from a command line argument.
macro_rules! arg_wrapper {
    ($name:ident, $wrapped_type:ty, $parser:expr) => {
        #[derive(Clone, Debug)]
        pub struct $name($wrapped_type);

        impl ::std::str::FromStr for $name {
            type Err = ::anyhow::Error;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                ::std::result::Result::Ok(Self($parser(s)?))
            }
        }

        impl $name {
            pub fn get(&self) -> &$wrapped_type {
                &self.0
            }
            pub fn unpack(self) -> $wrapped_type {
                self.0
            }
        }
    };
}

arg_wrapper!(ArgDuration, Duration, humantime::parse_duration);
arg_wrapper!(ArgConstraint, (String, ResourceConstraint), parse_constraint);

/// Parses CPU cores given either as a number (`0.5`) or in millicores (`500m`).
fn parse_cpu_cores(value: &str) -> anyhow::Result<f64> {
    let cores = match value.strip_suffix('m') {
        Some(millicores) => millicores.parse::<f64>()? / 1000.0,
        None => value.parse::<f64>()?,
    };
    if !cores.is_finite() || cores < 0.0 {
        anyhow::bail!("CPU cores must be a non-negative number, not `{value}`");
    }
    Ok(cores)
}

/// Parses `<container>=<cpu-cores>:<memory>`, e.g. `nvidia-driver-installer=0.5:512Mi`.
pub fn parse_constraint(value: &str) -> anyhow::Result<(String, ResourceConstraint)> {
    let (name, limits) = value
        .split_once('=')
        .context("Constraint has to be in the form <container>=<cpu-cores>:<memory>")?;
    let (cpu, memory) = limits
        .split_once(':')
        .context("Constraint limits have to be in the form <cpu-cores>:<memory>")?;
    if name.is_empty() {
        anyhow::bail!("Constraint is missing a container name");
    }

    let cpu_cores = parse_cpu_cores(cpu).with_context(|| format!("Invalid CPU cores `{cpu}`"))?;
    let memory_bytes = parse_quantity(memory)?;
    let memory_bytes = u64::try_from(memory_bytes)
        .with_context(|| format!("Memory limit `{memory}` cannot be negative"))?;
    Ok((
        name.to_string(),
        ResourceConstraint {
            cpu_cores,
            memory_bytes,
        },
    ))
}

#[derive(clap::ValueEnum, Clone)]
pub enum ColorPolicy {
    /// Use colors if the stdout is detected to be a terminal.
    Auto,
    /// Always use colors.
    Always,
    /// Never use colors.
    Never,
}

// Common CLI options
#[derive(Parser)]
pub struct CommonOpts {
    /// Sets console color policy
    #[arg(
        long,
        default_value_t = ColorPolicy::Auto,
        value_enum,
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub colors: ColorPolicy,

    /// Sets output formatting
    #[arg(
        long,
        env = GPUCHECK_OUTPUT_MODE,
        default_value_t = Outputs::CLI,
        value_enum,
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub output_mode: Outputs,

    /// Enables more detailed log output
    #[arg(
        long,
        env = GPUCHECK_DEBUG,
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub debug: bool,
}

// Root CLI options
#[derive(Parser)]
#[command(
    author,
    about,
    version(crate::GPUCHECK_VERSION),
    disable_help_subcommand(true),
    help_expected(true)
)]
pub struct RootOptions {
    #[clap(flatten)]
    pub common: CommonOpts,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Parser)]
pub enum SubCommand {
    /// Installs the GPU driver, waits for GPU capacity and runs one workload per GPU
    Run(RunOpts),
    /// Shows GPU capacity of the cluster nodes
    Capacity(CapacityOpts),
}

#[derive(Parser)]
pub struct ClusterOpts {
    /// Resource whose capacity is checked
    #[arg(long, default_value = crate::NVIDIA_GPU_RESOURCE_NAME)]
    pub resource: String,

    /// Path to the `kubectl` binary
    #[arg(long, env = GPUCHECK_KUBECTL, default_value = "kubectl")]
    pub kubectl: PathBuf,
}

#[derive(Parser)]
pub struct RunOpts {
    #[clap(flatten)]
    pub cluster: ClusterOpts,

    /// URL of the NVIDIA driver installer daemon set manifest
    #[arg(
        long,
        env = NVIDIA_DRIVER_INSTALLER_DAEMONSET,
        default_value = crate::DEFAULT_DRIVER_INSTALLER_MANIFEST
    )]
    pub driver_installer_manifest: String,

    /// Namespace of the driver installer and of the workloads
    #[arg(long, env = GPUCHECK_NAMESPACE, default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Container image of the workloads
    #[arg(long, default_value = DEFAULT_WORKLOAD_IMAGE)]
    pub image: String,

    /// Namespace of the pre-installed device plugin daemon set
    #[arg(long, default_value = DEFAULT_DEVICE_PLUGIN_NAMESPACE)]
    pub device_plugin_namespace: String,

    /// Name of the pre-installed device plugin daemon set
    #[arg(long, default_value = DEFAULT_DEVICE_PLUGIN_NAME)]
    pub device_plugin_name: String,

    /// Do not watch the pods of the device plugin
    #[arg(long)]
    pub no_device_plugin: bool,

    /// Do not gather resource usage of the driver installer
    #[arg(long)]
    pub no_gather: bool,

    /// Time between two capacity checks
    #[arg(long, default_value = "1s")]
    pub poll_interval: ArgDuration,

    /// How long to wait for the resource to appear on all schedulable nodes
    #[arg(long, default_value = "10m")]
    pub driver_install_timeout: ArgDuration,

    /// How long to wait for each workload to succeed
    #[arg(long, default_value = "5m")]
    pub workload_timeout: ArgDuration,

    /// Time between two usage sampling rounds
    #[arg(long, default_value = "2s")]
    pub gather_period: ArgDuration,

    /// Maximum duration of a single node usage probe
    #[arg(long, default_value = "2s")]
    pub probe_duration: ArgDuration,

    /// Percentiles of the usage summary
    #[arg(
        long,
        value_delimiter(','),
        default_value = "50,90,100",
        value_parser = clap::value_parser!(u32).range(0..=100)
    )]
    pub percentiles: Vec<u32>,

    /// Usage limit of a container, e.g. `nvidia-driver-installer=0.5:512Mi`.
    /// Can be used multiple times.
    #[arg(long = "constraint")]
    pub constraints: Vec<ArgConstraint>,
}

#[derive(Parser)]
pub struct CapacityOpts {
    #[clap(flatten)]
    pub cluster: ClusterOpts,
}
