use std::rc::Rc;

use crate::client::globalsettings::GlobalSettings;
use crate::cluster::kubectl::KubectlClient;
use crate::cluster::{DaemonSetRef, ResourceName};
use crate::common::cli::{CapacityOpts, RunOpts};
use crate::gatherer::{GathererOptions, ResourceConstraints};
use crate::orchestrator::{RunConfig, RunConfigBuilder, WorkloadOrchestrator};
use crate::probe::CapacityProbe;

pub fn make_run_config(opts: RunOpts) -> anyhow::Result<RunConfig> {
    let device_plugin = (!opts.no_device_plugin).then(|| DaemonSetRef {
        namespace: opts.device_plugin_namespace,
        name: opts.device_plugin_name,
    });
    let constraints: ResourceConstraints = opts
        .constraints
        .into_iter()
        .map(|constraint| constraint.unpack())
        .collect();

    let config = RunConfigBuilder::default()
        .manifest_url(opts.driver_installer_manifest)
        .namespace(opts.namespace)
        .resource(ResourceName::new(opts.cluster.resource))
        .image(opts.image)
        .device_plugin(device_plugin)
        .gather_usage(!opts.no_gather)
        .gatherer(GathererOptions {
            period: opts.gather_period.unpack(),
            probe_duration: opts.probe_duration.unpack(),
        })
        .poll_interval(opts.poll_interval.unpack())
        .driver_install_timeout(opts.driver_install_timeout.unpack())
        .workload_timeout(opts.workload_timeout.unpack())
        .percentiles(opts.percentiles)
        .constraints(constraints)
        .build()?;
    Ok(config)
}

/// Runs the whole check. Has to be called inside a [`tokio::task::LocalSet`].
pub async fn command_run(gsettings: &GlobalSettings, opts: RunOpts) -> anyhow::Result<()> {
    let api = Rc::new(KubectlClient::new(opts.cluster.kubectl.clone()));
    let orchestrator = WorkloadOrchestrator::new(api, make_run_config(opts)?);
    match orchestrator.run().await {
        Ok(report) => {
            gsettings.printer().print_run_report(&report);
            Ok(())
        }
        Err(failure) => {
            if let Some(usage) = &failure.usage {
                gsettings.printer().print_usage_summary(usage);
            }
            Err(failure.into())
        }
    }
}

pub async fn command_capacity(
    gsettings: &GlobalSettings,
    opts: CapacityOpts,
) -> anyhow::Result<()> {
    let probe = CapacityProbe::new(Rc::new(KubectlClient::new(opts.cluster.kubectl)));
    let report = probe.report(&ResourceName::new(opts.cluster.resource)).await?;
    gsettings.printer().print_capacity(&report);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::Parser;

    use super::make_run_config;
    use crate::common::cli::{RootOptions, RunOpts, SubCommand};

    fn run_opts(args: &[&str]) -> RunOpts {
        let args = ["gpucheck", "run"].into_iter().chain(args.iter().copied());
        match RootOptions::try_parse_from(args).unwrap().subcmd {
            SubCommand::Run(opts) => opts,
            _ => panic!("Expected run command"),
        }
    }

    #[test]
    fn default_run_config() {
        let config = make_run_config(run_opts(&[])).unwrap();
        assert_eq!(config.manifest_url, crate::DEFAULT_DRIVER_INSTALLER_MANIFEST);
        assert_eq!(config.namespace, "gpucheck");
        assert_eq!(config.resource.as_str(), "nvidia.com/gpu");
        assert_eq!(
            config.device_plugin.unwrap().to_string(),
            "kube-system/nvidia-gpu-device-plugin"
        );
        assert!(config.gather_usage);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.driver_install_timeout, Duration::from_secs(600));
        assert_eq!(config.workload_timeout, Duration::from_secs(300));
        assert_eq!(config.gatherer.period, Duration::from_secs(2));
        assert_eq!(config.gatherer.probe_duration, Duration::from_secs(2));
        assert_eq!(config.percentiles, vec![50, 90, 100]);
        assert!(config.constraints.is_empty());
    }

    #[test]
    fn run_config_overrides() {
        let config = make_run_config(run_opts(&[
            "--driver-installer-manifest",
            "https://example.com/installer.yaml",
            "--no-device-plugin",
            "--no-gather",
            "--workload-timeout",
            "1m",
            "--constraint",
            "installer=1:1Gi",
        ]))
        .unwrap();
        assert_eq!(config.manifest_url, "https://example.com/installer.yaml");
        assert!(config.device_plugin.is_none());
        assert!(!config.gather_usage);
        assert_eq!(config.workload_timeout, Duration::from_secs(60));
        assert_eq!(config.constraints["installer"].cpu_cores, 1.0);
    }
}
