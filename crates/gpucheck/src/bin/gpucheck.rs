use std::io::IsTerminal;

use clap::{CommandFactory, FromArgMatches};
use cli_table::ColorChoice;
use tokio::task::LocalSet;

use gpucheck::client::commands::{command_capacity, command_run};
use gpucheck::client::globalsettings::GlobalSettings;
use gpucheck::client::output::cli::CliOutput;
use gpucheck::client::output::json::JsonOutput;
use gpucheck::client::output::outputs::{Output, Outputs};
use gpucheck::common::cli::{ColorPolicy, CommonOpts, RootOptions, SubCommand};
use gpucheck::common::setup::setup_logging;

fn make_global_settings(opts: CommonOpts) -> GlobalSettings {
    let color_policy = match opts.colors {
        ColorPolicy::Always => ColorChoice::AlwaysAnsi,
        ColorPolicy::Auto => {
            if std::io::stdout().is_terminal() {
                ColorChoice::Auto
            } else {
                ColorChoice::Never
            }
        }
        ColorPolicy::Never => ColorChoice::Never,
    };

    let printer: Box<dyn Output> = match opts.output_mode {
        Outputs::CLI => Box::new(CliOutput::new(color_policy)),
        Outputs::JSON => Box::<JsonOutput>::default(),
    };
    GlobalSettings::new(printer)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let matches = RootOptions::command().get_matches();
    let top_opts = match RootOptions::from_arg_matches(&matches) {
        Ok(opts) => opts,
        Err(error) => error.exit(),
    };

    setup_logging(top_opts.common.debug);

    let gsettings = make_global_settings(top_opts.common);

    // Usage gathering runs in a local task next to the orchestration
    let local_set = LocalSet::new();
    let result = local_set
        .run_until(async {
            match top_opts.subcmd {
                SubCommand::Run(opts) => command_run(&gsettings, opts).await,
                SubCommand::Capacity(opts) => command_capacity(&gsettings, opts).await,
            }
        })
        .await;

    if let Err(e) = result {
        gsettings.printer().print_error(e);
        std::process::exit(1);
    }

    Ok(())
}
