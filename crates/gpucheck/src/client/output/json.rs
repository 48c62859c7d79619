use serde::Serialize;
use serde_json::json;

use crate::client::output::outputs::Output;
use crate::gatherer::UsageSummary;
use crate::orchestrator::RunReport;
use crate::probe::CapacityReport;

#[derive(Default)]
pub struct JsonOutput;

impl JsonOutput {
    fn print<T: Serialize>(&self, data: &T) {
        match serde_json::to_string_pretty(data) {
            Ok(output) => println!("{output}"),
            Err(error) => log::error!("Cannot serialize output: {error}"),
        }
    }
}

impl Output for JsonOutput {
    fn print_run_report(&self, report: &RunReport) {
        self.print(report);
    }

    fn print_usage_summary(&self, usage: &UsageSummary) {
        self.print(&json!({ "usage": usage }));
    }

    fn print_capacity(&self, report: &CapacityReport) {
        self.print(report);
    }

    fn print_error(&self, error: anyhow::Error) {
        self.print(&json!({ "error": format!("{error:?}") }));
    }
}
