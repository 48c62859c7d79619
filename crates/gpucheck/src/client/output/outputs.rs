use crate::gatherer::UsageSummary;
use crate::orchestrator::RunReport;
use crate::probe::CapacityReport;

#[allow(clippy::upper_case_acronyms)]
#[derive(clap::ValueEnum, Clone)]
pub enum Outputs {
    CLI,
    JSON,
}

pub trait Output {
    fn print_run_report(&self, report: &RunReport);
    /// Usage gathered during a run that did not succeed.
    fn print_usage_summary(&self, usage: &UsageSummary);
    fn print_capacity(&self, report: &CapacityReport);

    fn print_error(&self, error: anyhow::Error);
}
