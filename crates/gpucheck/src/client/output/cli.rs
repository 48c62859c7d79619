use cli_table::format::{Justify, Separator};
use cli_table::{Cell, CellStruct, Color, ColorChoice, Style, Table, TableStruct, print_stdout};

use crate::client::output::outputs::Output;
use crate::cluster::Quantity;
use crate::common::format::{human_cores, human_duration, human_size};
use crate::gatherer::UsageSummary;
use crate::orchestrator::RunReport;
use crate::probe::CapacityReport;

pub struct CliOutput {
    color_policy: ColorChoice,
}

impl CliOutput {
    pub fn new(color_policy: ColorChoice) -> CliOutput {
        CliOutput { color_policy }
    }

    fn print_vertical_table(&self, rows: Vec<Vec<CellStruct>>) {
        let table = rows.table().separator(
            Separator::builder()
                .column(Some(Default::default()))
                .build(),
        );
        self.print_table(table);
    }

    fn print_horizontal_table(&self, rows: Vec<Vec<CellStruct>>, header: Vec<CellStruct>) {
        let table = rows
            .table()
            .separator(
                Separator::builder()
                    .title(Some(Default::default()))
                    .column(Some(Default::default()))
                    .build(),
            )
            .title(header);
        self.print_table(table);
    }

    fn print_table(&self, table: TableStruct) {
        let table = table.color_choice(self.color_policy);
        if let Err(e) = print_stdout(table) {
            log::error!("Cannot print table to stdout: {e:?}");
        }
    }
}

fn verdict_cell(ok: bool, yes: &str, no: &str) -> CellStruct {
    let (text, color) = if ok {
        (yes, Color::Green)
    } else {
        (no, Color::Red)
    };
    text.cell().foreground_color(Some(color)).bold(true)
}

fn quantity_cell(value: Option<Quantity>) -> CellStruct {
    match value {
        Some(value) => value.cell().justify(Justify::Right),
        None => "".cell(),
    }
}

impl Output for CliOutput {
    fn print_run_report(&self, report: &RunReport) {
        let pods = report
            .watched_pods
            .iter()
            .map(|pod| format!("{}/{}", pod.namespace, pod.name))
            .collect::<Vec<_>>()
            .join("\n");
        let rows = vec![
            vec![
                "Result".cell().bold(true),
                "SUCCESS"
                    .cell()
                    .foreground_color(Some(Color::Green))
                    .bold(true),
            ],
            vec!["Resource".cell().bold(true), report.resource.as_str().cell()],
            vec![
                "Driver installer".cell().bold(true),
                report.manifest_url.as_str().cell(),
            ],
            vec!["Watched pods".cell().bold(true), pods.cell()],
            vec!["Workloads".cell().bold(true), report.workloads.len().cell()],
            vec![
                "Time to capacity".cell().bold(true),
                human_duration(report.readiness_elapsed).cell(),
            ],
            vec![
                "Total time".cell().bold(true),
                human_duration(report.elapsed).cell(),
            ],
        ];
        self.print_vertical_table(rows);

        if let Some(usage) = &report.usage {
            self.print_usage_summary(usage);
        }
    }

    fn print_usage_summary(&self, usage: &UsageSummary) {
        let rows: Vec<_> = usage
            .percentiles
            .iter()
            .flat_map(|(percentile, containers)| {
                containers.iter().map(move |container| {
                    vec![
                        format!("p{percentile}").cell(),
                        container.container.as_str().cell(),
                        human_cores(container.cpu_cores)
                            .cell()
                            .justify(Justify::Right),
                        human_size(container.memory_working_set_bytes)
                            .cell()
                            .justify(Justify::Right),
                        human_size(container.memory_rss_bytes)
                            .cell()
                            .justify(Justify::Right),
                    ]
                })
            })
            .collect();
        let header = vec![
            "Percentile".cell().bold(true),
            "Container".cell().bold(true),
            "CPU".cell().bold(true),
            "Memory (working set)".cell().bold(true),
            "Memory (RSS)".cell().bold(true),
        ];
        self.print_horizontal_table(rows, header);
        println!("Usage samples: {}", usage.sample_count);

        if !usage.violations.is_empty() {
            let rows = usage
                .violations
                .iter()
                .map(|violation| {
                    vec![
                        violation
                            .container
                            .as_str()
                            .cell()
                            .foreground_color(Some(Color::Red)),
                        format!("p{}", violation.percentile).cell(),
                        format!(
                            "{} / {}",
                            human_cores(violation.cpu_cores),
                            human_cores(violation.constraint.cpu_cores)
                        )
                        .cell(),
                        format!(
                            "{} / {}",
                            human_size(violation.memory_bytes),
                            human_size(violation.constraint.memory_bytes)
                        )
                        .cell(),
                    ]
                })
                .collect();
            let header = vec![
                "Constraint violated by".cell().bold(true),
                "Percentile".cell().bold(true),
                "CPU (used / limit)".cell().bold(true),
                "Memory (used / limit)".cell().bold(true),
            ];
            self.print_horizontal_table(rows, header);
        }
    }

    fn print_capacity(&self, report: &CapacityReport) {
        let rows = report
            .nodes
            .iter()
            .map(|node| {
                vec![
                    node.name.as_str().cell(),
                    if node.schedulable { "yes" } else { "no" }.cell(),
                    quantity_cell(node.capacity),
                    quantity_cell(node.allocatable),
                ]
            })
            .collect();
        let header = vec![
            "Node".cell().bold(true),
            "Schedulable".cell().bold(true),
            format!("Capacity ({})", report.resource).cell().bold(true),
            format!("Allocatable ({})", report.resource).cell().bold(true),
        ];
        self.print_horizontal_table(rows, header);

        let rows = vec![
            vec![
                "Ready".cell().bold(true),
                verdict_cell(report.ready, "yes", "no"),
            ],
            vec![
                "Total allocatable".cell().bold(true),
                report.total_allocatable.cell(),
            ],
        ];
        self.print_vertical_table(rows);
    }

    fn print_error(&self, error: anyhow::Error) {
        eprintln!("{error:?}");
    }
}
