use std::io::Write;

use env_logger::fmt::Formatter;
use env_logger::fmt::style::{AnsiColor, Style};
use env_logger::{DEFAULT_FILTER_ENV, Env};
use log::Record;

/// Initializes the global logger.
///
/// Logs at `info` level, or `debug` with `verbose`. A filter in `RUST_LOG` replaces the default
/// level. Detailed records (millisecond timestamps, module targets) are used whenever debug
/// output can appear, otherwise records are shortened to `<time> <level> <message>`.
pub fn setup_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let env = Env::default().default_filter_or(default_filter);
    let mut builder = env_logger::Builder::from_env(env);

    let filter = std::env::var(DEFAULT_FILTER_ENV).ok();
    if uses_detailed_format(verbose, filter.as_deref()) {
        builder.format_timestamp_millis().format_target(true);
    } else {
        builder.format(write_short_record);
    }
    builder.init();
}

fn uses_detailed_format(verbose: bool, filter: Option<&str>) -> bool {
    verbose || filter.is_some_and(|filter| filter.contains("debug") || filter.contains("trace"))
}

fn write_short_record(buf: &mut Formatter, record: &Record) -> std::io::Result<()> {
    let dimmed = Style::new().fg_color(Some(AnsiColor::BrightBlack.into()));
    let level = buf.default_level_style(record.level()).bold();
    let time = chrono::Local::now().format("%H:%M:%S");
    writeln!(
        buf,
        "{dimmed}{time}{dimmed:#} {level}{:<5}{level:#} {}",
        record.level(),
        record.args()
    )
}
