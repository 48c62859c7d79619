use std::time::Duration;

/// Formats a duration, truncated to a precision that is reasonable for its magnitude.
pub fn human_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let truncated = if secs >= 60 * 60 {
        Duration::from_secs(secs / 60 * 60)
    } else if secs >= 60 {
        Duration::from_secs(secs)
    } else {
        Duration::from_millis(duration.as_millis() as u64)
    };
    humantime::format_duration(truncated).to_string()
}

pub fn human_size(size: u64) -> String {
    if size < 2048 {
        format!("{size} B")
    } else if size < 2 * 1024 * 1024 {
        format!("{:.2} KiB", size as f64 / 1024.0)
    } else if size < 2 * 1024 * 1024 * 1024 {
        format!("{:.2} MiB", size as f64 / (1024 * 1024) as f64)
    } else {
        format!("{:.2} GiB", size as f64 / (1024 * 1024 * 1024) as f64)
    }
}

pub fn human_cores(cores: f64) -> String {
    if cores < 1.0 {
        format!("{:.0}m", cores * 1000.0)
    } else {
        format!("{cores:.2}")
    }
}
