//! Human readable sizes, durations and update time estimates

const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
const UNIT_STEP: f64 = 1024.0;

/// Conservative WiFi upload throughput used for estimates
const ASSUMED_THROUGHPUT_KB_PER_SEC: f64 = 50.0;
/// Validation, flash write and restart on top of the transfer
const UPDATE_OVERHEAD_SECS: u64 = 20;

/// Format a byte count with 1024 based units, e.g. `1.5 KB`
pub fn format_size(bytes: u64) -> String {
    format_scaled(bytes as f64)
}

/// Format a transfer rate, e.g. `12.3 KB/s`
pub fn format_rate(bytes_per_sec: f64) -> String {
    format!("{}/s", format_scaled(bytes_per_sec))
}

fn format_scaled(bytes: f64) -> String {
    if !bytes.is_finite() || bytes <= 0.0 {
        return "0 B".to_string();
    }

    let mut value = bytes;
    let mut unit = 0;
    while value >= UNIT_STEP && unit < UNITS.len() - 1 {
        value /= UNIT_STEP;
        unit += 1;
    }

    format!("{} {}", two_decimals(value), UNITS[unit])
}

fn two_decimals(value: f64) -> String {
    let rounded = (value * 100.0).round() / 100.0;
    let text = format!("{rounded:.2}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Format seconds as `42s` below one minute, otherwise as `3m 5s`
pub fn format_duration(seconds: f64) -> String {
    let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };

    if seconds < 60.0 {
        return format!("{}s", seconds.round() as u64);
    }

    let total = seconds.round() as u64;
    format!("{}m {}s", total / 60, total % 60)
}

/// Estimated seconds from upload start until the device runs the new firmware
pub fn estimate_upload_seconds(size_bytes: u64) -> u64 {
    let size_kb = size_bytes as f64 / UNIT_STEP;
    let upload_secs = (size_kb / ASSUMED_THROUGHPUT_KB_PER_SEC).ceil() as u64;
    upload_secs + UPDATE_OVERHEAD_SECS
}

/// Estimated update duration in words, e.g. `1 minute 4 seconds`
pub fn estimate_upload_duration(size_bytes: u64) -> String {
    let total = estimate_upload_seconds(size_bytes);
    let minutes = total / 60;
    let seconds = total % 60;

    if minutes > 0 {
        format!(
            "{} {}",
            pluralize(minutes, "minute"),
            pluralize(seconds, "second")
        )
    } else {
        pluralize(seconds, "second")
    }
}

fn pluralize(count: u64, word: &str) -> String {
    if count == 1 {
        format!("{count} {word}")
    } else {
        format!("{count} {word}s")
    }
}
