//! Formatting helpers for progress logs.

const UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];

/// Bytes as a decimal size, `483740` is `483.74 KB`.
pub fn to_human_readable(n: u64) -> String {
    if n < 1000 {
        return format!("{n} B");
    }

    let mut value = n as f64;
    let mut unit = 0;

    // round first, so 999_999 is shown as 1.00 MB and not 1000.00 KB
    while (value * 100.0).round() / 100.0 >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }

    format!("{value:.2} {}", UNITS[unit])
}

/// Percentage of `part` in `whole`, with one decimal. An empty whole is
/// complete.
pub fn to_percent(part: u64, whole: u64) -> String {
    if whole == 0 {
        return "100.0%".to_owned();
    }
    format!("{:.1}%", part as f64 * 100.0 / whole as f64)
}
