//! Display strings for latency, rates and transfer progress.

use std::time::Duration;

const KIB: f64 = 1024.0;
const MIB: f64 = 1024.0 * 1024.0;

pub fn format_latency(rtt: Duration) -> String {
    format!("{} ms", rtt.as_millis())
}

/// Bits per second in Kbps below 1 Mbps, Mbps from there on, rounded to
/// one decimal. Whole values print without a fraction ("12 Mbps").
pub fn format_rate(bytes_per_sec: f64) -> String {
    let mbps = bytes_per_sec * 8.0 / 1e6;
    if mbps < 1.0 {
        format!("{} Kbps", round1(mbps * 1e3))
    } else {
        format!("{} Mbps", round1(mbps))
    }
}

/// KiB below 1 MiB, MiB from there on, one decimal.
pub fn format_size(bytes: u64) -> String {
    let b = bytes as f64;
    if b < MIB {
        format!("{} KiB", round1(b / KIB))
    } else {
        format!("{} MiB", round1(b / MIB))
    }
}

/// "42% of 1.5 MiB". An empty transfer counts as complete.
pub fn format_progress(done: u64, total: u64) -> String {
    let pct = if total == 0 {
        100
    } else {
        (done.min(total) as u128 * 100 / total as u128) as u64
    };
    format!("{}% of {}", pct, format_size(total))
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
