use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Check whether an optional cancellation flag has been raised.
#[must_use]
pub fn cancel_requested(cancel: &Option<Arc<AtomicBool>>) -> bool {
    cancel
        .as_ref()
        .map(|flag| flag.load(Ordering::SeqCst))
        .unwrap_or(false)
}

/// Render a human-friendly transfer speed string.
#[must_use]
pub fn format_speed(bytes_per_sec: f32) -> String {
    const KIB: f32 = 1024.0;
    const MIB: f32 = KIB * 1024.0;

    if bytes_per_sec < KIB {
        format!("{bytes_per_sec:.0} B/s")
    } else if bytes_per_sec < MIB {
        format!("{:.1} KB/s", bytes_per_sec / KIB)
    } else {
        format!("{:.1} MB/s", bytes_per_sec / MIB)
    }
}

/// Compute download progress as a percentage.
#[must_use]
pub fn progress_percent(downloaded: u64, total: Option<u64>) -> f32 {
    match total {
        Some(total) if total > 0 => (downloaded as f32 / total as f32) * 100.0,
        _ => 0.0,
    }
}

/// Normalize a tracked path to the forward-slash wire form.
#[must_use]
pub fn canonical_slashes(path: &str) -> String {
    path.replace('\\', "/")
}

/// Strip one pair of surrounding double quotes, if present.
///
/// The installation directory arrives on the second-stage command line
/// wrapped in quotes; paths containing their own quotes are not supported.
#[must_use]
pub fn strip_quotes(value: &str) -> &str {
    let trimmed = value.trim();
    trimmed
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(trimmed)
}
