//! Lightweight process metrics for progress reporting.

use std::sync::atomic::{AtomicU64, Ordering};

static PEAK_MEMORY_MB: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    pub used_mb: u64,
    pub avail_mb: u64,
    pub peak_mb: u64,
}

/// Current process RSS and system-available memory, in MiB. Returns zeros
/// on platforms without a supported probe.
pub fn memory_stats_mb() -> MemoryStats {
    let used_mb = read_self_rss_mb().unwrap_or(0);
    let avail_mb = read_meminfo_available_mb().unwrap_or(0);

    let mut peak = PEAK_MEMORY_MB.load(Ordering::Relaxed);
    while used_mb > peak {
        match PEAK_MEMORY_MB.compare_exchange_weak(peak, used_mb, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => break,
            Err(x) => peak = x,
        }
    }

    MemoryStats {
        used_mb,
        avail_mb,
        peak_mb: PEAK_MEMORY_MB.load(Ordering::Relaxed),
    }
}

#[cfg(target_os = "linux")]
fn read_self_rss_mb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    scan_kb_line(&status, "VmRSS:").map(|kb| kb / 1024)
}

#[cfg(target_os = "linux")]
fn read_meminfo_available_mb() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    scan_kb_line(&meminfo, "MemAvailable:").map(|kb| kb / 1024)
}

#[cfg(target_os = "linux")]
fn scan_kb_line(text: &str, prefix: &str) -> Option<u64> {
    text.lines()
        .find(|l| l.starts_with(prefix))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
}

#[cfg(not(target_os = "linux"))]
fn read_self_rss_mb() -> Option<u64> {
    None
}

#[cfg(not(target_os = "linux"))]
fn read_meminfo_available_mb() -> Option<u64> {
    None
}

pub fn reset_peak_memory() {
    PEAK_MEMORY_MB.store(0, Ordering::Relaxed);
}
