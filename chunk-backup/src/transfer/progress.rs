//! Byte-level progress tracking for backup and restore passes.
//!
//! Counters are shared between the engine loop, which advances them, and the
//! progress timer task, which samples them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Running totals of a backup pass.
#[derive(Debug, Default)]
pub struct ProgressCounters {
    processed_bytes: AtomicU64,
    chunks: AtomicU64,
    objects: AtomicU64,
    changed_bytes: AtomicU64,
    stored_bytes: AtomicU64,
}

/// Point-in-time copy of [`ProgressCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressSnapshot {
    pub processed_bytes: u64,
    pub chunks: u64,
    pub objects: u64,
    pub changed_bytes: u64,
    pub stored_bytes: u64,
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a chunk read from the volume. Returns the new chunk count.
    pub fn add_chunk(&self, bytes: u64) -> u64 {
        self.processed_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.chunks.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record a chunk object written to the store.
    pub fn add_object(&self, uncompressed: u64, stored: u64) {
        self.objects.fetch_add(1, Ordering::Relaxed);
        self.changed_bytes.fetch_add(uncompressed, Ordering::Relaxed);
        self.stored_bytes.fetch_add(stored, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            processed_bytes: self.processed_bytes.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
            objects: self.objects.load(Ordering::Relaxed),
            changed_bytes: self.changed_bytes.load(Ordering::Relaxed),
            stored_bytes: self.stored_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Percentage of `total` covered by `done`, clamped to 0-100.
pub fn percent_complete(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    ((done as f64 / total as f64) * 100.0).min(100.0)
}

/// Instantaneous throughput between consecutive samples.
#[derive(Debug)]
pub struct SpeedMeter {
    last_bytes: u64,
    last_time: Instant,
}

impl SpeedMeter {
    pub fn new() -> Self {
        Self {
            last_bytes: 0,
            last_time: Instant::now(),
        }
    }

    /// Bytes per second since the previous sample.
    pub fn sample(&mut self, total_bytes: u64) -> u64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_time).as_secs_f64();
        let speed = if elapsed > 0.0 {
            (total_bytes.saturating_sub(self.last_bytes) as f64 / elapsed) as u64
        } else {
            0
        };
        self.last_bytes = total_bytes;
        self.last_time = now;
        speed
    }
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
