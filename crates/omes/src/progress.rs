//! 📊 progress.rs — "Are we there yet?" — every shipment, every time, forever.
//!
//! 🚀 This module answers the age-old question: "how much of the log backlog
//! has actually left the building?" With a progress bar and cold hard totals.
//!
//! ⚠️  Warning: Watching this progress bar will not make the cluster index
//! faster. Neither will refreshing it. We've tried. Science says no.
//!
//! 🦆 The duck has nothing to do with this module. It's just vibing.

use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

/// 📊 Byte- and record-level progress for one event source.
///
/// With a known total (a plain file) this is a real bar with a percentage.
/// With an unknown total (gzip — the decompressed size is a surprise) it's a
/// spinner with honest counters. No percent, no ETA, just truth.
#[derive(Debug)]
pub(crate) struct ProgressMetrics {
    bar: ProgressBar,
    started: Instant,
    records: u64,
    bytes: u64,
}

impl ProgressMetrics {
    pub(crate) fn new(source_name: &str, total_bytes: u64) -> Self {
        let bar = if total_bytes > 0 {
            let bar = ProgressBar::new(total_bytes);
            bar.set_style(
                ProgressStyle::with_template(
                    "{msg} [{bar:30}] {bytes}/{total_bytes} ({eta})",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar
        } else {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::with_template("{msg} {spinner} {bytes} read")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar
        };
        bar.set_message(source_name.to_owned());
        ProgressMetrics {
            bar,
            started: Instant::now(),
            records: 0,
            bytes: 0,
        }
    }

    /// ➕ One record left the source. `bytes` is its on-disk size, newline included.
    pub(crate) fn add_record(&mut self, bytes: u64) {
        self.records += 1;
        self.bytes += bytes;
        self.bar.inc(bytes);
    }

    /// 🏁 Source exhausted — freeze the bar and log the totals.
    pub(crate) fn finish(&self) {
        self.bar.finish_and_clear();
        let elapsed = self.started.elapsed();
        let rate = if elapsed.as_secs_f64() > 0.0 {
            self.records as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        info!(
            records = self.records,
            bytes = self.bytes,
            elapsed = ?elapsed,
            records_per_sec = format!("{rate:.0}"),
            "source drained"
        );
    }

    pub(crate) fn records(&self) -> u64 {
        self.records
    }
}
