// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Batch processing statistics.
//!
//! Counters are cumulative since engine start. [`FpsMeter`] throttles
//! throughput reporting to every N frames or every period, whichever comes first.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Cumulative reconciliation counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    /// Batches seen by the post-batch hook
    pub batches: u64,
    /// Frames turned into output records
    pub frames: u64,
    /// Frames whose slot had no attached stream
    pub orphan_frames: u64,
    /// Objects emitted in output records
    pub objects: u64,
    /// Whole-frame placeholder objects discarded
    pub degenerate_objects: u64,
    /// Internal-only attributes filtered out
    pub internal_attributes: u64,
}

/// Frame rate meter with throttled reporting.
#[derive(Debug)]
pub struct FpsMeter {
    period_frames: u64,
    period: Duration,
    frames: u64,
    started: Instant,
}

/// One throughput report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FpsReport {
    pub frames: u64,
    pub elapsed: Duration,
    pub fps: f64,
}

impl FpsMeter {
    pub fn new(period_frames: u64, period: Duration) -> Self {
        Self { period_frames: period_frames.max(1), period, frames: 0, started: Instant::now() }
    }

    /// Counts `n` frames and returns a report when a period has elapsed.
    pub fn tick(&mut self, n: u64) -> Option<FpsReport> {
        self.frames += n;
        let elapsed = self.started.elapsed();
        if self.frames < self.period_frames && elapsed < self.period {
            return None;
        }

        #[allow(clippy::cast_precision_loss)]
        let fps = if elapsed.is_zero() { 0.0 } else { self.frames as f64 / elapsed.as_secs_f64() };
        let report = FpsReport { frames: self.frames, elapsed, fps };
        self.frames = 0;
        self.started = Instant::now();
        Some(report)
    }
}
