// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Canonical defaults for the engine.
//!
//! Config types and the runner reference these so the defaults stay in one place.

use std::time::Duration;

// === Capacity ===

/// Default number of slots on the batching/splitting stage.
///
/// Equal on the input and output side; bounds the number of concurrently
/// attached streams.
pub const DEFAULT_MAX_PARALLEL_STREAMS: usize = 64;

/// Largest batch the batching stage accepts.
pub const MAX_BATCH_SIZE: usize = 1024;

/// Default time the batching stage waits to fill a batch, in microseconds.
pub const DEFAULT_BATCHED_PUSH_TIMEOUT_US: u64 = 2000;

// === Admission ===

/// How often a re-attaching stream re-checks the release gate of its previous
/// incarnation. A warning is logged on every attempt.
pub const DEFAULT_GATE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Back-off between slot acquisition attempts when the pool is exhausted.
pub const DEFAULT_SLOT_BACKOFF: Duration = Duration::from_secs(5);

// === Channels ===

/// Default buffer size for stream state subscriber channels.
pub const DEFAULT_SUBSCRIBER_CHANNEL_CAPACITY: usize = 128;

/// Default buffer size for the engine query channel.
pub const DEFAULT_QUERY_CAPACITY: usize = 32;

// === Reporting ===

/// Frames between throughput reports.
pub const DEFAULT_FPS_PERIOD_FRAMES: u64 = 1000;

/// Upper bound on the time between throughput reports.
pub const FPS_REPORT_PERIOD: Duration = Duration::from_secs(10);

/// How long `shutdown_and_wait` waits for the work queue to drain.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

// === Element factories ===

/// Generic software format converter, used when the fast path rejects the caps.
pub const GENERIC_CONVERTER: &str = "videoconvert";

/// Accelerated converter that also applies padding and scaling.
pub const FAST_CONVERTER: &str = "nvvideoconvert";

/// Pins the negotiated format of a chain.
pub const FORMAT_LOCK: &str = "capsfilter";

pub const QUEUE: &str = "queue";

/// Terminal element of every post-batch chain.
pub const STREAM_SINK: &str = "fakesink";

/// Memory feature of frames inside the batching stage.
pub const BATCH_MEMORY_CAPS: &str = "video/x-raw(memory:NVMM)";
