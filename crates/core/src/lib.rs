// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! BatchKit Core - shared data model and seams for batched multi-stream pipelines.
//!
//! ## Core Modules
//!
//! - [`types`]: Stream ids, resolutions, frame parameters, negotiated caps
//! - [`geometry`]: Axis-aligned and rotated bounding boxes
//! - [`meta`]: Native per-batch metadata and per-stream output records
//! - [`element`]: The [`ElementGraph`] seam used to build per-stream chains
//! - [`probe`]: Boundary event dispatch table
//! - [`state`]: Stream lifecycle phases and state updates
//! - [`stats`]: Batch statistics and throughput metering
//! - [`error`]: Error types and handling

pub mod element;
pub mod error;
pub mod geometry;
pub mod meta;
pub mod probe;
pub mod state;
pub mod stats;
pub mod types;

// Error handling
pub use error::{BatchKitError, Result};

// Data model
pub use geometry::{BBox, BoundingBox, RBBox};
pub use meta::{
    AttributeRecord, BBoxRecord, Batch, FrameRecord, NativeAttribute, NativeFrame, NativeObject,
    ObjectRecord, SinkMessage, PRIMARY_OBJECT_LABEL, UNTRACKED_OBJECT_ID,
};
pub use types::{CapsValue, FrameParameters, Padding, Resolution, StreamId, VideoCaps};

// Structural seams
pub use element::{ElementGraph, ElementHandle, ElementSpec, Endpoint};
pub use probe::{Boundary, EventKind, PadEvent, ProbeId, ProbeReturn, ProbeTable};

// State tracking
pub use state::{state_helpers, StreamPhase, StreamStateUpdate};

// Statistics
pub use stats::{BatchStats, FpsMeter, FpsReport};
