// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Frame metadata: the native per-batch shape written by processing stages,
//! and the per-stream output records assembled from it.

use crate::geometry::BoundingBox;
use crate::types::{Resolution, StreamId};
use serde::{Deserialize, Serialize};

/// Object id value meaning "no persistent tracker identity".
pub const UNTRACKED_OBJECT_ID: u64 = u64::MAX;

/// Label of the whole-frame placeholder object.
pub const PRIMARY_OBJECT_LABEL: &str = "frame";

/// Attribute attached to an object by a processing stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NativeAttribute {
    /// Name of the stage that produced the attribute.
    pub element_name: String,
    pub name: String,
    pub value: serde_json::Value,
    pub confidence: Option<f64>,
}

/// Object as written into a batch by processing stages.
///
/// `bbox` is expressed in the processing frame coordinates (padding included).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NativeObject {
    pub element_name: String,
    pub label: String,
    pub object_id: u64,
    pub bbox: BoundingBox,
    pub confidence: f64,
    pub attributes: Vec<NativeAttribute>,
}

impl NativeObject {
    pub fn untracked(element_name: &str, label: &str, bbox: BoundingBox) -> Self {
        Self {
            element_name: element_name.to_string(),
            label: label.to_string(),
            object_id: UNTRACKED_OBJECT_ID,
            bbox,
            confidence: 1.0,
            attributes: Vec::new(),
        }
    }

    #[must_use]
    pub const fn with_object_id(mut self, object_id: u64) -> Self {
        self.object_id = object_id;
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, attribute: NativeAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub const fn is_tracked(&self) -> bool {
        self.object_id != UNTRACKED_OBJECT_ID
    }
}

/// One frame of one stream inside a batch, tagged with the slot it came from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NativeFrame {
    pub slot_index: usize,
    /// Presentation timestamp in nanoseconds.
    pub pts: u64,
    /// Sequence index assigned by the source, if it carries one.
    pub frame_index: Option<u64>,
    pub objects: Vec<NativeObject>,
}

impl NativeFrame {
    pub const fn new(slot_index: usize, pts: u64, frame_index: Option<u64>) -> Self {
        Self { slot_index, pts, frame_index, objects: Vec::new() }
    }
}

/// A group of frames, at most one per populated slot, processed together.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub frames: Vec<NativeFrame>,
}

impl Batch {
    pub const fn new(frames: Vec<NativeFrame>) -> Self {
        Self { frames }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Output representation of a bounding box.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BBoxRecord {
    pub xc: f64,
    pub yc: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub angle: Option<f64>,
}

impl From<&BoundingBox> for BBoxRecord {
    fn from(bbox: &BoundingBox) -> Self {
        let (xc, yc) = bbox.center();
        let (width, height) = bbox.size();
        Self { xc, yc, width, height, angle: bbox.angle() }
    }
}

/// Output representation of an attribute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttributeRecord {
    pub element_name: String,
    pub name: String,
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl From<NativeAttribute> for AttributeRecord {
    fn from(attr: NativeAttribute) -> Self {
        Self {
            element_name: attr.element_name,
            name: attr.name,
            value: attr.value,
            confidence: attr.confidence,
        }
    }
}

/// Output representation of an object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub model_name: String,
    pub label: String,
    pub object_id: u64,
    pub bbox: BBoxRecord,
    pub confidence: f64,
    pub attributes: Vec<AttributeRecord>,
}

/// Finished per-stream, per-frame output record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub stream_id: StreamId,
    pub frame_index: Option<u64>,
    pub pts: u64,
    /// Destination resolution the object coordinates are expressed in.
    pub resolution: Resolution,
    pub objects: Vec<ObjectRecord>,
}

impl FrameRecord {
    pub const fn new(
        stream_id: StreamId,
        frame_index: Option<u64>,
        pts: u64,
        resolution: Resolution,
    ) -> Self {
        Self { stream_id, frame_index, pts, resolution, objects: Vec::new() }
    }

    /// Key the downstream sink uses to join records with frames.
    pub const fn key(&self) -> (&StreamId, Option<u64>, u64) {
        (&self.stream_id, self.frame_index, self.pts)
    }
}

/// Messages delivered to the downstream sink.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkMessage {
    Frame(FrameRecord),
    EndOfStream { stream_id: StreamId },
}
