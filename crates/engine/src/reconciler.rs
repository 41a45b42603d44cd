// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Frame metadata reconciliation.
//!
//! Turns the native metadata of a processed batch into one [`FrameRecord`] per
//! frame: resolves the owning stream through the slot, converts coordinates
//! from the processing frame into the stream's destination resolution, drops
//! internal attributes and whole-frame placeholder objects. Runs on the
//! streaming context that delivered the batch, so it only reads stream state.

use crate::constants::FPS_REPORT_PERIOD;
use crate::registry::SourceRegistry;
use batchkit_core::{
    AttributeRecord, BBoxRecord, Batch, BatchStats, BoundingBox, FpsMeter, FrameParameters,
    FrameRecord, NativeFrame, ObjectRecord, Resolution, PRIMARY_OBJECT_LABEL,
};
use opentelemetry::{global, metrics::Counter, KeyValue};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

pub struct Reconciler {
    registry: Arc<SourceRegistry>,
    frame: FrameParameters,
    internal_attributes: HashSet<(String, String)>,
    stats: Mutex<BatchStats>,
    fps: Mutex<FpsMeter>,
    batches_counter: Counter<u64>,
    dropped_objects_counter: Counter<u64>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<SourceRegistry>,
        frame: FrameParameters,
        internal_attributes: HashSet<(String, String)>,
        fps_period_frames: u64,
    ) -> Self {
        let meter = global::meter("batchkit_engine");
        Self {
            registry,
            frame,
            internal_attributes,
            stats: Mutex::new(BatchStats::default()),
            fps: Mutex::new(FpsMeter::new(fps_period_frames, FPS_REPORT_PERIOD)),
            batches_counter: meter
                .u64_counter("engine.batches")
                .with_description("Batches reconciled")
                .build(),
            dropped_objects_counter: meter
                .u64_counter("engine.objects.dropped")
                .with_description("Objects dropped during reconciliation")
                .build(),
        }
    }

    /// Builds the output records for a batch. Native attributes are moved out
    /// of the batch and untracked objects get per-label fallback ids written
    /// back into it.
    pub fn reconcile(&self, batch: &mut Batch) -> Vec<FrameRecord> {
        let mut delta = BatchStats { batches: 1, ..BatchStats::default() };
        let mut records = Vec::with_capacity(batch.len());

        for frame in &mut batch.frames {
            assign_fallback_ids(frame);

            let Some(state) = self.registry.stream_by_slot(frame.slot_index) else {
                tracing::warn!(slot = frame.slot_index, pts = frame.pts, "Dropping frame from unattached slot");
                delta.orphan_frames += 1;
                continue;
            };
            let Some(dest) = state.dest_resolution() else {
                tracing::warn!(
                    stream_id = %state.stream_id(),
                    slot = frame.slot_index,
                    "Dropping frame of stream without destination resolution"
                );
                delta.orphan_frames += 1;
                continue;
            };

            let mut record =
                FrameRecord::new(state.stream_id().clone(), frame.frame_index, frame.pts, dest);
            for object in &mut frame.objects {
                let native_attributes = std::mem::take(&mut object.attributes);
                let mut attributes = Vec::with_capacity(native_attributes.len());
                for attr in native_attributes {
                    if self
                        .internal_attributes
                        .contains(&(attr.element_name.clone(), attr.name.clone()))
                    {
                        delta.internal_attributes += 1;
                    } else {
                        attributes.push(AttributeRecord::from(attr));
                    }
                }

                let mut bbox = object.bbox;
                self.convert_bbox(&mut bbox, dest);
                let bbox = BBoxRecord::from(&bbox);

                if object.label == PRIMARY_OBJECT_LABEL
                    && attributes.is_empty()
                    && covers_whole_frame(&bbox, dest)
                {
                    delta.degenerate_objects += 1;
                    continue;
                }

                record.objects.push(ObjectRecord {
                    model_name: object.element_name.clone(),
                    label: object.label.clone(),
                    object_id: object.object_id,
                    bbox,
                    confidence: object.confidence,
                    attributes,
                });
            }

            delta.frames += 1;
            delta.objects += record.objects.len() as u64;
            records.push(record);
        }

        self.batches_counter.add(1, &[]);
        if delta.degenerate_objects > 0 {
            self.dropped_objects_counter
                .add(delta.degenerate_objects, &[KeyValue::new("reason", "degenerate")]);
        }
        self.merge(&delta);
        records
    }

    pub fn stats(&self) -> BatchStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Processing frame coordinates -> destination resolution.
    fn convert_bbox(&self, bbox: &mut BoundingBox, dest: Resolution) {
        let (ref_width, ref_height) = if self.frame.keeps_padding() {
            (self.frame.total_width(), self.frame.total_height())
        } else {
            if let Some(padding) = self.frame.padding {
                bbox.translate(-f64::from(padding.left), -f64::from(padding.top));
            }
            (self.frame.width, self.frame.height)
        };
        bbox.scale(
            f64::from(dest.width) / f64::from(ref_width),
            f64::from(dest.height) / f64::from(ref_height),
        );
    }

    fn merge(&self, delta: &BatchStats) {
        {
            let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
            stats.batches += delta.batches;
            stats.frames += delta.frames;
            stats.orphan_frames += delta.orphan_frames;
            stats.objects += delta.objects;
            stats.degenerate_objects += delta.degenerate_objects;
            stats.internal_attributes += delta.internal_attributes;
        }

        let report = self.fps.lock().unwrap_or_else(PoisonError::into_inner).tick(delta.frames);
        if let Some(report) = report {
            tracing::info!(
                frames = report.frames,
                elapsed_ms = report.elapsed.as_millis(),
                fps = format!("{:.2}", report.fps),
                "Processed frames"
            );
        }
    }
}

/// Gives untracked objects ids unique per label within the frame.
fn assign_fallback_ids(frame: &mut NativeFrame) {
    let mut next_ids: HashMap<&str, u64> = HashMap::new();
    for object in &mut frame.objects {
        if object.is_tracked() {
            continue;
        }
        let next = next_ids.entry(object.label.as_str()).or_insert(0);
        object.object_id = *next;
        *next += 1;
    }
}

#[allow(clippy::float_cmp)]
fn covers_whole_frame(bbox: &BBoxRecord, dest: Resolution) -> bool {
    let width = f64::from(dest.width);
    let height = f64::from(dest.height);
    bbox.angle.is_none_or(|angle| angle == 0.0)
        && bbox.xc == width / 2.0
        && bbox.yc == height / 2.0
        && bbox.width == width
        && bbox.height == height
}
