// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(clippy::unwrap_used)]

use super::{config, id, nv12, start, start_reactive, ReactiveGraph};
use batchkit_core::{
    BBox, Batch, Boundary, BoundingBox, Endpoint, NativeFrame, NativeObject, PadEvent,
    ProbeReturn, SinkMessage, StreamPhase,
};
use std::time::Duration;

#[tokio::test]
async fn test_upstream_then_downstream_releases_stream() {
    let mut h = start(config(2));
    let slot = h.admit("cam").await;

    assert_eq!(h.upstream_eos(slot), ProbeReturn::Pass);
    let phases = h.settle().await;
    assert_eq!(phases.get(&id("cam")), Some(&StreamPhase::PreDraining));
    // Input side is gone, output side still drains.
    assert!(h.graph.element_by_name("nvvideoconvert0").is_none());
    assert!(h.graph.element_by_name("sink_cam").is_some());
    assert!(!h.stage.is_requested(slot));
    assert!(!h.graph.has_link_to(&Endpoint::BatchInput(slot)));
    assert_eq!(h.handle.slot_of(&id("cam")), Some(slot));

    h.split_eos(slot);
    assert!(h.settle().await.is_empty());
    assert!(h.graph.is_empty());
    assert_eq!(h.handle.available_slots(), 2);
    assert_eq!(h.drain_sink(), [SinkMessage::EndOfStream { stream_id: id("cam") }]);

    // Reverse construction order within each chain.
    let removed: Vec<String> = h.graph.removed().iter().map(|e| e.name.to_string()).collect();
    assert_eq!(removed, ["capsfilter1", "nvvideoconvert0", "sink_cam", "queue_cam"]);
}

#[tokio::test]
async fn test_downstream_before_upstream_is_buffered() {
    let h = start(config(2));
    let slot = h.admit("cam").await;

    assert_eq!(h.downstream_eos("cam"), ProbeReturn::Drop);
    let phases = h.settle().await;
    assert_eq!(phases.get(&id("cam")), Some(&StreamPhase::Active));
    assert_eq!(h.graph.len(), 4);
    assert_eq!(h.handle.slot_of(&id("cam")), Some(slot));

    h.upstream_eos(slot);
    assert!(h.settle().await.is_empty());
    assert!(h.graph.is_empty());
    assert_eq!(h.handle.available_slots(), 2);
}

#[tokio::test]
async fn test_eos_at_link_time_still_drains() {
    let graph = ReactiveGraph { eos_on_link: true, ..ReactiveGraph::default() };
    let (graph, handle) = start_reactive(config(1), graph);

    handle.on_new_stream("cam", Some(nv12())).unwrap().await.unwrap().unwrap();
    assert_eq!(graph.returns(), [ProbeReturn::Pass]);
    let phases = handle.get_stream_phases().await.unwrap();
    assert_eq!(phases.get(&id("cam")), Some(&StreamPhase::PreDraining));

    handle.dispatch(&Boundary::SplitOutput(0), &PadEvent::StreamEos { slot: Some(0) });
    assert!(handle.get_stream_phases().await.unwrap().is_empty());
    assert_eq!(handle.available_slots(), 1);
    assert!(graph.inner.is_empty());

    let reattach = handle.on_new_stream("cam", Some(nv12())).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), reattach).await.unwrap();
    assert!(result.unwrap().is_ok());
}

#[tokio::test]
async fn test_split_eos_only_acts_on_tagged_slot() {
    let h = start(config(2));
    let a = h.admit("a").await;
    let b = h.admit("b").await;

    let returns = h.split_eos(b);
    assert_eq!(returns[a], ProbeReturn::Pass);
    assert_eq!(returns[b], ProbeReturn::Drop);
    h.settle().await;

    // The tagged stream's output chain is detached from the splitter.
    let queue_b = h.graph.element_by_name("queue_b").unwrap();
    assert!(!h.graph.is_linked(&Endpoint::SplitOutput(b), &Endpoint::ElementSink(queue_b.handle)));
    let queue_a = h.graph.element_by_name("queue_a").unwrap();
    assert!(h.graph.is_linked(&Endpoint::SplitOutput(a), &Endpoint::ElementSink(queue_a.handle)));

    let phases = h.settle().await;
    assert_eq!(phases.get(&id("a")), Some(&StreamPhase::Active));
    assert_eq!(phases.get(&id("b")), Some(&StreamPhase::Active));
}

#[tokio::test]
async fn test_duplicate_downstream_eos_reports_once() {
    let mut h = start(config(1));
    let slot = h.admit("cam").await;

    h.downstream_eos("cam");
    h.downstream_eos("cam");
    h.settle().await;
    assert_eq!(h.drain_sink().len(), 1);

    h.upstream_eos(slot);
    assert!(h.settle().await.is_empty());
}

#[tokio::test]
async fn test_eos_passes_when_not_suppressed() {
    let mut cfg = config(1);
    cfg.suppress_eos = false;
    let h = start(cfg);
    h.admit("cam").await;
    assert_eq!(h.downstream_eos("cam"), ProbeReturn::Pass);
}

#[tokio::test]
async fn test_stale_upstream_eos_after_release_is_ignored() {
    let h = start(config(1));
    let slot = h.admit("cam").await;
    h.end_stream(slot).await;

    assert_eq!(h.handle.dispatch(&Boundary::BatchInput(slot), &PadEvent::Eos), ProbeReturn::Pass);
    assert!(h.settle().await.is_empty());
    assert_eq!(h.handle.available_slots(), 1);
}

#[tokio::test]
async fn test_batches_route_to_streams_until_release() {
    let mut h = start(config(2));
    let a = h.admit("a").await;
    let b = h.admit("b").await;

    let object = NativeObject::untracked(
        "detector",
        "car",
        BoundingBox::Aligned(BBox::new(320.0, 180.0, 64.0, 36.0)),
    );
    let mut frame_a = NativeFrame::new(a, 100, Some(0));
    frame_a.objects.push(object.clone());
    let frame_b = NativeFrame::new(b, 200, Some(0));
    assert_eq!(h.handle.on_batch(&mut Batch::new(vec![frame_a, frame_b])), 2);

    let records = h.drain_sink();
    let SinkMessage::Frame(first) = &records[0] else { panic!("expected frame record") };
    assert_eq!(first.stream_id, id("a"));
    // Metadata-only output keeps the 1280x720 source resolution.
    assert_eq!(first.objects[0].bbox.xc, 640.0);
    assert_eq!(first.objects[0].object_id, 0);
    let SinkMessage::Frame(second) = &records[1] else { panic!("expected frame record") };
    assert_eq!(second.stream_id, id("b"));

    h.end_stream(a).await;
    h.drain_sink();
    let frame = NativeFrame::new(a, 300, Some(1));
    assert_eq!(h.handle.on_batch(&mut Batch::new(vec![frame])), 0);
    assert_eq!(h.handle.stats().orphan_frames, 1);
}

#[tokio::test]
async fn test_state_updates_follow_lifecycle() {
    let h = start(config(1));
    let mut updates = h.handle.subscribe_state().await.unwrap();
    let slot = h.admit("cam").await;
    h.end_stream(slot).await;

    let mut phases = Vec::new();
    while let Ok(update) = updates.try_recv() {
        phases.push(update.phase);
    }
    assert_eq!(
        phases,
        [
            StreamPhase::Attaching,
            StreamPhase::Active,
            StreamPhase::PreDraining,
            StreamPhase::PostDraining,
            StreamPhase::Released,
        ]
    );
}
