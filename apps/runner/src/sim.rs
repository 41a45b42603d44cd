// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Synthetic workload driver.
//!
//! Plays the role of the media framework around the engine: admits streams,
//! pushes frames into the in-memory batching stage, hands each batch to the
//! engine and reports end-of-stream the way the batching and splitting stages
//! would. Sink messages are written as JSON lines.

use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use batchkit_core::{
    BBox, BatchStats, Boundary, BoundingBox, FrameParameters, NativeAttribute, NativeFrame, NativeObject, PadEvent,
    SinkMessage, StreamId, VideoCaps,
};
use batchkit_engine::memory::{MemoryGraph, MemoryStage};
use batchkit_engine::{Engine, EngineConfig, PipelineHandle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, SimulationConfig};

const MODEL_NAME: &str = "detector";
const LABELS: [&str; 2] = ["car", "person"];
const FRAME_DURATION_NS: u64 = 33_333_333;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulationSummary {
    pub streams_admitted: usize,
    pub records: u64,
    pub end_of_streams: u64,
    pub stats: BatchStats,
}

struct SimStream {
    id: StreamId,
    admission: Option<JoinHandle<batchkit_core::Result<()>>>,
    sent: u64,
    eos_sent: bool,
    ended: bool,
    /// Incarnations started under this id.
    rounds: u32,
}

/// Runs the simulation until every stream has ended or `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the engine cannot start, reports a fatal failure, or
/// writing to `out` fails.
pub async fn run<W: Write>(
    config: &Config,
    shutdown: impl Future<Output = ()>,
    out: &mut W,
) -> anyhow::Result<SimulationSummary> {
    let sim = &config.simulation;
    let graph = Arc::new(MemoryGraph::new());
    let stage = Arc::new(MemoryStage::new(config.engine.max_parallel_streams));
    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();

    let handle = Engine::new(config.engine.clone(), graph.clone(), stage.clone())
        .start(sink_tx)
        .context("failed to start engine")?;

    let caps = VideoCaps::raw("NV12", sim.source_width, sim.source_height);
    let mut streams: Vec<SimStream> = (0..sim.streams)
        .map(|i| {
            let id = StreamId::new(format!("stream-{i}"));
            let admission = handle.on_new_stream(id.clone(), Some(caps.clone()));
            let ended = admission.is_none();
            SimStream { id, admission, sent: 0, eos_sent: false, ended, rounds: 1 }
        })
        .collect();

    let mut summary = SimulationSummary { streams_admitted: streams.len(), ..Default::default() };
    let mut eos_dispatched = 0;
    let mut ticker = tokio::time::interval(Duration::from_millis(sim.batch_interval_ms.max(1)));
    tokio::pin!(shutdown);

    let outcome = loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("Stopping simulation");
                break Ok(());
            },
            reason = handle.failed() => {
                break Err(anyhow::anyhow!("engine failed: {reason}"));
            },
            _ = ticker.tick() => {},
        }

        reap_admissions(&mut streams).await;
        eos_dispatched += feed_frames(&handle, &stage, &config.engine, sim, &mut streams);
        write_sink_messages(&mut sink_rx, out, &mut summary)?;
        summary.streams_admitted += readmit(&handle, &caps, sim, &mut streams);

        if streams.iter().all(|s| s.ended) && summary.end_of_streams >= eos_dispatched {
            break Ok(());
        }
    };

    handle.shutdown_and_wait().await.context("engine shutdown failed")?;
    write_sink_messages(&mut sink_rx, out, &mut summary)?;
    summary.stats = handle.stats();

    info!(
        streams = summary.streams_admitted,
        records = summary.records,
        end_of_streams = summary.end_of_streams,
        orphan_frames = summary.stats.orphan_frames,
        "Simulation finished"
    );
    outcome.map(|()| summary)
}

/// Marks streams whose admission gave up as ended.
async fn reap_admissions(streams: &mut [SimStream]) {
    for stream in streams.iter_mut() {
        let finished = stream.admission.as_ref().is_some_and(JoinHandle::is_finished);
        if !finished {
            continue;
        }
        let Some(admission) = stream.admission.take() else { continue };
        match admission.await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                warn!(stream_id = %stream.id, error = %e, "Admission failed");
                stream.ended = true;
            },
            Err(e) => {
                warn!(stream_id = %stream.id, error = %e, "Admission task panicked");
                stream.ended = true;
            },
        }
    }
}

fn feed_frames(
    handle: &PipelineHandle,
    stage: &MemoryStage,
    engine: &EngineConfig,
    sim: &SimulationConfig,
    streams: &mut [SimStream],
) -> u64 {
    // Only streams whose admission completed are linked into the stage.
    for stream in streams.iter_mut().filter(|s| !s.ended && s.admission.is_none()) {
        let Some(slot) = handle.slot_of(&stream.id) else { continue };
        if !stage.is_requested(slot) || stream.sent >= sim.frames_per_stream {
            continue;
        }
        let native = synthetic_frame(slot, stream.sent, sim.objects_per_frame, engine.frame);
        if let Err(e) = stage.push(native) {
            debug!(stream_id = %stream.id, error = %e, "Frame not accepted");
            continue;
        }
        stream.sent += 1;
    }

    while let Some(mut batch) = stage.next_batch(engine.batch_size) {
        handle.on_batch(&mut batch);
    }

    let mut ended = 0;
    for stream in streams
        .iter_mut()
        .filter(|s| !s.ended && s.admission.is_none() && s.sent >= sim.frames_per_stream)
    {
        let Some(slot) = handle.slot_of(&stream.id) else { continue };
        debug!(stream_id = %stream.id, slot, "Ending stream");
        handle.dispatch(&Boundary::BatchInput(slot), &PadEvent::Eos);
        handle.dispatch(&Boundary::SplitOutput(slot), &PadEvent::StreamEos { slot: Some(slot) });
        stream.eos_sent = true;
        stream.ended = true;
        ended += 1;
    }
    ended
}

/// Starts the next incarnation of streams that ended and have rounds left.
/// The new incarnation waits inside the engine until the previous one is
/// fully released.
fn readmit(
    handle: &PipelineHandle,
    caps: &VideoCaps,
    sim: &SimulationConfig,
    streams: &mut [SimStream],
) -> usize {
    let mut started = 0;
    for stream in streams.iter_mut().filter(|s| s.eos_sent && s.rounds < sim.rounds) {
        let Some(admission) = handle.on_new_stream(stream.id.clone(), Some(caps.clone())) else {
            continue;
        };
        debug!(stream_id = %stream.id, round = stream.rounds + 1, "Re-attaching stream");
        stream.admission = Some(admission);
        stream.sent = 0;
        stream.eos_sent = false;
        stream.ended = false;
        stream.rounds += 1;
        started += 1;
    }
    started
}

#[allow(clippy::cast_precision_loss)]
fn synthetic_frame(slot: usize, index: u64, objects: usize, frame_size: FrameParameters) -> NativeFrame {
    let (width, height) = (f64::from(frame_size.width), f64::from(frame_size.height));
    let mut frame = NativeFrame::new(slot, index * FRAME_DURATION_NS, Some(index));
    for n in 0..objects {
        let phase = ((index + n as u64) % 100) as f64 / 100.0;
        let bbox = BBox::new(width * phase.max(0.1), height * 0.5, width * 0.1, height * 0.1);
        let label = LABELS[n % LABELS.len()];
        let object = NativeObject::untracked(MODEL_NAME, label, BoundingBox::Aligned(bbox))
            .with_attribute(NativeAttribute {
                element_name: MODEL_NAME.to_string(),
                name: "score".to_string(),
                value: serde_json::json!(phase),
                confidence: Some(0.9),
            });
        frame.objects.push(object);
    }
    frame
}

fn write_sink_messages<W: Write>(
    sink_rx: &mut mpsc::UnboundedReceiver<SinkMessage>,
    out: &mut W,
    summary: &mut SimulationSummary,
) -> anyhow::Result<()> {
    while let Ok(message) = sink_rx.try_recv() {
        match &message {
            SinkMessage::Frame(_) => summary.records += 1,
            SinkMessage::EndOfStream { .. } => summary.end_of_streams += 1,
        }
        serde_json::to_writer(&mut *out, &message)?;
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}
