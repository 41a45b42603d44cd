// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Scenario tests for the engine crate, run against the in-memory backends.

mod drain;

use crate::memory::{MemoryGraph, MemoryStage};
use crate::{Engine, EngineConfig, PipelineHandle};
use batchkit_core::{
    Boundary, ElementGraph, ElementHandle, ElementSpec, Endpoint, FrameParameters, PadEvent,
    ProbeReturn, Result, SinkMessage, StreamId, StreamPhase, VideoCaps,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tokio::sync::mpsc;

pub(super) struct Harness {
    pub graph: Arc<MemoryGraph>,
    pub stage: Arc<MemoryStage>,
    pub handle: PipelineHandle,
    pub sink_rx: mpsc::UnboundedReceiver<SinkMessage>,
    pub max_streams: usize,
}

pub(super) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub(super) fn config(max_streams: usize) -> EngineConfig {
    let mut config = EngineConfig::new(FrameParameters::new(640, 360), 4);
    config.max_parallel_streams = max_streams;
    config.gate_poll_interval_ms = 100;
    config.slot_backoff_ms = 100;
    config
}

pub(super) fn nv12() -> VideoCaps {
    VideoCaps::raw("NV12", 1280, 720)
}

pub(super) fn id(s: &str) -> StreamId {
    StreamId::new(s)
}

#[allow(clippy::unwrap_used)]
pub(super) fn start(config: EngineConfig) -> Harness {
    start_with(config, MemoryGraph::new())
}

#[allow(clippy::unwrap_used)]
pub(super) fn start_with(config: EngineConfig, graph: MemoryGraph) -> Harness {
    init_tracing();
    let max_streams = config.max_parallel_streams;
    let graph = Arc::new(graph);
    let stage = Arc::new(MemoryStage::new(max_streams));
    let (sink_tx, sink_rx) = mpsc::unbounded_channel();
    let handle = Engine::new(config, graph.clone(), stage.clone()).start(sink_tx).unwrap();
    Harness { graph, stage, handle, sink_rx, max_streams }
}

/// A graph that lets streaming events race structural changes: it reports
/// boundary events through the engine handle from inside graph calls.
#[derive(Default)]
pub(super) struct ReactiveGraph {
    pub inner: MemoryGraph,
    /// Upstream end-of-stream as soon as a chain is linked into the batching stage.
    pub eos_on_link: bool,
    /// Sink end-of-stream for this stream whenever an element is quiesced.
    pub sink_eos_on_quiesce: Option<StreamId>,
    handle: OnceLock<Weak<PipelineHandle>>,
    returns: Mutex<Vec<ProbeReturn>>,
}

#[allow(clippy::unwrap_used)]
impl ReactiveGraph {
    /// Dispositions of the events dispatched so far.
    pub fn returns(&self) -> Vec<ProbeReturn> {
        self.returns.lock().unwrap().clone()
    }

    fn report(&self, boundary: &Boundary, event: &PadEvent) {
        if let Some(handle) = self.handle.get().and_then(Weak::upgrade) {
            let ret = handle.dispatch(boundary, event);
            self.returns.lock().unwrap().push(ret);
        }
    }
}

impl ElementGraph for ReactiveGraph {
    fn add(&self, spec: &ElementSpec) -> Result<ElementHandle> {
        self.inner.add(spec)
    }

    fn accepts_caps(&self, element: &ElementHandle, caps: &VideoCaps) -> bool {
        self.inner.accepts_caps(element, caps)
    }

    fn link(&self, from: &Endpoint, to: &Endpoint) -> Result<()> {
        self.inner.link(from, to)?;
        if let (true, Endpoint::BatchInput(slot)) = (self.eos_on_link, to) {
            self.report(&Boundary::BatchInput(*slot), &PadEvent::Eos);
        }
        Ok(())
    }

    fn unlink(&self, from: &Endpoint, to: &Endpoint) -> Result<()> {
        self.inner.unlink(from, to)
    }

    fn quiesce(&self, element: &ElementHandle) -> Result<()> {
        if let Some(stream) = &self.sink_eos_on_quiesce {
            self.report(&Boundary::StreamSink(stream.clone()), &PadEvent::Eos);
        }
        self.inner.quiesce(element)
    }

    fn remove(&self, element: &ElementHandle) -> Result<()> {
        self.inner.remove(element)
    }
}

/// Starts an engine on a [`ReactiveGraph`] wired to its own handle.
#[allow(clippy::unwrap_used)]
pub(super) fn start_reactive(
    config: EngineConfig,
    graph: ReactiveGraph,
) -> (Arc<ReactiveGraph>, Arc<PipelineHandle>) {
    init_tracing();
    let graph = Arc::new(graph);
    let stage = Arc::new(MemoryStage::new(config.max_parallel_streams));
    let (sink_tx, _sink_rx) = mpsc::unbounded_channel();
    let handle = Arc::new(Engine::new(config, graph.clone(), stage).start(sink_tx).unwrap());
    assert!(graph.handle.set(Arc::downgrade(&handle)).is_ok());
    (graph, handle)
}

#[allow(clippy::unwrap_used)]
impl Harness {
    /// Admits a stream with caps and waits until it is attached.
    pub async fn admit(&self, stream: &str) -> usize {
        self.handle.on_new_stream(stream, Some(nv12())).unwrap().await.unwrap().unwrap();
        self.handle.slot_of(&id(stream)).unwrap()
    }

    /// Waits until the work queue has handled everything submitted so far
    /// and returns the stream phases.
    pub async fn settle(&self) -> HashMap<StreamId, StreamPhase> {
        self.handle.get_stream_phases().await.unwrap()
    }

    pub fn upstream_eos(&self, slot: usize) -> ProbeReturn {
        self.handle.dispatch(&Boundary::BatchInput(slot), &PadEvent::Eos)
    }

    /// The splitter redelivers the tagged event on every output slot.
    pub fn split_eos(&self, slot: usize) -> Vec<ProbeReturn> {
        (0..self.max_streams)
            .map(|out| {
                self.handle.dispatch(
                    &Boundary::SplitOutput(out),
                    &PadEvent::StreamEos { slot: Some(slot) },
                )
            })
            .collect()
    }

    pub fn downstream_eos(&self, stream: &str) -> ProbeReturn {
        self.handle.dispatch(&Boundary::StreamSink(id(stream)), &PadEvent::Eos)
    }

    /// Ends a stream the way the pipeline does: upstream first, then the
    /// splitter's per-stream event.
    pub async fn end_stream(&self, slot: usize) {
        self.upstream_eos(slot);
        self.split_eos(slot);
        self.settle().await;
    }

    pub fn drain_sink(&mut self) -> Vec<SinkMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.sink_rx.try_recv() {
            messages.push(message);
        }
        messages
    }
}
