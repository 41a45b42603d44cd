// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Shared pipeline context.
//!
//! One value per running engine, passed explicitly to every component.

use crate::admission::AttachHook;
use crate::gateway::BatchingGateway;
use crate::output::OutputMode;
use crate::registry::{SourceRegistry, StreamState};
use crate::slot_pool::SlotPool;
use crate::work_queue::WorkQueue;
use batchkit_core::{
    state_helpers, BatchKitError, ElementGraph, FrameParameters, ProbeTable, SinkMessage,
    StreamPhase, StreamStateUpdate,
};
use opentelemetry::metrics::{Counter, Gauge};
use opentelemetry::{global, KeyValue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

pub(crate) struct EngineMetrics {
    streams_active_gauge: Gauge<u64>,
    stream_transitions_counter: Counter<u64>,
    admission_waits_counter: Counter<u64>,
}

impl EngineMetrics {
    pub(crate) fn new() -> Self {
        let meter = global::meter("batchkit_engine");
        Self {
            streams_active_gauge: meter
                .u64_gauge("engine.streams.active")
                .with_description("Streams currently holding a slot")
                .build(),
            stream_transitions_counter: meter
                .u64_counter("engine.stream.transitions")
                .with_description("Stream lifecycle transitions")
                .build(),
            admission_waits_counter: meter
                .u64_counter("engine.admission.waits")
                .with_description("Admission retries while waiting for resources")
                .build(),
        }
    }

    /// `reason` is `slot` or `release_gate`.
    pub(crate) fn admission_wait(&self, reason: &'static str) {
        self.admission_waits_counter.add(1, &[KeyValue::new("reason", reason)]);
    }
}

pub(crate) struct PipelineContext {
    pub frame: FrameParameters,
    pub max_parallel_streams: usize,
    pub gate_poll_interval: Duration,
    pub slot_backoff: Duration,
    pub registry: Arc<SourceRegistry>,
    pub pool: SlotPool,
    pub graph: Arc<dyn ElementGraph>,
    pub gateway: BatchingGateway,
    pub probes: ProbeTable,
    pub output: OutputMode,
    pub sink: mpsc::UnboundedSender<SinkMessage>,
    pub work: WorkQueue,
    pub state_tx: mpsc::UnboundedSender<StreamStateUpdate>,
    /// Read by sink probes on streaming contexts.
    pub suppress_eos: Arc<AtomicBool>,
    /// Cancels admissions that are still waiting for resources.
    pub cancel: CancellationToken,
    pub failure: watch::Sender<Option<String>>,
    pub attach_hooks: Vec<Arc<dyn AttachHook>>,
    pub metrics: EngineMetrics,
}

impl PipelineContext {
    pub(crate) fn emit(&self, state: &StreamState, phase: StreamPhase) {
        self.metrics.stream_transitions_counter.add(1, &[KeyValue::new("phase", phase.as_str())]);
        state_helpers::emit_phase(&self.state_tx, state.stream_id(), phase, state.slot_index());
    }

    pub(crate) fn record_attached(&self) {
        self.metrics.streams_active_gauge.record(self.registry.attached() as u64, &[]);
    }

    pub(crate) fn stop_suppressing_eos(&self) {
        tracing::debug!("Turning off end-of-stream suppression");
        self.suppress_eos.store(false, Ordering::SeqCst);
    }

    /// Logs an error. Fatal errors also mark the pipeline run as failed;
    /// only the first one is kept.
    pub(crate) fn fail(&self, err: &BatchKitError, during: &str) {
        if !err.is_fatal() {
            tracing::warn!(error = %err, during, "Pipeline operation failed");
            return;
        }
        tracing::error!(error = %err, during, "Fatal pipeline error");
        self.failure.send_if_modified(|failure| {
            if failure.is_some() {
                return false;
            }
            *failure = Some(format!("{during}: {err}"));
            true
        });
    }
}
