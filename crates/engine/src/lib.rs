// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! engine: dynamic stream admission and drain for batched pipelines.
//!
//! Streams come and go at runtime while sharing one batching stage with a
//! fixed number of slots. The engine admits a stream once a slot and the
//! stream id are free, builds its per-stream chains on a serialized work
//! queue, drains it in two halves when it ends, and turns every processed
//! batch into per-stream metadata records.
//!
//! ```text
//!  source ─▶ [convert ─▶ lock] ─▶ batching stage ─▶ splitter ─▶ [queue ─▶ output ─▶ sink]
//!            pre-batch chain        (slot i)        (slot i)      post-batch chain
//! ```

use batchkit_core::{BatchKitError, ElementGraph, Result, SinkMessage};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

// --- Public Modules ---

pub mod config;
pub mod constants;
pub mod memory;
pub mod output;

mod admission;
mod chain;
mod context;
mod drain;
mod gateway;
mod handle;
mod reconciler;
mod registry;
mod release_gate;
mod slot_pool;
mod work_queue;

// Re-exports
pub use admission::{AttachHook, AttachedStream};
pub use config::{EngineConfig, ModelAttributeConfig, ModelConfig, OutputFrameConfig};
pub use drain::{DrainStep, DrainTracker};
pub use gateway::{BatchHook, BatchInputHandle, BatchingGateway, BatchingStage};
pub use handle::PipelineHandle;
pub use output::{Codec, OutputMode};
pub use reconciler::Reconciler;
pub use registry::{SourceRegistry, StreamState};
pub use release_gate::ReleaseGate;
pub use slot_pool::{SlotAcquire, SlotPool};

use constants::DEFAULT_QUERY_CAPACITY;
use context::{EngineMetrics, PipelineContext};
use work_queue::{PipelineActor, WorkQueue};

/// Builder for a running pipeline engine.
pub struct Engine {
    config: EngineConfig,
    graph: Arc<dyn ElementGraph>,
    stage: Arc<dyn BatchingStage>,
    attach_hooks: Vec<Arc<dyn AttachHook>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        graph: Arc<dyn ElementGraph>,
        stage: Arc<dyn BatchingStage>,
    ) -> Self {
        Self { config, graph, stage, attach_hooks: Vec::new() }
    }

    #[must_use]
    pub fn with_attach_hook(mut self, hook: Arc<dyn AttachHook>) -> Self {
        self.attach_hooks.push(hook);
        self
    }

    /// Starts the work queue and returns the handle to the running engine.
    /// Records and end-of-stream messages are delivered to `sink`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`BatchKitError::Configuration`] if the configuration is
    /// invalid or the batching stage has fewer slots than
    /// `max_parallel_streams`.
    pub fn start(self, sink: mpsc::UnboundedSender<SinkMessage>) -> Result<PipelineHandle> {
        let Self { config, graph, stage, attach_hooks } = self;
        config.validate()?;
        let output = config.output_mode()?;
        if stage.slot_count() < config.max_parallel_streams {
            return Err(BatchKitError::Configuration(format!(
                "batching stage has {} slots, {} required",
                stage.slot_count(),
                config.max_parallel_streams
            )));
        }

        tracing::info!(
            max_parallel_streams = config.max_parallel_streams,
            batch_size = config.batch_size,
            batched_push_timeout_us = config.batched_push_timeout_us,
            frame_width = config.frame.width,
            frame_height = config.frame.height,
            total_width = config.frame.total_width(),
            total_height = config.frame.total_height(),
            output = ?output.codec().map(Codec::name),
            "Starting pipeline engine"
        );

        let registry = Arc::new(SourceRegistry::new());
        let reconciler = Reconciler::new(
            registry.clone(),
            config.frame,
            config.internal_attributes(),
            config.fps_period_frames,
        );
        let gateway = BatchingGateway::new(stage, reconciler, output.emits_frames(), sink.clone());

        let (work, work_rx) = WorkQueue::channel();
        let (state_tx, state_rx) = mpsc::unbounded_channel();
        let (query_tx, query_rx) = mpsc::channel(DEFAULT_QUERY_CAPACITY);
        let (failure, failure_rx) = watch::channel(None);

        let ctx = Arc::new(PipelineContext {
            frame: config.frame,
            max_parallel_streams: config.max_parallel_streams,
            gate_poll_interval: config.gate_poll_interval(),
            slot_backoff: config.slot_backoff(),
            registry,
            pool: SlotPool::new(config.max_parallel_streams),
            graph,
            gateway,
            probes: batchkit_core::ProbeTable::new(),
            output,
            sink,
            work,
            state_tx,
            suppress_eos: Arc::new(AtomicBool::new(config.suppress_eos)),
            cancel: CancellationToken::new(),
            failure,
            attach_hooks,
            metrics: EngineMetrics::new(),
        });
        admission::register_split_probes(&ctx);

        let actor = PipelineActor::new(ctx.clone(), work_rx, query_rx, state_rx);
        let engine_task = tokio::spawn(actor.run());

        Ok(PipelineHandle::new(ctx, query_tx, failure_rx, engine_task))
    }
}

#[cfg(test)]
mod tests;
