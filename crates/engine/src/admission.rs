// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Stream admission.
//!
//! A new-stream event runs through these steps:
//!
//! 1. Claim the stream id: wait until any previous incarnation has fully
//!    released (its release gate is set), then claim a fresh state.
//! 2. Wait for the negotiated caps on the source boundary, if the event did
//!    not carry them. Non-video streams are not admitted.
//! 3. Acquire a slot, backing off while the pool is exhausted.
//! 4. On the work queue: build the pre-batch chain and the post-batch chain,
//!    run attach hooks, then link the stream into its batching input slot.
//!
//! Steps 1 to 3 run on a per-stream task and only wait; step 4 is the only
//! one that touches pipeline structure.

use crate::chain::{teardown_elements, ChainBuilder};
use crate::constants::{
    BATCH_MEMORY_CAPS, FAST_CONVERTER, FORMAT_LOCK, GENERIC_CONVERTER, QUEUE, STREAM_SINK,
};
use crate::context::PipelineContext;
use crate::registry::StreamState;
use crate::slot_pool::SlotAcquire;
use crate::work_queue::{WorkItem, WorkQueue};
use async_trait::async_trait;
use batchkit_core::{
    BatchKitError, Boundary, ElementSpec, Endpoint, EventKind, PadEvent, ProbeId, ProbeReturn,
    Resolution, Result, SinkMessage, StreamId, StreamPhase, VideoCaps,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;

/// A stream that has been given a slot and has its chains built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedStream {
    pub stream_id: StreamId,
    pub slot_index: usize,
    pub source_resolution: Resolution,
    pub dest_resolution: Resolution,
}

/// Collaborator setup that runs once per stream, after its chains are built
/// and before it is linked into the batching stage. An error aborts the
/// admission and is reported as a pipeline failure if fatal.
#[async_trait]
pub trait AttachHook: Send + Sync {
    async fn on_stream_attached(&self, stream: &AttachedStream) -> Result<()>;
}

enum PendingCaps {
    Ready(VideoCaps),
    Awaiting { rx: oneshot::Receiver<VideoCaps>, probe: ProbeId },
}

impl PendingCaps {
    async fn resolve(self, ctx: &PipelineContext) -> Result<VideoCaps> {
        match self {
            Self::Ready(caps) => Ok(caps),
            Self::Awaiting { rx, probe } => {
                tokio::select! {
                    caps = rx => caps.map_err(|_| BatchKitError::ShutDown),
                    () = ctx.cancel.cancelled() => {
                        ctx.probes.unregister(probe);
                        Err(BatchKitError::ShutDown)
                    },
                }
            },
        }
    }

    fn cancel(self, ctx: &PipelineContext) {
        if let Self::Awaiting { probe, .. } = self {
            ctx.probes.unregister(probe);
        }
    }
}

/// Admission of one new-stream event.
pub(crate) struct Admission {
    ctx: Arc<PipelineContext>,
    stream_id: StreamId,
    caps: PendingCaps,
}

impl Admission {
    /// Handles the new-stream event on the calling (streaming) context.
    ///
    /// Returns `None` for streams that are not admitted at all. When the event
    /// carries no caps, a one-shot caps probe is registered on the stream's
    /// source boundary before returning so no negotiation is missed.
    pub(crate) fn new(
        ctx: Arc<PipelineContext>,
        stream_id: StreamId,
        caps: Option<VideoCaps>,
    ) -> Option<Self> {
        let caps = match caps {
            Some(caps) if !caps.is_video() => {
                tracing::debug!(%stream_id, %caps, "Skipping non-video stream");
                return None;
            },
            Some(caps) => PendingCaps::Ready(caps),
            None => {
                let (tx, rx) = oneshot::channel();
                let tx = Mutex::new(Some(tx));
                let probe = ctx.probes.register(
                    Boundary::Source(stream_id.clone()),
                    EventKind::Caps,
                    move |_, event| {
                        if let PadEvent::Caps(caps) = event {
                            if let Some(tx) = tx.lock().unwrap_or_else(PoisonError::into_inner).take()
                            {
                                let _ = tx.send(caps.clone());
                            }
                        }
                        ProbeReturn::Remove
                    },
                );
                PendingCaps::Awaiting { rx, probe }
            },
        };
        tracing::debug!(%stream_id, "New stream detected");
        Some(Self { ctx, stream_id, caps })
    }

    pub(crate) async fn run(self) -> Result<()> {
        let Self { ctx, stream_id, caps } = self;

        let state = match claim_stream(&ctx, &stream_id).await {
            Ok(state) => state,
            Err(e) => {
                caps.cancel(&ctx);
                return Err(e);
            },
        };
        ctx.emit(&state, StreamPhase::Attaching);

        let result = admit(&ctx, &state, caps).await;
        match &result {
            Ok(true) => return Ok(()),
            Ok(false) => {},
            Err(BatchKitError::ShutDown) => {
                tracing::debug!(%stream_id, "Admission cancelled by shutdown");
            },
            Err(e) => ctx.fail(e, "admitting stream"),
        }
        abandon(&ctx, &state);
        result.map(|_| ())
    }
}

/// Steps 2 to 4. Returns false if the stream turned out not to be video.
async fn admit(
    ctx: &PipelineContext,
    state: &Arc<StreamState>,
    caps: PendingCaps,
) -> Result<bool> {
    let caps = caps.resolve(ctx).await?;
    if !caps.is_video() {
        tracing::debug!(stream_id = %state.stream_id(), %caps, "Skipping non-video stream");
        return Ok(false);
    }
    let resolution = caps.resolution()?;

    let slot = acquire_slot(ctx, state).await?;
    if let Err(e) = ctx.registry.assign_slot(state, slot, resolution) {
        if let Err(release_err) = ctx.pool.release(slot) {
            ctx.fail(&release_err, "returning unassigned slot");
        }
        return Err(e);
    }
    tracing::info!(stream_id = %state.stream_id(), slot, %resolution, "Assigned slot to source");

    let (done, done_rx) = oneshot::channel();
    ctx.work.submit(WorkItem::Attach { state: state.clone(), caps, done })?;
    done_rx.await.map_err(|_| BatchKitError::ShutDown)??;
    Ok(true)
}

async fn claim_stream(ctx: &PipelineContext, stream_id: &StreamId) -> Result<Arc<StreamState>> {
    loop {
        let (state, _) = ctx.registry.get_or_insert(stream_id);
        if state.release_gate().try_claim() {
            return Ok(state);
        }

        tracing::warn!(%stream_id, "Waiting for previous incarnation of source to release");
        ctx.metrics.admission_wait("release_gate");
        tokio::select! {
            _ = state.release_gate().wait_set(ctx.gate_poll_interval) => {},
            () = ctx.cancel.cancelled() => return Err(BatchKitError::ShutDown),
        }
    }
}

async fn acquire_slot(ctx: &PipelineContext, state: &StreamState) -> Result<usize> {
    loop {
        if let SlotAcquire::Acquired(slot) = ctx.pool.acquire() {
            return Ok(slot);
        }

        tracing::warn!(
            stream_id = %state.stream_id(),
            max_parallel_streams = ctx.max_parallel_streams,
            "Reached maximum number of streams, waiting for a free slot"
        );
        ctx.metrics.admission_wait("slot");
        tokio::select! {
            () = tokio::time::sleep(ctx.slot_backoff) => {},
            () = ctx.cancel.cancelled() => return Err(BatchKitError::ShutDown),
        }
    }
}

/// Gives back everything an admission that did not complete holds.
/// Elements are never left behind: the work queue removes whatever it built
/// when attaching fails.
fn abandon(ctx: &PipelineContext, state: &Arc<StreamState>) {
    if state.phase() == StreamPhase::Released {
        return;
    }
    ctx.emit(state, StreamPhase::Released);
    if let Err(e) = ctx.registry.release(state, &ctx.pool) {
        ctx.fail(&e, "abandoning stream");
    }
    ctx.record_attached();
}

/// Step 4, on the work queue.
pub(crate) async fn attach_stream(
    ctx: &PipelineContext,
    state: &Arc<StreamState>,
    caps: &VideoCaps,
) -> Result<()> {
    let (slot, source) = {
        let inner = state.lock();
        if inner.drain.phase() != StreamPhase::Attaching {
            return Err(BatchKitError::ShutDown);
        }
        (inner.slot_index, inner.source_resolution)
    };
    let (Some(slot), Some(source)) = (slot, source) else {
        return Err(BatchKitError::SlotInvariant(format!(
            "stream '{}' reached attach without a slot",
            state.stream_id()
        )));
    };
    let dest = ctx.output.compute_dest_resolution(source);
    let graph = ctx.graph.as_ref();

    let mut input = ChainBuilder::new(graph);
    let input_out = match build_input_chain(ctx, &mut input, state.stream_id(), caps) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            input.abort();
            return Err(e);
        },
    };
    let mut output = ChainBuilder::new(graph);
    if let Err(e) = build_output_framing(ctx, &mut output, state.stream_id(), slot, dest) {
        output.abort();
        input.abort();
        return Err(e);
    }
    {
        let mut inner = state.lock();
        inner.dest_resolution = Some(dest);
        inner.pre_batch_elements = input.finish();
        inner.post_batch_elements = output.finish();
    }

    let attached = AttachedStream {
        stream_id: state.stream_id().clone(),
        slot_index: slot,
        source_resolution: source,
        dest_resolution: dest,
    };
    if let Err(e) = link_stream(ctx, state, &attached, input_out).await {
        discard_attach(ctx, state);
        return Err(e);
    }

    state.lock().drain.activate();
    ctx.emit(state, StreamPhase::Active);
    ctx.record_attached();
    tracing::info!(
        stream_id = %state.stream_id(),
        slot,
        %source,
        %dest,
        "Source attached"
    );
    Ok(())
}

async fn link_stream(
    ctx: &PipelineContext,
    state: &Arc<StreamState>,
    attached: &AttachedStream,
    input_out: Endpoint,
) -> Result<()> {
    for hook in &ctx.attach_hooks {
        hook.on_stream_attached(attached).await?;
    }

    let slot = attached.slot_index;
    // End-of-stream may arrive as soon as the link exists; the handlers queue
    // it behind this attach.
    let probes = register_stream_probes(ctx, state, slot);
    state.lock().probes = probes;

    let handle = ctx.gateway.request_input_slot(slot)?;
    state.lock().batch_input = Some(handle);
    ctx.graph.link(&input_out, &Endpoint::BatchInput(slot))?;
    Ok(())
}

/// Fast converter (with the padding applied), preceded by a generic
/// converter if the fast one cannot take the negotiated format, followed by
/// a format lock pinning RGBA at the padded frame size.
fn build_input_chain(
    ctx: &PipelineContext,
    chain: &mut ChainBuilder<'_>,
    stream_id: &StreamId,
    caps: &VideoCaps,
) -> Result<Endpoint> {
    let mut fast = ElementSpec::new(FAST_CONVERTER);
    if let Some(crop) = ctx.frame.content_crop() {
        fast = fast.property("dest-crop", crop);
    }
    let fast = chain.add(&fast)?;

    let entry = if chain.graph().accepts_caps(&fast, caps) {
        fast.clone()
    } else {
        tracing::debug!(%stream_id, %caps, "Inserting generic converter in front of fast converter");
        let generic = chain.add(&ElementSpec::new(GENERIC_CONVERTER))?;
        chain.graph().link_elements(&generic, &fast)?;
        generic
    };
    chain.graph().link(&Endpoint::Source(stream_id.clone()), &Endpoint::ElementSink(entry))?;

    let format = format!(
        "{BATCH_MEMORY_CAPS}, format=RGBA, width={}, height={}",
        ctx.frame.total_width(),
        ctx.frame.total_height()
    );
    let lock = chain.add(&ElementSpec::new(FORMAT_LOCK).property("caps", format))?;
    chain.graph().link_elements(&fast, &lock)?;
    Ok(Endpoint::ElementSrc(lock))
}

/// `split output -> queue -> <output mode chain> -> sink`.
fn build_output_framing(
    ctx: &PipelineContext,
    chain: &mut ChainBuilder<'_>,
    stream_id: &StreamId,
    slot: usize,
    dest: Resolution,
) -> Result<()> {
    let queue = chain.add(&ElementSpec::new(QUEUE).named(format!("queue_{stream_id}")))?;
    chain.graph().link(&Endpoint::SplitOutput(slot), &Endpoint::ElementSink(queue.clone()))?;

    let out = ctx.output.build_output_chain(chain, dest, Endpoint::ElementSrc(queue))?;

    let sink = chain.add(
        &ElementSpec::new(STREAM_SINK).named(format!("sink_{stream_id}")).property("sync", false),
    )?;
    chain.graph().link(&out, &Endpoint::ElementSink(sink))?;
    Ok(())
}

/// Upstream end-of-stream at the batching input and downstream
/// end-of-stream at the stream sink. Both are unregistered on release.
fn register_stream_probes(ctx: &PipelineContext, state: &Arc<StreamState>, slot: usize) -> Vec<ProbeId> {
    let upstream = {
        let work = ctx.work.clone();
        let state = state.clone();
        ctx.probes.register(Boundary::BatchInput(slot), EventKind::Eos, move |_, _| {
            if state.slot_index() != Some(slot) {
                tracing::debug!(stream_id = %state.stream_id(), slot, "Upstream end of stream for stale slot");
                return ProbeReturn::Pass;
            }
            submit(&work, WorkItem::UpstreamEos { state: state.clone(), slot });
            ProbeReturn::Pass
        })
    };

    let downstream = {
        let work = ctx.work.clone();
        let sink = ctx.sink.clone();
        let suppress = ctx.suppress_eos.clone();
        let state = state.clone();
        let seen = AtomicBool::new(false);
        ctx.probes.register(
            Boundary::StreamSink(state.stream_id().clone()),
            EventKind::Eos,
            move |_, _| {
                if !seen.swap(true, Ordering::SeqCst) {
                    let _ = sink.send(SinkMessage::EndOfStream { stream_id: state.stream_id().clone() });
                    submit(&work, WorkItem::DownstreamEos { state: state.clone() });
                }
                if suppress.load(Ordering::SeqCst) {
                    ProbeReturn::Drop
                } else {
                    ProbeReturn::Pass
                }
            },
        )
    };

    vec![upstream, downstream]
}

/// Per-slot handlers on the splitting stage outputs. The splitter redelivers
/// each stream end-of-stream on every output; only the slot it is tagged
/// with acts on it.
pub(crate) fn register_split_probes(ctx: &PipelineContext) {
    for slot in 0..ctx.max_parallel_streams {
        let work = ctx.work.clone();
        ctx.probes.register(Boundary::SplitOutput(slot), EventKind::StreamEos, move |_, event| {
            match event {
                PadEvent::StreamEos { slot: Some(tagged) } if *tagged == slot => {
                    submit(&work, WorkItem::SplitEos { slot });
                    ProbeReturn::Drop
                },
                _ => ProbeReturn::Pass,
            }
        });
    }
}

fn submit(work: &WorkQueue, item: WorkItem) {
    if work.submit(item).is_err() {
        tracing::debug!("Work queue closed, dropping event");
    }
}

/// Removes whatever an attach that failed half-way left behind.
fn discard_attach(ctx: &PipelineContext, state: &Arc<StreamState>) {
    let (pre, post, input, probes) = {
        let mut inner = state.lock();
        (
            std::mem::take(&mut inner.pre_batch_elements),
            std::mem::take(&mut inner.post_batch_elements),
            inner.batch_input.take(),
            std::mem::take(&mut inner.probes),
        )
    };
    for probe in probes {
        ctx.probes.unregister(probe);
    }
    let graph = ctx.graph.as_ref();
    if let Err(e) = teardown_elements(graph, pre).and(teardown_elements(graph, post)) {
        tracing::warn!(stream_id = %state.stream_id(), error = %e, "Failed to remove elements of failed attach");
    }
    if let Some(input) = input {
        if let Err(e) = ctx.gateway.release_input_slot(input) {
            tracing::warn!(stream_id = %state.stream_id(), error = %e, "Failed to release batching input slot");
        }
    }
}
