// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The serialized work queue.
//!
//! Every structural mutation of the pipeline (building, linking and removing
//! per-stream elements) runs here, one item at a time and in submission
//! order. Streaming contexts never touch structure; they submit a
//! [`WorkItem`] and return. The actor also tracks stream phases for queries
//! and fans state updates out to subscribers.

use crate::admission;
use crate::constants::DEFAULT_SUBSCRIBER_CHANNEL_CAPACITY;
use crate::context::PipelineContext;
use crate::drain::DrainCoordinator;
use crate::registry::StreamState;
use batchkit_core::{BatchKitError, Result, StreamId, StreamPhase, StreamStateUpdate, VideoCaps};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

pub(crate) enum WorkItem {
    /// Build and link the chains of an admitted stream.
    Attach { state: Arc<StreamState>, caps: VideoCaps, done: oneshot::Sender<Result<()>> },
    UpstreamEos { state: Arc<StreamState>, slot: usize },
    DownstreamEos { state: Arc<StreamState> },
    /// The splitting stage emitted the per-stream end-of-stream for `slot`.
    SplitEos { slot: usize },
    /// Stop suppressing sink end-of-stream, drain everything and stop.
    Shutdown { done: oneshot::Sender<()> },
}

/// Producer side of the work queue. Submitting never blocks.
#[derive(Clone)]
pub(crate) struct WorkQueue {
    tx: mpsc::UnboundedSender<WorkItem>,
}

impl WorkQueue {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<WorkItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn submit(&self, item: WorkItem) -> Result<()> {
        self.tx.send(item).map_err(|_| BatchKitError::ShutDown)
    }
}

pub(crate) enum QueryMessage {
    GetStreamPhases { response_tx: mpsc::Sender<HashMap<StreamId, StreamPhase>> },
    SubscribeState { response_tx: mpsc::Sender<mpsc::Receiver<StreamStateUpdate>> },
}

pub(crate) struct PipelineActor {
    ctx: Arc<PipelineContext>,
    drain: DrainCoordinator,
    work_rx: mpsc::UnboundedReceiver<WorkItem>,
    query_rx: mpsc::Receiver<QueryMessage>,
    state_rx: mpsc::UnboundedReceiver<StreamStateUpdate>,
    /// Phase of every stream that has not been released yet.
    stream_phases: HashMap<StreamId, StreamPhase>,
    state_subscribers: Vec<mpsc::Sender<StreamStateUpdate>>,
}

impl PipelineActor {
    pub(crate) fn new(
        ctx: Arc<PipelineContext>,
        work_rx: mpsc::UnboundedReceiver<WorkItem>,
        query_rx: mpsc::Receiver<QueryMessage>,
        state_rx: mpsc::UnboundedReceiver<StreamStateUpdate>,
    ) -> Self {
        Self {
            drain: DrainCoordinator::new(ctx.clone()),
            ctx,
            work_rx,
            query_rx,
            state_rx,
            stream_phases: HashMap::new(),
            state_subscribers: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::info!("Pipeline work queue started");
        loop {
            tokio::select! {
                // Structural work first, so queries observe everything submitted before them.
                biased;

                Some(item) = self.work_rx.recv() => {
                    if !self.handle_work(item).await {
                        break;
                    }
                },
                Some(query) = self.query_rx.recv() => {
                    self.handle_query(query).await;
                },
                Some(update) = self.state_rx.recv() => {
                    self.handle_state_update(&update);
                },
                else => break,
            }
        }
        tracing::info!("Pipeline work queue stopped");
    }

    /// Returns false once the queue should stop.
    async fn handle_work(&mut self, item: WorkItem) -> bool {
        match item {
            WorkItem::Attach { state, caps, done } => {
                let result = admission::attach_stream(&self.ctx, &state, &caps).await;
                if let Err(e) = &result {
                    tracing::warn!(stream_id = %state.stream_id(), error = %e, "Failed to attach stream");
                }
                let _ = done.send(result);
            },
            WorkItem::UpstreamEos { state, slot } => self.drain.on_upstream_eos(&state, slot),
            WorkItem::DownstreamEos { state } => self.drain.on_downstream_eos(&state),
            WorkItem::SplitEos { slot } => self.drain.on_split_eos(slot),
            WorkItem::Shutdown { done } => {
                tracing::info!(streams = self.ctx.registry.len(), "Draining streams before shutdown");
                self.ctx.stop_suppressing_eos();
                self.drain.drain_all();
                self.flush_state_updates();
                let _ = done.send(());
                return false;
            },
        }
        true
    }

    async fn handle_query(&mut self, query: QueryMessage) {
        // Answer with every transition emitted so far.
        self.flush_state_updates();
        match query {
            QueryMessage::GetStreamPhases { response_tx } => {
                let _ = response_tx.send(self.stream_phases.clone()).await;
            },
            QueryMessage::SubscribeState { response_tx } => {
                let (tx, rx) = mpsc::channel(DEFAULT_SUBSCRIBER_CHANNEL_CAPACITY);
                self.state_subscribers.push(tx);
                let _ = response_tx.send(rx).await;
            },
        }
    }

    fn flush_state_updates(&mut self) {
        while let Ok(update) = self.state_rx.try_recv() {
            self.handle_state_update(&update);
        }
    }

    fn handle_state_update(&mut self, update: &StreamStateUpdate) {
        tracing::debug!(
            stream_id = %update.stream_id,
            phase = update.phase.as_str(),
            slot = ?update.slot_index,
            "Stream phase changed"
        );
        if update.phase == StreamPhase::Released {
            self.stream_phases.remove(&update.stream_id);
        } else {
            self.stream_phases.insert(update.stream_id.clone(), update.phase);
        }

        self.state_subscribers.retain(|subscriber| match subscriber.try_send(update.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(stream_id = %update.stream_id, "State subscriber lagging, dropping update");
                true
            },
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}
