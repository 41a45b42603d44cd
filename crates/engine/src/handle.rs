// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Public handle to a running pipeline engine.

use crate::admission::Admission;
use crate::constants::SHUTDOWN_TIMEOUT;
use crate::context::PipelineContext;
use crate::gateway::BatchHook;
use crate::work_queue::{QueryMessage, WorkItem};
use batchkit_core::{
    Batch, BatchKitError, BatchStats, Boundary, PadEvent, ProbeReturn, Result, StreamId,
    StreamPhase, StreamStateUpdate, VideoCaps,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

/// Entry points for the host: source events, boundary events, batches,
/// queries and shutdown.
pub struct PipelineHandle {
    ctx: Arc<PipelineContext>,
    query_tx: mpsc::Sender<QueryMessage>,
    admissions: TaskTracker,
    failure_rx: watch::Receiver<Option<String>>,
    engine_task: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl PipelineHandle {
    pub(crate) fn new(
        ctx: Arc<PipelineContext>,
        query_tx: mpsc::Sender<QueryMessage>,
        failure_rx: watch::Receiver<Option<String>>,
        engine_task: JoinHandle<()>,
    ) -> Self {
        Self {
            ctx,
            query_tx,
            admissions: TaskTracker::new(),
            failure_rx,
            engine_task: Arc::new(tokio::sync::Mutex::new(Some(engine_task))),
        }
    }

    /// New-stream event from the source adapter.
    ///
    /// Starts admission of the stream and returns its task, or `None` if the
    /// stream is not admitted (non-video caps, or the engine is shutting down).
    /// Safe to call from any context; it never blocks.
    pub fn on_new_stream(
        &self,
        stream_id: impl Into<StreamId>,
        caps: Option<VideoCaps>,
    ) -> Option<JoinHandle<Result<()>>> {
        let stream_id = stream_id.into();
        if self.ctx.cancel.is_cancelled() {
            tracing::warn!(%stream_id, "Ignoring new stream during shutdown");
            return None;
        }
        let admission = Admission::new(self.ctx.clone(), stream_id, caps)?;
        Some(self.admissions.spawn(admission.run()))
    }

    /// Reports an event observed at a boundary and returns its disposition.
    /// Called by streaming contexts; never blocks.
    pub fn dispatch(&self, boundary: &Boundary, event: &PadEvent) -> ProbeReturn {
        self.ctx.probes.dispatch(boundary, event)
    }

    /// Post-batch interception point. Returns the number of frame records emitted.
    pub fn on_batch(&self, batch: &mut Batch) -> usize {
        self.ctx.gateway.on_batch(batch)
    }

    pub fn add_batch_hook(&self, hook: Arc<dyn BatchHook>) {
        self.ctx.gateway.add_hook(hook);
    }

    pub fn stats(&self) -> BatchStats {
        self.ctx.gateway.stats()
    }

    /// Slot currently held by a stream.
    pub fn slot_of(&self, stream_id: &StreamId) -> Option<usize> {
        self.ctx.registry.get(stream_id).and_then(|state| state.slot_index())
    }

    /// Streams currently holding a slot.
    pub fn attached_streams(&self) -> usize {
        self.ctx.registry.attached()
    }

    pub fn available_slots(&self) -> usize {
        self.ctx.pool.available()
    }

    /// Phase of every stream not yet released.
    ///
    /// # Errors
    ///
    /// Returns [`BatchKitError::ShutDown`] if the engine has stopped.
    pub async fn get_stream_phases(&self) -> Result<HashMap<StreamId, StreamPhase>> {
        let (response_tx, mut response_rx) = mpsc::channel(1);
        self.query_tx
            .send(QueryMessage::GetStreamPhases { response_tx })
            .await
            .map_err(|_| BatchKitError::ShutDown)?;
        response_rx.recv().await.ok_or(BatchKitError::ShutDown)
    }

    /// Subscribes to stream lifecycle transitions.
    ///
    /// # Errors
    ///
    /// Returns [`BatchKitError::ShutDown`] if the engine has stopped.
    pub async fn subscribe_state(&self) -> Result<mpsc::Receiver<StreamStateUpdate>> {
        let (response_tx, mut response_rx) = mpsc::channel(1);
        self.query_tx
            .send(QueryMessage::SubscribeState { response_tx })
            .await
            .map_err(|_| BatchKitError::ShutDown)?;
        response_rx.recv().await.ok_or(BatchKitError::ShutDown)
    }

    /// Resolves with the first fatal error of the run. Never resolves if the
    /// run does not fail.
    pub async fn failed(&self) -> String {
        let mut rx = self.failure_rx.clone();
        let failure = match rx.wait_for(Option::is_some).await {
            Ok(failure) => failure.clone(),
            Err(_) => None,
        };
        match failure {
            Some(failure) => failure,
            None => std::future::pending().await,
        }
    }

    /// Stops admitting, force-drains every stream and stops the work queue.
    ///
    /// Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the work queue does not stop within the timeout or
    /// its task panicked.
    pub async fn shutdown_and_wait(&self) -> Result<()> {
        let join_handle = self.engine_task.lock().await.take();
        let Some(join_handle) = join_handle else {
            tracing::warn!("shutdown_and_wait called multiple times, engine already shut down");
            return Ok(());
        };

        self.ctx.cancel.cancel();
        self.admissions.close();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.admissions.wait()).await.is_err() {
            tracing::warn!(pending = self.admissions.len(), "Admissions still running at shutdown");
        }

        let (done_tx, done_rx) = oneshot::channel();
        self.ctx.work.submit(WorkItem::Shutdown { done: done_tx })?;
        let _ = done_rx.await;

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, join_handle).await {
            Ok(Ok(())) => {
                tracing::debug!("Engine shut down gracefully");
                Ok(())
            },
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Engine task panicked during shutdown");
                Err(BatchKitError::Runtime(format!("engine task panicked: {e}")))
            },
            Err(_) => {
                tracing::warn!(timeout = ?SHUTDOWN_TIMEOUT, "Engine did not shut down in time");
                Err(BatchKitError::Runtime("engine shutdown timeout".to_string()))
            },
        }
    }
}
