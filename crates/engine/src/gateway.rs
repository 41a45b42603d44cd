// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Batching gateway: the engine's view of the shared batching/splitting stage.
//!
//! The stage itself (frame batching, inference, per-slot splitting) is an
//! external collaborator reached through [`BatchingStage`]. The gateway hands
//! out its input slots and owns the single post-batch interception point,
//! [`BatchingGateway::on_batch`], where collaborator hooks and the
//! reconciler run.

use crate::reconciler::Reconciler;
use batchkit_core::{Batch, BatchStats, Result, SinkMessage};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;

/// An input slot of the batching stage requested for one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchInputHandle {
    pub slot: usize,
}

/// The shared batching/splitting stage.
///
/// Input and output slot counts are equal and slot `i` on the input side maps
/// to slot `i` on the output side.
pub trait BatchingStage: Send + Sync {
    fn slot_count(&self) -> usize;

    /// Requests input slot `slot` for a new stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot does not exist or is already requested.
    fn request_input_slot(&self, slot: usize) -> Result<BatchInputHandle>;

    /// Gives an input slot back to the stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot was not requested.
    fn release_input_slot(&self, handle: BatchInputHandle) -> Result<()>;
}

/// Collaborator processing that runs on every emitted batch before
/// reconciliation, e.g. drawing overlays onto the frames.
pub trait BatchHook: Send + Sync {
    fn on_batch(&self, batch: &mut Batch);
}

pub struct BatchingGateway {
    stage: Arc<dyn BatchingStage>,
    hooks: RwLock<Vec<Arc<dyn BatchHook>>>,
    reconciler: Reconciler,
    emits_frames: bool,
    sink: mpsc::UnboundedSender<SinkMessage>,
}

impl BatchingGateway {
    pub fn new(
        stage: Arc<dyn BatchingStage>,
        reconciler: Reconciler,
        emits_frames: bool,
        sink: mpsc::UnboundedSender<SinkMessage>,
    ) -> Self {
        Self { stage, hooks: RwLock::new(Vec::new()), reconciler, emits_frames, sink }
    }

    pub fn slot_count(&self) -> usize {
        self.stage.slot_count()
    }

    /// # Errors
    ///
    /// Propagates the stage's error.
    pub fn request_input_slot(&self, slot: usize) -> Result<BatchInputHandle> {
        let handle = self.stage.request_input_slot(slot)?;
        tracing::debug!(slot, "Requested batching input slot");
        Ok(handle)
    }

    /// # Errors
    ///
    /// Propagates the stage's error.
    pub fn release_input_slot(&self, handle: BatchInputHandle) -> Result<()> {
        let slot = handle.slot;
        self.stage.release_input_slot(handle)?;
        tracing::debug!(slot, "Released batching input slot");
        Ok(())
    }

    /// Registers a batch hook. Hooks only run when the output mode emits frames.
    pub fn add_hook(&self, hook: Arc<dyn BatchHook>) {
        self.hooks.write().unwrap_or_else(PoisonError::into_inner).push(hook);
    }

    /// Post-batch interception point, invoked once per batch emitted by the
    /// batching stage. Returns the number of records sent to the sink.
    pub fn on_batch(&self, batch: &mut Batch) -> usize {
        if self.emits_frames {
            let hooks = self.hooks.read().unwrap_or_else(PoisonError::into_inner).clone();
            for hook in hooks {
                hook.on_batch(batch);
            }
        }

        let records = self.reconciler.reconcile(batch);
        let count = records.len();
        for record in records {
            if self.sink.send(SinkMessage::Frame(record)).is_err() {
                tracing::debug!("Record sink closed, dropping batch output");
                return 0;
            }
        }
        count
    }

    pub fn stats(&self) -> BatchStats {
        self.reconciler.stats()
    }
}
