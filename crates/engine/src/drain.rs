// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Drain coordination.
//!
//! A stream is drained in two halves. Upstream end-of-stream at the batching
//! input tears down the pre-batch chain and gives the input slot back to the
//! batching stage. Downstream end-of-stream at the stream sink marks the
//! post-batch chain as flushed. Once both have happened, in either order, the
//! post-batch chain is removed, the slot returns to the pool and the release
//! gate opens.
//!
//! [`DrainTracker`] is the pure state machine; [`DrainCoordinator`] executes
//! its steps against the element graph. Coordinator methods only run on the
//! work queue.

use crate::chain::teardown_elements;
use crate::context::PipelineContext;
use crate::registry::StreamState;
use batchkit_core::{Boundary, Endpoint, PadEvent, Result, StreamPhase};
use std::sync::Arc;

/// Structural work the tracker asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStep {
    /// Remove the pre-batch chain and release the batching input slot.
    TeardownInput,
    /// Remove the post-batch chain, return the slot and open the gate.
    FinalizeRelease,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainTracker {
    phase: StreamPhase,
    upstream_eos: bool,
    downstream_eos: bool,
    input_released: bool,
}

impl Default for DrainTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DrainTracker {
    pub const fn new() -> Self {
        Self {
            phase: StreamPhase::Attaching,
            upstream_eos: false,
            downstream_eos: false,
            input_released: false,
        }
    }

    pub const fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub const fn downstream_eos_seen(&self) -> bool {
        self.downstream_eos
    }

    /// `Attaching -> Active`. Returns false from any other phase.
    pub fn activate(&mut self) -> bool {
        if self.phase == StreamPhase::Attaching {
            self.phase = StreamPhase::Active;
            true
        } else {
            false
        }
    }

    /// Upstream end-of-stream. Duplicates and events outside `Active` are ignored.
    pub fn on_upstream_eos(&mut self) -> Option<DrainStep> {
        if self.phase != StreamPhase::Active || self.upstream_eos {
            return None;
        }
        self.upstream_eos = true;
        self.phase = StreamPhase::PreDraining;
        Some(DrainStep::TeardownInput)
    }

    /// The input side has been torn down.
    pub fn on_input_released(&mut self) -> Option<DrainStep> {
        if self.input_released {
            return None;
        }
        self.input_released = true;
        self.ready_to_release()
    }

    /// Downstream end-of-stream. While still `Active` it is only recorded and
    /// acted upon once the input side has been torn down.
    pub fn on_downstream_eos(&mut self) -> Option<DrainStep> {
        if self.downstream_eos
            || !matches!(self.phase, StreamPhase::Active | StreamPhase::PreDraining)
        {
            return None;
        }
        self.downstream_eos = true;
        self.ready_to_release()
    }

    /// Drains regardless of observed events. No-op once releasing.
    pub fn force(&mut self) -> Option<DrainStep> {
        if matches!(self.phase, StreamPhase::PostDraining | StreamPhase::Released) {
            return None;
        }
        self.upstream_eos = true;
        self.downstream_eos = true;
        self.phase = StreamPhase::PreDraining;
        if self.input_released {
            self.ready_to_release()
        } else {
            Some(DrainStep::TeardownInput)
        }
    }

    pub(crate) fn mark_released(&mut self) {
        self.phase = StreamPhase::Released;
    }

    fn ready_to_release(&mut self) -> Option<DrainStep> {
        if self.phase == StreamPhase::PreDraining && self.input_released && self.downstream_eos {
            self.phase = StreamPhase::PostDraining;
            Some(DrainStep::FinalizeRelease)
        } else {
            None
        }
    }
}

/// Executes drain steps for streams.
pub(crate) struct DrainCoordinator {
    ctx: Arc<PipelineContext>,
}

impl DrainCoordinator {
    pub(crate) const fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    /// Upstream end-of-stream observed at batching input `slot`.
    pub(crate) fn on_upstream_eos(&self, state: &Arc<StreamState>, slot: usize) {
        let step = {
            let mut inner = state.lock();
            if inner.slot_index != Some(slot) {
                // The stream moved on (or was force-drained) before the event was handled.
                tracing::debug!(
                    stream_id = %state.stream_id(),
                    slot,
                    current_slot = ?inner.slot_index,
                    "Ignoring upstream end of stream for stale slot"
                );
                return;
            }
            inner.drain.on_upstream_eos()
        };
        if step.is_some() {
            tracing::info!(stream_id = %state.stream_id(), slot, "Upstream end of stream");
            self.ctx.emit(state, StreamPhase::PreDraining);
        }
        self.run(state, step);
    }

    /// Downstream end-of-stream observed at the stream sink.
    pub(crate) fn on_downstream_eos(&self, state: &Arc<StreamState>) {
        let step = state.lock().drain.on_downstream_eos();
        tracing::info!(
            stream_id = %state.stream_id(),
            phase = state.phase().as_str(),
            "Downstream end of stream"
        );
        self.run(state, step);
    }

    /// The splitting stage emitted the per-stream end-of-stream for `slot`.
    /// Detaches the stream's output chain and forwards the event to its sink.
    pub(crate) fn on_split_eos(&self, slot: usize) {
        let Some(state) = self.ctx.registry.stream_by_slot(slot) else {
            tracing::debug!(slot, "Stream end of stream for unattached slot");
            return;
        };
        let queue = state.lock().post_batch_elements.first().cloned();
        if let Some(queue) = queue {
            if let Err(e) =
                self.ctx.graph.unlink(&Endpoint::SplitOutput(slot), &Endpoint::ElementSink(queue))
            {
                tracing::warn!(stream_id = %state.stream_id(), slot, error = %e, "Failed to unlink output chain");
            }
        }
        tracing::debug!(stream_id = %state.stream_id(), slot, "Forwarding end of stream to sink");
        self.ctx.probes.dispatch(&Boundary::StreamSink(state.stream_id().clone()), &PadEvent::Eos);
    }

    /// Drains a stream whatever events it has seen.
    pub(crate) fn force_drain(&self, state: &Arc<StreamState>) {
        let step = state.lock().drain.force();
        if step.is_some() {
            tracing::info!(stream_id = %state.stream_id(), "Forcing drain");
            self.ctx.emit(state, StreamPhase::PreDraining);
        }
        self.run(state, step);
    }

    /// Force-drains every registered stream.
    pub(crate) fn drain_all(&self) {
        for state in self.ctx.registry.snapshot() {
            self.force_drain(&state);
        }
    }

    fn run(&self, state: &Arc<StreamState>, mut step: Option<DrainStep>) {
        while let Some(current) = step.take() {
            step = match current {
                DrainStep::TeardownInput => {
                    if let Err(e) = self.teardown_input(state) {
                        self.ctx.fail(&e, "tearing down stream input");
                    }
                    state.lock().drain.on_input_released()
                },
                DrainStep::FinalizeRelease => {
                    if let Err(e) = self.finalize(state) {
                        self.ctx.fail(&e, "releasing stream");
                    }
                    None
                },
            };
        }
    }

    fn teardown_input(&self, state: &Arc<StreamState>) -> Result<()> {
        let (elements, input) = {
            let mut inner = state.lock();
            (std::mem::take(&mut inner.pre_batch_elements), inner.batch_input.take())
        };
        tracing::debug!(
            stream_id = %state.stream_id(),
            elements = elements.len(),
            "Removing pre-batch elements"
        );
        let removed = teardown_elements(self.ctx.graph.as_ref(), elements);
        let released = input.map_or(Ok(()), |input| self.ctx.gateway.release_input_slot(input));
        removed.and(released)
    }

    fn finalize(&self, state: &Arc<StreamState>) -> Result<()> {
        let (elements, probes, slot) = {
            let mut inner = state.lock();
            (
                std::mem::take(&mut inner.post_batch_elements),
                std::mem::take(&mut inner.probes),
                inner.slot_index,
            )
        };
        self.ctx.emit(state, StreamPhase::PostDraining);

        for probe in probes {
            self.ctx.probes.unregister(probe);
        }
        tracing::debug!(
            stream_id = %state.stream_id(),
            elements = elements.len(),
            "Removing post-batch elements"
        );
        let removed = teardown_elements(self.ctx.graph.as_ref(), elements);

        // Emitted first so it is ordered before the next incarnation's updates.
        self.ctx.emit(state, StreamPhase::Released);
        let released = self.ctx.registry.release(state, &self.ctx.pool);
        self.ctx.record_attached();
        tracing::info!(stream_id = %state.stream_id(), ?slot, "Resources for source have been released");
        removed.and(released.map(|_| ()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active() -> DrainTracker {
        let mut tracker = DrainTracker::new();
        assert!(tracker.activate());
        tracker
    }

    #[test]
    fn test_upstream_then_downstream() {
        let mut t = active();
        assert_eq!(t.on_upstream_eos(), Some(DrainStep::TeardownInput));
        assert_eq!(t.phase(), StreamPhase::PreDraining);
        assert_eq!(t.on_input_released(), None);
        assert_eq!(t.on_downstream_eos(), Some(DrainStep::FinalizeRelease));
        assert_eq!(t.phase(), StreamPhase::PostDraining);
    }

    #[test]
    fn test_downstream_first_is_buffered() {
        let mut t = active();
        assert_eq!(t.on_downstream_eos(), None);
        assert_eq!(t.phase(), StreamPhase::Active);
        assert!(t.downstream_eos_seen());
        assert_eq!(t.on_upstream_eos(), Some(DrainStep::TeardownInput));
        assert_eq!(t.on_input_released(), Some(DrainStep::FinalizeRelease));
        assert_eq!(t.phase(), StreamPhase::PostDraining);
    }

    #[test]
    fn test_duplicate_events_are_ignored() {
        let mut t = active();
        assert!(t.on_upstream_eos().is_some());
        assert!(t.on_upstream_eos().is_none());
        assert!(t.on_input_released().is_none());
        assert!(t.on_downstream_eos().is_some());
        assert!(t.on_downstream_eos().is_none());
    }

    #[test]
    fn test_events_before_activation_are_ignored() {
        let mut t = DrainTracker::new();
        assert!(t.on_upstream_eos().is_none());
        assert!(t.on_downstream_eos().is_none());
        assert_eq!(t.phase(), StreamPhase::Attaching);
    }

    #[test]
    fn test_force_from_active_and_half_drained() {
        let mut t = active();
        assert_eq!(t.force(), Some(DrainStep::TeardownInput));
        assert_eq!(t.on_input_released(), Some(DrainStep::FinalizeRelease));

        let mut t = active();
        t.on_upstream_eos();
        t.on_input_released();
        assert_eq!(t.force(), Some(DrainStep::FinalizeRelease));
        assert!(t.force().is_none());
    }

    #[test]
    fn test_force_from_attaching() {
        let mut t = DrainTracker::new();
        assert_eq!(t.force(), Some(DrainStep::TeardownInput));
        assert!(!t.activate());
    }
}
