// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Source registry: stream id -> per-stream state, and slot -> stream id.
//!
//! Lock order is registry, then stream state, then slot pool. Nothing here
//! calls into the element graph while a lock is held.

use crate::drain::DrainTracker;
use crate::gateway::BatchInputHandle;
use crate::release_gate::ReleaseGate;
use crate::slot_pool::SlotPool;
use batchkit_core::{
    BatchKitError, ElementHandle, ProbeId, Resolution, Result, StreamId, StreamPhase,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Mutable part of a stream's state.
#[derive(Debug, Default)]
pub(crate) struct StreamInner {
    pub slot_index: Option<usize>,
    pub source_resolution: Option<Resolution>,
    pub dest_resolution: Option<Resolution>,
    /// Per-stream elements between the source and the batching stage, in
    /// construction order.
    pub pre_batch_elements: Vec<ElementHandle>,
    /// Per-stream elements after the splitting stage, in construction order.
    pub post_batch_elements: Vec<ElementHandle>,
    pub batch_input: Option<BatchInputHandle>,
    pub probes: Vec<ProbeId>,
    pub drain: DrainTracker,
}

/// State of one stream incarnation.
///
/// A re-attaching stream id always gets a fresh `StreamState`; the previous
/// incarnation's gate tells the newcomer when it may proceed.
#[derive(Debug)]
pub struct StreamState {
    stream_id: StreamId,
    gate: ReleaseGate,
    inner: Mutex<StreamInner>,
}

impl StreamState {
    fn new(stream_id: StreamId) -> Self {
        Self { stream_id, gate: ReleaseGate::new(), inner: Mutex::new(StreamInner::default()) }
    }

    pub const fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub const fn release_gate(&self) -> &ReleaseGate {
        &self.gate
    }

    pub fn slot_index(&self) -> Option<usize> {
        self.lock().slot_index
    }

    pub fn source_resolution(&self) -> Option<Resolution> {
        self.lock().source_resolution
    }

    pub fn dest_resolution(&self) -> Option<Resolution> {
        self.lock().dest_resolution
    }

    pub fn phase(&self) -> StreamPhase {
        self.lock().drain.phase()
    }

    /// Number of per-stream elements currently in the pipeline.
    pub fn element_count(&self) -> usize {
        let inner = self.lock();
        inner.pre_batch_elements.len() + inner.post_batch_elements.len()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, StreamInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct RegistryInner {
    streams: HashMap<StreamId, Arc<StreamState>>,
    by_slot: HashMap<usize, StreamId>,
}

#[derive(Default)]
pub struct SourceRegistry {
    inner: Mutex<RegistryInner>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, stream_id: &StreamId) -> Option<Arc<StreamState>> {
        self.lock().streams.get(stream_id).cloned()
    }

    /// Looks up the current incarnation, creating one (gate set) if absent.
    /// The flag is true when a fresh state was created.
    pub fn get_or_insert(&self, stream_id: &StreamId) -> (Arc<StreamState>, bool) {
        let mut inner = self.lock();
        if let Some(state) = inner.streams.get(stream_id) {
            return (state.clone(), false);
        }
        let state = Arc::new(StreamState::new(stream_id.clone()));
        inner.streams.insert(stream_id.clone(), state.clone());
        (state, true)
    }

    /// Records the slot and negotiated resolution of an attaching stream.
    ///
    /// # Errors
    ///
    /// Returns [`BatchKitError::SlotInvariant`] if the slot already maps to a
    /// stream, and [`BatchKitError::ShutDown`] if the stream was drained while
    /// waiting for the slot.
    pub fn assign_slot(
        &self,
        state: &Arc<StreamState>,
        slot: usize,
        source_resolution: Resolution,
    ) -> Result<()> {
        let mut registry = self.lock();
        let mut inner = state.lock();
        if inner.drain.phase() != StreamPhase::Attaching {
            return Err(BatchKitError::ShutDown);
        }
        if let Some(holder) = registry.by_slot.get(&slot) {
            return Err(BatchKitError::SlotInvariant(format!(
                "slot {slot} assigned to '{}' while still held by '{holder}'",
                state.stream_id
            )));
        }
        registry.by_slot.insert(slot, state.stream_id.clone());
        inner.slot_index = Some(slot);
        inner.source_resolution = Some(source_resolution);
        drop(inner);
        drop(registry);
        Ok(())
    }

    pub fn id_by_slot(&self, slot: usize) -> Option<StreamId> {
        self.lock().by_slot.get(&slot).cloned()
    }

    pub fn stream_by_slot(&self, slot: usize) -> Option<Arc<StreamState>> {
        let registry = self.lock();
        registry.by_slot.get(&slot).and_then(|id| registry.streams.get(id)).cloned()
    }

    /// Final step of a stream's life: returns its slot, drops the registry
    /// entry and sets the release gate, all under the registry lock so a
    /// concurrent lookup sees either the old incarnation with its gate set or
    /// no entry at all. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates [`BatchKitError::SlotInvariant`] from the pool. The gate is
    /// set regardless.
    pub fn release(&self, state: &Arc<StreamState>, pool: &SlotPool) -> Result<Option<usize>> {
        let mut registry = self.lock();
        let mut inner = state.lock();
        inner.drain.mark_released();
        let slot = inner.slot_index.take();
        drop(inner);

        let mut result = Ok(slot);
        if let Some(slot) = slot {
            if registry.by_slot.get(&slot) == Some(&state.stream_id) {
                registry.by_slot.remove(&slot);
            }
            if let Err(e) = pool.release(slot) {
                result = Err(e);
            }
        }
        if registry.streams.get(&state.stream_id).is_some_and(|s| Arc::ptr_eq(s, state)) {
            registry.streams.remove(&state.stream_id);
        }
        state.gate.set();
        drop(registry);
        result
    }

    /// Every registered stream, in no particular order.
    pub fn snapshot(&self) -> Vec<Arc<StreamState>> {
        self.lock().streams.values().cloned().collect()
    }

    pub fn phases(&self) -> HashMap<StreamId, StreamPhase> {
        self.snapshot().into_iter().map(|s| (s.stream_id.clone(), s.phase())).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Streams currently holding a slot.
    pub fn attached(&self) -> usize {
        self.lock().by_slot.len()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot_pool::SlotAcquire;

    fn id(s: &str) -> StreamId {
        StreamId::new(s)
    }

    #[test]
    fn test_get_or_insert_reuses_live_entry() {
        let registry = SourceRegistry::new();
        let (a, created) = registry.get_or_insert(&id("a"));
        assert!(created);
        let (b, created) = registry.get_or_insert(&id("a"));
        assert!(!created);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.release_gate().is_set());
    }

    #[test]
    fn test_assign_and_resolve_slot() {
        let registry = SourceRegistry::new();
        let (state, _) = registry.get_or_insert(&id("cam"));
        registry.assign_slot(&state, 3, Resolution::new(1920, 1080)).unwrap();
        assert_eq!(registry.id_by_slot(3), Some(id("cam")));
        assert_eq!(state.slot_index(), Some(3));
        assert_eq!(state.source_resolution(), Some(Resolution::new(1920, 1080)));
        assert!(registry.id_by_slot(4).is_none());
    }

    #[test]
    fn test_assign_taken_slot_is_invariant_violation() {
        let registry = SourceRegistry::new();
        let (a, _) = registry.get_or_insert(&id("a"));
        let (b, _) = registry.get_or_insert(&id("b"));
        registry.assign_slot(&a, 0, Resolution::new(1, 1)).unwrap();
        let err = registry.assign_slot(&b, 0, Resolution::new(1, 1)).unwrap_err();
        assert!(matches!(err, BatchKitError::SlotInvariant(_)));
    }

    #[test]
    fn test_release_returns_slot_and_opens_gate() {
        let registry = SourceRegistry::new();
        let pool = SlotPool::new(1);
        let (state, _) = registry.get_or_insert(&id("a"));
        assert!(state.release_gate().try_claim());
        let SlotAcquire::Acquired(slot) = pool.acquire() else { panic!("pool empty") };
        registry.assign_slot(&state, slot, Resolution::new(2, 2)).unwrap();

        assert_eq!(registry.release(&state, &pool).unwrap(), Some(0));
        assert!(state.release_gate().is_set());
        assert!(state.slot_index().is_none());
        assert!(registry.get(&id("a")).is_none());
        assert!(registry.id_by_slot(0).is_none());
        assert_eq!(pool.available(), 1);
        assert_eq!(state.phase(), StreamPhase::Released);

        // Second release is a no-op.
        assert_eq!(registry.release(&state, &pool).unwrap(), None);
    }

    #[test]
    fn test_release_of_stale_incarnation_keeps_new_entry() {
        let registry = SourceRegistry::new();
        let pool = SlotPool::new(1);
        let (old, _) = registry.get_or_insert(&id("a"));
        registry.release(&old, &pool).unwrap();
        let (new, created) = registry.get_or_insert(&id("a"));
        assert!(created);
        registry.release(&old, &pool).unwrap();
        assert!(registry.get(&id("a")).is_some_and(|s| Arc::ptr_eq(&s, &new)));
    }

    #[test]
    fn test_assign_after_release_is_rejected() {
        let registry = SourceRegistry::new();
        let pool = SlotPool::new(1);
        let (state, _) = registry.get_or_insert(&id("a"));
        registry.release(&state, &pool).unwrap();
        assert!(matches!(
            registry.assign_slot(&state, 0, Resolution::new(1, 1)),
            Err(BatchKitError::ShutDown)
        ));
    }
}
