// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! In-memory element graph and batching stage.
//!
//! Both record what the engine asks of them and enforce the structural rules
//! a real media framework would (one link per endpoint, no links to removed
//! elements, no double requests of an input slot). Used by the synthetic
//! runner and by tests.

use crate::gateway::{BatchInputHandle, BatchingStage};
use batchkit_core::{
    Batch, BatchKitError, ElementGraph, ElementHandle, ElementSpec, Endpoint, NativeFrame, Result,
    VideoCaps,
};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryElement {
    pub handle: ElementHandle,
    pub spec: ElementSpec,
    pub running: bool,
}

#[derive(Default)]
struct GraphInner {
    next_id: u64,
    elements: BTreeMap<u64, MemoryElement>,
    links: Vec<(Endpoint, Endpoint)>,
    removed: Vec<ElementHandle>,
    failing_links: HashSet<Endpoint>,
}

#[derive(Default)]
pub struct MemoryGraph {
    inner: Mutex<GraphInner>,
    /// `(factory, format)` pairs whose caps the element rejects.
    rejected_formats: HashSet<(String, String)>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes elements of `factory` reject caps with the given `format` field.
    #[must_use]
    pub fn rejecting_format(mut self, factory: &str, format: &str) -> Self {
        self.rejected_formats.insert((factory.to_string(), format.to_string()));
        self
    }

    /// Makes every future link into `to` fail.
    pub fn fail_links_to(&self, to: Endpoint) {
        self.lock().failing_links.insert(to);
    }

    /// Live elements in creation order.
    pub fn elements(&self) -> Vec<MemoryElement> {
        self.lock().elements.values().cloned().collect()
    }

    pub fn element_by_name(&self, name: &str) -> Option<MemoryElement> {
        self.lock().elements.values().find(|e| &*e.handle.name == name).cloned()
    }

    pub fn spec_of(&self, element: &ElementHandle) -> Option<ElementSpec> {
        self.lock().elements.get(&element.id).map(|e| e.spec.clone())
    }

    pub fn links(&self) -> Vec<(Endpoint, Endpoint)> {
        self.lock().links.clone()
    }

    pub fn is_linked(&self, from: &Endpoint, to: &Endpoint) -> bool {
        self.lock().links.iter().any(|(f, t)| f == from && t == to)
    }

    /// Whether anything is linked into `to`.
    pub fn has_link_to(&self, to: &Endpoint) -> bool {
        self.lock().links.iter().any(|(_, t)| t == to)
    }

    /// Removed elements, in removal order.
    pub fn removed(&self) -> Vec<ElementHandle> {
        self.lock().removed.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, GraphInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn endpoint_element(endpoint: &Endpoint) -> Option<&ElementHandle> {
    match endpoint {
        Endpoint::ElementSrc(e) | Endpoint::ElementSink(e) => Some(e),
        _ => None,
    }
}

impl ElementGraph for MemoryGraph {
    fn add(&self, spec: &ElementSpec) -> Result<ElementHandle> {
        let mut inner = self.lock();
        let id = inner.next_id;
        let name = spec.name.clone().unwrap_or_else(|| format!("{}{id}", spec.factory));
        if inner.elements.values().any(|e| *e.handle.name == *name) {
            return Err(BatchKitError::Configuration(format!(
                "element name '{name}' already in use"
            )));
        }
        inner.next_id += 1;
        let handle = ElementHandle {
            id,
            name: Arc::from(name.as_str()),
            factory: Arc::from(spec.factory.as_str()),
        };
        inner.elements.insert(
            id,
            MemoryElement { handle: handle.clone(), spec: spec.clone(), running: true },
        );
        drop(inner);
        Ok(handle)
    }

    fn accepts_caps(&self, element: &ElementHandle, caps: &VideoCaps) -> bool {
        let format = caps.get_str("format").unwrap_or_default();
        !self.rejected_formats.contains(&(element.factory.to_string(), format.to_string()))
    }

    fn link(&self, from: &Endpoint, to: &Endpoint) -> Result<()> {
        let mut inner = self.lock();
        for endpoint in [from, to] {
            if let Some(element) = endpoint_element(endpoint) {
                if !inner.elements.contains_key(&element.id) {
                    return Err(BatchKitError::Link(format!("{endpoint} does not exist")));
                }
            }
        }
        if inner.failing_links.contains(to) {
            return Err(BatchKitError::Link(format!("{from} -> {to} rejected")));
        }
        if let Some((_, peer)) = inner.links.iter().find(|(f, _)| f == from) {
            return Err(BatchKitError::Link(format!("{from} is already linked to {peer}")));
        }
        if let Some((peer, _)) = inner.links.iter().find(|(_, t)| t == to) {
            return Err(BatchKitError::Link(format!("{to} is already linked from {peer}")));
        }
        inner.links.push((from.clone(), to.clone()));
        drop(inner);
        Ok(())
    }

    fn unlink(&self, from: &Endpoint, to: &Endpoint) -> Result<()> {
        self.lock().links.retain(|(f, t)| !(f == from && t == to));
        Ok(())
    }

    fn quiesce(&self, element: &ElementHandle) -> Result<()> {
        let mut inner = self.lock();
        let entry = inner
            .elements
            .get_mut(&element.id)
            .ok_or_else(|| BatchKitError::Runtime(format!("unknown element {element}")))?;
        entry.running = false;
        drop(inner);
        Ok(())
    }

    fn remove(&self, element: &ElementHandle) -> Result<()> {
        let mut inner = self.lock();
        let entry = inner
            .elements
            .remove(&element.id)
            .ok_or_else(|| BatchKitError::Runtime(format!("unknown element {element}")))?;
        if entry.running {
            tracing::warn!(element = %element, "Removing element that was not stopped");
        }
        inner.links.retain(|(f, t)| {
            endpoint_element(f).is_none_or(|e| e.id != element.id)
                && endpoint_element(t).is_none_or(|e| e.id != element.id)
        });
        inner.removed.push(entry.handle);
        drop(inner);
        Ok(())
    }
}

#[derive(Default)]
struct StageInner {
    requested: Vec<bool>,
    pending: BTreeMap<usize, VecDeque<NativeFrame>>,
}

/// Batching stage that forms batches of at most one frame per requested slot.
pub struct MemoryStage {
    inner: Mutex<StageInner>,
}

impl MemoryStage {
    pub fn new(slot_count: usize) -> Self {
        Self {
            inner: Mutex::new(StageInner {
                requested: vec![false; slot_count],
                pending: BTreeMap::new(),
            }),
        }
    }

    pub fn is_requested(&self, slot: usize) -> bool {
        self.lock().requested.get(slot).copied().unwrap_or(false)
    }

    pub fn requested_slots(&self) -> Vec<usize> {
        self.lock().requested.iter().enumerate().filter(|(_, r)| **r).map(|(i, _)| i).collect()
    }

    /// Queues a frame on its input slot.
    ///
    /// # Errors
    ///
    /// Returns [`BatchKitError::UnknownStream`] if the slot is not requested.
    pub fn push(&self, frame: NativeFrame) -> Result<()> {
        let mut inner = self.lock();
        let slot = frame.slot_index;
        if !inner.requested.get(slot).copied().unwrap_or(false) {
            return Err(BatchKitError::UnknownStream(format!("input slot {slot} is not requested")));
        }
        inner.pending.entry(slot).or_default().push_back(frame);
        drop(inner);
        Ok(())
    }

    /// Takes the oldest queued frame of each slot, lowest slot first, up to `max_frames`.
    pub fn next_batch(&self, max_frames: usize) -> Option<Batch> {
        let mut inner = self.lock();
        let mut frames = Vec::new();
        for queue in inner.pending.values_mut() {
            if frames.len() == max_frames {
                break;
            }
            if let Some(frame) = queue.pop_front() {
                frames.push(frame);
            }
        }
        inner.pending.retain(|_, queue| !queue.is_empty());
        drop(inner);
        (!frames.is_empty()).then(|| Batch::new(frames))
    }

    fn lock(&self) -> MutexGuard<'_, StageInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BatchingStage for MemoryStage {
    fn slot_count(&self) -> usize {
        self.lock().requested.len()
    }

    fn request_input_slot(&self, slot: usize) -> Result<BatchInputHandle> {
        let mut inner = self.lock();
        match inner.requested.get_mut(slot) {
            None => Err(BatchKitError::Link(format!("batching stage has no input slot {slot}"))),
            Some(true) => Err(BatchKitError::Link(format!("input slot {slot} already requested"))),
            Some(requested) => {
                *requested = true;
                Ok(BatchInputHandle { slot })
            },
        }
    }

    fn release_input_slot(&self, handle: BatchInputHandle) -> Result<()> {
        let mut inner = self.lock();
        match inner.requested.get_mut(handle.slot) {
            Some(requested) if *requested => {
                *requested = false;
                inner.pending.remove(&handle.slot);
                Ok(())
            },
            _ => Err(BatchKitError::SlotInvariant(format!(
                "input slot {} released without being requested",
                handle.slot
            ))),
        }
    }
}
