// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Building and tearing down per-stream element chains.

use batchkit_core::{ElementGraph, ElementHandle, ElementSpec, Result};

/// Collects elements as they are created so a half-built chain can be torn
/// down if a later step fails.
pub struct ChainBuilder<'a> {
    graph: &'a dyn ElementGraph,
    elements: Vec<ElementHandle>,
}

impl<'a> ChainBuilder<'a> {
    pub fn new(graph: &'a dyn ElementGraph) -> Self {
        Self { graph, elements: Vec::new() }
    }

    pub const fn graph(&self) -> &'a dyn ElementGraph {
        self.graph
    }

    /// Creates an element and records it.
    ///
    /// # Errors
    ///
    /// Propagates the graph's error.
    pub fn add(&mut self, spec: &ElementSpec) -> Result<ElementHandle> {
        let handle = self.graph.add(spec)?;
        tracing::trace!(element = %handle, factory = %spec.factory, "Added element");
        self.elements.push(handle.clone());
        Ok(handle)
    }

    /// Creates an element and links the previous one to it.
    ///
    /// # Errors
    ///
    /// Propagates the graph's error.
    pub fn append(&mut self, spec: &ElementSpec) -> Result<ElementHandle> {
        let prev = self.elements.last().cloned();
        let handle = self.add(spec)?;
        if let Some(prev) = prev {
            self.graph.link_elements(&prev, &handle)?;
        }
        Ok(handle)
    }

    pub fn last(&self) -> Option<&ElementHandle> {
        self.elements.last()
    }

    pub fn finish(self) -> Vec<ElementHandle> {
        self.elements
    }

    /// Removes everything added so far.
    pub fn abort(self) {
        if let Err(e) = teardown_elements(self.graph, self.elements) {
            tracing::warn!(error = %e, "Failed to clean up partially built chain");
        }
    }
}

/// Quiesces and removes elements in reverse construction order.
///
/// Keeps going past failures so nothing is leaked; the first error is returned.
///
/// # Errors
///
/// Returns the first error reported by the graph.
pub fn teardown_elements(graph: &dyn ElementGraph, elements: Vec<ElementHandle>) -> Result<()> {
    let mut first_error = None;
    for element in elements.into_iter().rev() {
        let result = graph.quiesce(&element).and_then(|()| graph.remove(&element));
        if let Err(e) = result {
            tracing::warn!(element = %element, error = %e, "Failed to remove element");
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}
