// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The element graph seam.
//!
//! Per-stream processing chains are built out of opaque elements hosted by an
//! [`ElementGraph`] implementation (a media framework binding in production,
//! an in-memory recorder in tests). The engine only creates, links, quiesces
//! and removes elements; what an element does to the frames is not its concern.

use crate::error::Result;
use crate::types::{StreamId, VideoCaps};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Description of an element to create.
#[derive(Clone, Debug, PartialEq)]
pub struct ElementSpec {
    /// Factory name of the element (e.g. `"queue"`, `"capsfilter"`).
    pub factory: String,
    /// Optional unique name; the graph picks one when absent.
    pub name: Option<String>,
    pub properties: Map<String, Value>,
}

impl ElementSpec {
    pub fn new(factory: impl Into<String>) -> Self {
        Self { factory: factory.into(), name: None, properties: Map::new() }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn properties(mut self, properties: &Map<String, Value>) -> Self {
        for (key, value) in properties {
            self.properties.insert(key.clone(), value.clone());
        }
        self
    }
}

/// Handle to an element living in an [`ElementGraph`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ElementHandle {
    pub id: u64,
    pub name: Arc<str>,
    pub factory: Arc<str>,
}

impl fmt::Display for ElementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A point where links attach.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Output side of an element.
    ElementSrc(ElementHandle),
    /// Input side of an element.
    ElementSink(ElementHandle),
    /// Stream output of the upstream source adapter.
    Source(StreamId),
    /// Input slot of the shared batching stage.
    BatchInput(usize),
    /// Output slot of the shared splitting stage.
    SplitOutput(usize),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ElementSrc(e) => write!(f, "{e}.src"),
            Self::ElementSink(e) => write!(f, "{e}.sink"),
            Self::Source(id) => write!(f, "source.src_{id}"),
            Self::BatchInput(slot) => write!(f, "muxer.sink_{slot}"),
            Self::SplitOutput(slot) => write!(f, "demuxer.src_{slot}"),
        }
    }
}

/// Host of the structural pipeline.
///
/// Every method here mutates pipeline structure and must only be called from
/// the engine's serialized work queue, never from a streaming callback.
pub trait ElementGraph: Send + Sync {
    /// Creates an element and adds it to the pipeline in the running state.
    ///
    /// # Errors
    ///
    /// Returns an error if the factory is unknown or a property is rejected.
    fn add(&self, spec: &ElementSpec) -> Result<ElementHandle>;

    /// Whether `element` can accept `caps` on its input without conversion.
    fn accepts_caps(&self, element: &ElementHandle, caps: &VideoCaps) -> bool;

    /// Links two endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`crate::BatchKitError::Link`] if the link is rejected.
    fn link(&self, from: &Endpoint, to: &Endpoint) -> Result<()>;

    /// Removes the link between two endpoints, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph cannot perform the unlink.
    fn unlink(&self, from: &Endpoint, to: &Endpoint) -> Result<()>;

    /// Locks the element's state and stops it.
    ///
    /// # Errors
    ///
    /// Returns an error if the element is unknown.
    fn quiesce(&self, element: &ElementHandle) -> Result<()>;

    /// Removes a (quiesced) element from the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the element is unknown.
    fn remove(&self, element: &ElementHandle) -> Result<()>;

    /// Links the output of `from` to the input of `to`.
    ///
    /// # Errors
    ///
    /// See [`ElementGraph::link`].
    fn link_elements(&self, from: &ElementHandle, to: &ElementHandle) -> Result<()> {
        self.link(&Endpoint::ElementSrc(from.clone()), &Endpoint::ElementSink(to.clone()))
    }
}
