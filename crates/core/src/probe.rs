// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Boundary event dispatch.
//!
//! Streaming contexts report events (caps, end-of-stream) observed at a
//! [`Boundary`]. Handlers are registered per `(boundary, event kind)` and
//! return a [`ProbeReturn`] disposition. Handlers run on the streaming
//! context that delivered the event, so they must not mutate pipeline
//! structure directly; they hand work to the engine's work queue instead.

use crate::types::{StreamId, VideoCaps};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Attachment point where events are observed.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Boundary {
    /// Stream output of the upstream source adapter.
    Source(StreamId),
    /// Per-slot input of the batching stage ("upstream").
    BatchInput(usize),
    /// Per-slot output of the splitting stage.
    SplitOutput(usize),
    /// End of a stream's post-batch output chain ("downstream").
    StreamSink(StreamId),
}

impl fmt::Display for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source(id) => write!(f, "source.src_{id}"),
            Self::BatchInput(slot) => write!(f, "muxer.sink_{slot}"),
            Self::SplitOutput(slot) => write!(f, "demuxer.src_{slot}"),
            Self::StreamSink(id) => write!(f, "sink_{id}.sink"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Caps,
    Eos,
    StreamEos,
}

/// An event flowing through a boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PadEvent {
    /// Format negotiated on the boundary.
    Caps(VideoCaps),
    /// Plain end-of-stream.
    Eos,
    /// Per-stream end-of-stream emitted by the splitting stage, tagged with
    /// the slot it belongs to. The splitter redelivers it on every output slot.
    StreamEos { slot: Option<usize> },
}

impl PadEvent {
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Caps(_) => EventKind::Caps,
            Self::Eos => EventKind::Eos,
            Self::StreamEos { .. } => EventKind::StreamEos,
        }
    }
}

/// Handler disposition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeReturn {
    /// Let the event continue downstream.
    Pass,
    /// Swallow the event.
    Drop,
    /// Let the event continue and unregister this handler.
    Remove,
}

pub type ProbeHandler = Arc<dyn Fn(&Boundary, &PadEvent) -> ProbeReturn + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProbeId(u64);

type ProbeKey = (Boundary, EventKind);

/// Callback table keyed by `(boundary, event kind)`.
#[derive(Default)]
pub struct ProbeTable {
    handlers: Mutex<HashMap<ProbeKey, Vec<(ProbeId, ProbeHandler)>>>,
    next_id: AtomicU64,
}

impl ProbeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler. Handlers on the same key run in registration order.
    pub fn register<F>(&self, boundary: Boundary, kind: EventKind, handler: F) -> ProbeId
    where
        F: Fn(&Boundary, &PadEvent) -> ProbeReturn + Send + Sync + 'static,
    {
        let id = ProbeId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().entry((boundary, kind)).or_default().push((id, Arc::new(handler)));
        id
    }

    pub fn unregister(&self, id: ProbeId) {
        let mut handlers = self.lock();
        handlers.retain(|_, list| {
            list.retain(|(probe_id, _)| *probe_id != id);
            !list.is_empty()
        });
    }

    pub fn has_handlers(&self, boundary: &Boundary, kind: EventKind) -> bool {
        self.lock().get(&(boundary.clone(), kind)).is_some_and(|list| !list.is_empty())
    }

    /// Runs the handlers registered for the event.
    ///
    /// The table lock is not held while handlers run, so a handler may register
    /// or unregister probes. Returns [`ProbeReturn::Drop`] if any handler
    /// dropped the event, [`ProbeReturn::Pass`] otherwise.
    pub fn dispatch(&self, boundary: &Boundary, event: &PadEvent) -> ProbeReturn {
        let key = (boundary.clone(), event.kind());
        let handlers: Vec<(ProbeId, ProbeHandler)> =
            self.lock().get(&key).cloned().unwrap_or_default();

        for (id, handler) in handlers {
            match handler(boundary, event) {
                ProbeReturn::Pass => {},
                ProbeReturn::Remove => self.unregister(id),
                ProbeReturn::Drop => {
                    tracing::trace!(%boundary, ?event, "Event dropped by probe");
                    return ProbeReturn::Drop;
                },
            }
        }
        ProbeReturn::Pass
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ProbeKey, Vec<(ProbeId, ProbeHandler)>>> {
        // Handlers never run under this lock, so a poisoned table is still consistent.
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_dispatch_runs_matching_handlers_only() {
        let table = ProbeTable::new();
        let eos_calls = Arc::new(AtomicUsize::new(0));
        let calls = eos_calls.clone();
        table.register(Boundary::BatchInput(0), EventKind::Eos, move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            ProbeReturn::Pass
        });

        assert_eq!(table.dispatch(&Boundary::BatchInput(1), &PadEvent::Eos), ProbeReturn::Pass);
        assert_eq!(
            table.dispatch(&Boundary::BatchInput(0), &PadEvent::Caps(VideoCaps::raw("RGBA", 1, 1))),
            ProbeReturn::Pass
        );
        assert_eq!(eos_calls.load(Ordering::SeqCst), 0);

        table.dispatch(&Boundary::BatchInput(0), &PadEvent::Eos);
        assert_eq!(eos_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_unregisters_handler() {
        let table = ProbeTable::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let boundary = Boundary::Source(StreamId::new("a"));
        table.register(boundary.clone(), EventKind::Caps, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            ProbeReturn::Remove
        });

        let caps = PadEvent::Caps(VideoCaps::raw("NV12", 2, 2));
        table.dispatch(&boundary, &caps);
        table.dispatch(&boundary, &caps);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!table.has_handlers(&boundary, EventKind::Caps));
    }

    #[test]
    fn test_drop_short_circuits() {
        let table = ProbeTable::new();
        let boundary = Boundary::StreamSink(StreamId::new("a"));
        let second = Arc::new(AtomicUsize::new(0));
        let counter = second.clone();
        table.register(boundary.clone(), EventKind::Eos, |_, _| ProbeReturn::Drop);
        table.register(boundary.clone(), EventKind::Eos, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            ProbeReturn::Pass
        });

        assert_eq!(table.dispatch(&boundary, &PadEvent::Eos), ProbeReturn::Drop);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_handler_may_register_during_dispatch() {
        let table = Arc::new(ProbeTable::new());
        let inner = table.clone();
        let boundary = Boundary::SplitOutput(2);
        table.register(boundary.clone(), EventKind::StreamEos, move |b, _| {
            inner.register(b.clone(), EventKind::Eos, |_, _| ProbeReturn::Pass);
            ProbeReturn::Remove
        });

        table.dispatch(&boundary, &PadEvent::StreamEos { slot: Some(2) });
        assert!(table.has_handlers(&boundary, EventKind::Eos));
        assert!(!table.has_handlers(&boundary, EventKind::StreamEos));
    }
}
