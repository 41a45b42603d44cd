// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Stream lifecycle phases.
//!
//! ```text
//!    Attaching
//!        ↓
//!     Active ──────────────┐ (downstream EOS first: buffered)
//!        ↓                 │
//!   PreDraining ←──────────┘
//!        ↓
//!   PostDraining
//!        ↓
//!    Released
//! ```
//!
//! ### Valid Transitions:
//! - `Attaching` → `Active` once the pre-batch chain is linked into its slot
//! - `Active` → `PreDraining` on upstream end-of-stream
//! - `PreDraining` → `PostDraining` once the input side is torn down and the
//!   downstream end-of-stream has been observed (in either order)
//! - `PostDraining` → `Released` once the slot is back in the pool
//! - `Attaching`/`Active`/`PreDraining` → `PostDraining` on forced drain (shutdown)

use crate::types::StreamId;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPhase {
    /// Waiting for a slot or for a previous incarnation to release, or building chains.
    Attaching,
    /// Linked into its slot; frames flow.
    Active,
    /// Upstream end-of-stream observed; per-stream input elements are being removed.
    PreDraining,
    /// Both sides quiesced; output elements are being removed and the slot returned.
    PostDraining,
    /// Every resource is back; the stream id may be admitted again.
    Released,
}

impl StreamPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Attaching => "attaching",
            Self::Active => "active",
            Self::PreDraining => "pre_draining",
            Self::PostDraining => "post_draining",
            Self::Released => "released",
        }
    }

    /// Whether the stream holds (or is about to hold) a slot.
    pub const fn holds_slot(self) -> bool {
        matches!(self, Self::Active | Self::PreDraining | Self::PostDraining)
    }
}

/// A lifecycle transition of one stream.
#[derive(Debug, Clone)]
pub struct StreamStateUpdate {
    pub stream_id: StreamId,
    pub phase: StreamPhase,
    pub slot_index: Option<usize>,
    pub timestamp: SystemTime,
}

impl StreamStateUpdate {
    #[inline]
    pub fn new(stream_id: StreamId, phase: StreamPhase, slot_index: Option<usize>) -> Self {
        Self { stream_id, phase, slot_index, timestamp: SystemTime::now() }
    }
}

/// Helper functions for emitting stream state updates.
pub mod state_helpers {
    use super::{StreamPhase, StreamStateUpdate};
    use crate::types::StreamId;
    use tokio::sync::mpsc;

    /// Emits a state update. Failures are ignored; state tracking is best-effort.
    #[inline]
    pub fn emit_phase(
        state_tx: &mpsc::UnboundedSender<StreamStateUpdate>,
        stream_id: &StreamId,
        phase: StreamPhase,
        slot_index: Option<usize>,
    ) {
        let _ = state_tx.send(StreamStateUpdate::new(stream_id.clone(), phase, slot_index));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_serializes_snake_case() {
        let json = serde_json::to_string(&StreamPhase::PreDraining).unwrap();
        assert_eq!(json, "\"pre_draining\"");
        assert_eq!(StreamPhase::PostDraining.as_str(), "post_draining");
    }

    #[test]
    fn test_holds_slot() {
        assert!(!StreamPhase::Attaching.holds_slot());
        assert!(StreamPhase::Active.holds_slot());
        assert!(StreamPhase::PostDraining.holds_slot());
        assert!(!StreamPhase::Released.holds_slot());
    }
}
