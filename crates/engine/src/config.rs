// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Engine configuration.

use crate::constants::{
    DEFAULT_BATCHED_PUSH_TIMEOUT_US, DEFAULT_FPS_PERIOD_FRAMES, DEFAULT_GATE_POLL_INTERVAL,
    DEFAULT_MAX_PARALLEL_STREAMS, DEFAULT_SLOT_BACKOFF, MAX_BATCH_SIZE,
};
use crate::output::{Codec, OutputMode};
use batchkit_core::{BatchKitError, FrameParameters, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Frame output settings. Absent means metadata-only output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OutputFrameConfig {
    /// One of `h264`, `hevc`, `png`, `jpeg`, `raw-rgba`.
    pub codec: String,
    /// Properties applied verbatim to the encoder element.
    #[serde(default)]
    pub encoder_params: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ModelAttributeConfig {
    pub name: String,
    /// Internal attributes are consumed inside the pipeline and never emitted.
    #[serde(default)]
    pub internal: bool,
}

/// An inference element whose attributes may appear in the native metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ModelConfig {
    /// Element name, matched against `NativeAttribute::element_name`.
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<ModelAttributeConfig>,
}

const fn default_max_parallel_streams() -> usize {
    DEFAULT_MAX_PARALLEL_STREAMS
}

const fn default_batched_push_timeout_us() -> u64 {
    DEFAULT_BATCHED_PUSH_TIMEOUT_US
}

#[allow(clippy::cast_possible_truncation)]
const fn default_gate_poll_interval_ms() -> u64 {
    DEFAULT_GATE_POLL_INTERVAL.as_millis() as u64
}

#[allow(clippy::cast_possible_truncation)]
const fn default_slot_backoff_ms() -> u64 {
    DEFAULT_SLOT_BACKOFF.as_millis() as u64
}

const fn default_fps_period_frames() -> u64 {
    DEFAULT_FPS_PERIOD_FRAMES
}

/// Configuration of a pipeline engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EngineConfig {
    /// Slot count of the batching stage; upper bound on attached streams.
    #[serde(default = "default_max_parallel_streams")]
    pub max_parallel_streams: usize,
    /// Frames per batch, `1..=1024`.
    pub batch_size: usize,
    /// How long the batching stage waits to fill a batch.
    #[serde(default = "default_batched_push_timeout_us")]
    pub batched_push_timeout_us: u64,
    /// Geometry of frames inside the batching stage.
    pub frame: FrameParameters,
    #[serde(default)]
    pub output_frame: Option<OutputFrameConfig>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    /// Keep downstream end-of-stream events from reaching the pipeline-wide
    /// sink, so a stream ending does not end the whole run.
    #[serde(default = "default_true")]
    pub suppress_eos: bool,
    #[serde(default = "default_gate_poll_interval_ms")]
    pub gate_poll_interval_ms: u64,
    #[serde(default = "default_slot_backoff_ms")]
    pub slot_backoff_ms: u64,
    /// Frames between throughput log lines.
    #[serde(default = "default_fps_period_frames")]
    pub fps_period_frames: u64,
}

const fn default_true() -> bool {
    true
}

impl EngineConfig {
    pub fn new(frame: FrameParameters, batch_size: usize) -> Self {
        Self {
            max_parallel_streams: default_max_parallel_streams(),
            batch_size,
            batched_push_timeout_us: default_batched_push_timeout_us(),
            frame,
            output_frame: None,
            models: Vec::new(),
            suppress_eos: true,
            gate_poll_interval_ms: default_gate_poll_interval_ms(),
            slot_backoff_ms: default_slot_backoff_ms(),
            fps_period_frames: default_fps_period_frames(),
        }
    }

    /// Checks the configuration for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`BatchKitError::Configuration`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_streams == 0 {
            return Err(BatchKitError::Configuration(
                "max_parallel_streams must be greater than zero".to_string(),
            ));
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(BatchKitError::Configuration(format!(
                "batch_size must be within 1..={MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if self.frame.width == 0 || self.frame.height == 0 {
            return Err(BatchKitError::Configuration(format!(
                "frame must have a non-zero size, got {}x{}",
                self.frame.width, self.frame.height
            )));
        }
        if self.gate_poll_interval_ms == 0 || self.slot_backoff_ms == 0 {
            return Err(BatchKitError::Configuration(format!(
                "gate_poll_interval_ms and slot_backoff_ms must be non-zero, got {} and {}",
                self.gate_poll_interval_ms, self.slot_backoff_ms
            )));
        }
        if let Some(output) = &self.output_frame {
            if Codec::from_name(&output.codec).is_none() {
                return Err(BatchKitError::Configuration(format!(
                    "unknown output codec '{}'",
                    output.codec
                )));
            }
        }
        let mut seen = HashSet::new();
        for model in &self.models {
            if !seen.insert(model.name.as_str()) {
                return Err(BatchKitError::Configuration(format!(
                    "model '{}' is declared twice",
                    model.name
                )));
            }
        }
        Ok(())
    }

    /// `(element_name, attribute_name)` pairs that must never be emitted.
    pub fn internal_attributes(&self) -> HashSet<(String, String)> {
        self.models
            .iter()
            .flat_map(|model| {
                model
                    .attributes
                    .iter()
                    .filter(|attr| attr.internal)
                    .map(|attr| (model.name.clone(), attr.name.clone()))
            })
            .collect()
    }

    /// Resolves the configured output into an [`OutputMode`].
    ///
    /// # Errors
    ///
    /// Returns [`BatchKitError::Configuration`] if the codec is unknown.
    pub fn output_mode(&self) -> Result<OutputMode> {
        OutputMode::from_config(self.frame, self.output_frame.as_ref())
    }

    pub const fn gate_poll_interval(&self) -> Duration {
        Duration::from_millis(self.gate_poll_interval_ms)
    }

    pub const fn slot_backoff(&self) -> Duration {
        Duration::from_millis(self.slot_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EngineConfig {
        EngineConfig::new(FrameParameters::new(1280, 720), 4)
    }

    #[test]
    fn test_defaults_from_minimal_json() {
        let cfg: EngineConfig =
            serde_json::from_value(serde_json::json!({
                "batch_size": 1,
                "frame": {"width": 640, "height": 360}
            }))
                .unwrap();
        assert_eq!(cfg.max_parallel_streams, DEFAULT_MAX_PARALLEL_STREAMS);
        assert_eq!(cfg.batch_size, 1);
        assert!(cfg.suppress_eos);
        assert_eq!(cfg.gate_poll_interval(), DEFAULT_GATE_POLL_INTERVAL);
        assert_eq!(cfg.slot_backoff(), DEFAULT_SLOT_BACKOFF);
        assert!(cfg.output_frame.is_none());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_batch_size_is_required() {
        let res: std::result::Result<EngineConfig, _> =
            serde_json::from_value(serde_json::json!({"frame": {"width": 640, "height": 360}}));
        assert!(res.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_batch_size() {
        let mut cfg = config();
        cfg.batch_size = 0;
        assert!(matches!(cfg.validate(), Err(BatchKitError::Configuration(_))));
        cfg.batch_size = MAX_BATCH_SIZE + 1;
        assert!(cfg.validate().is_err());
        cfg.batch_size = MAX_BATCH_SIZE;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_codec() {
        let mut cfg = config();
        cfg.output_frame =
            Some(OutputFrameConfig { codec: "vp9".to_string(), encoder_params: BTreeMap::new() });
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("vp9"));
    }

    #[test]
    fn test_validate_rejects_zero_frame() {
        let cfg = EngineConfig::new(FrameParameters::new(0, 720), 4);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_polling_intervals() {
        let mut cfg = config();
        cfg.slot_backoff_ms = 0;
        assert!(matches!(cfg.validate(), Err(BatchKitError::Configuration(_))));

        let mut cfg = config();
        cfg.gate_poll_interval_ms = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("gate_poll_interval_ms"));

        cfg.gate_poll_interval_ms = 1;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_internal_attributes_collects_only_internal() {
        let mut cfg = config();
        cfg.models = vec![ModelConfig {
            name: "classifier".to_string(),
            attributes: vec![
                ModelAttributeConfig { name: "color".to_string(), internal: false },
                ModelAttributeConfig { name: "embedding".to_string(), internal: true },
            ],
        }];
        let internal = cfg.internal_attributes();
        assert_eq!(internal.len(), 1);
        assert!(internal.contains(&("classifier".to_string(), "embedding".to_string())));
    }
}
