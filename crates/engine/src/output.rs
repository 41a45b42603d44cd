// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Output router: what a stream's post-batch chain produces.
//!
//! Every stream gets `queue -> <mode chain> -> sink`. The mode chain is empty
//! for metadata-only output, and otherwise converts the batched frame back to
//! the destination resolution and optionally encodes it.

use crate::chain::ChainBuilder;
use crate::config::OutputFrameConfig;
use crate::constants::{BATCH_MEMORY_CAPS, FAST_CONVERTER, FORMAT_LOCK};
use batchkit_core::{BatchKitError, ElementSpec, Endpoint, FrameParameters, Resolution, Result};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    H264,
    Hevc,
    Png,
    Jpeg,
    RawRgba,
}

impl Codec {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "h264" => Some(Self::H264),
            "hevc" => Some(Self::Hevc),
            "png" => Some(Self::Png),
            "jpeg" => Some(Self::Jpeg),
            "raw-rgba" => Some(Self::RawRgba),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::Hevc => "hevc",
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::RawRgba => "raw-rgba",
        }
    }

    /// Encoder element factory; `None` for uncompressed output.
    pub const fn encoder(self) -> Option<&'static str> {
        match self {
            Self::H264 => Some("nvv4l2h264enc"),
            Self::Hevc => Some("nvv4l2h265enc"),
            Self::Png => Some("pngenc"),
            Self::Jpeg => Some("nvjpegenc"),
            Self::RawRgba => None,
        }
    }

    /// Bitstream parser placed after the encoder. It re-inserts stream
    /// headers on every keyframe.
    pub const fn parser(self) -> Option<&'static str> {
        match self {
            Self::H264 => Some("h264parse"),
            Self::Hevc => Some("h265parse"),
            _ => None,
        }
    }

    pub const fn caps_name(self) -> &'static str {
        match self {
            Self::H264 => "video/x-h264",
            Self::Hevc => "video/x-h265",
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::RawRgba => BATCH_MEMORY_CAPS,
        }
    }

    /// Block size both output dimensions must be a multiple of.
    pub const fn block_size(self) -> Option<u32> {
        match self {
            Self::Png => Some(8),
            _ => None,
        }
    }
}

/// Per-stream output mode.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputMode {
    /// Only metadata records leave the pipeline.
    MetadataOnly,
    /// Uncompressed RGBA frames at the destination resolution.
    RawFrame { frame: FrameParameters },
    /// Frames encoded with `codec`.
    EncodedFrame { frame: FrameParameters, codec: Codec, encoder_params: Map<String, Value> },
}

impl OutputMode {
    /// # Errors
    ///
    /// Returns [`BatchKitError::Configuration`] for an unknown codec name.
    pub fn from_config(frame: FrameParameters, output: Option<&OutputFrameConfig>) -> Result<Self> {
        let Some(output) = output else {
            return Ok(Self::MetadataOnly);
        };
        let codec = Codec::from_name(&output.codec).ok_or_else(|| {
            BatchKitError::Configuration(format!("unknown output codec '{}'", output.codec))
        })?;
        if codec == Codec::RawRgba {
            return Ok(Self::RawFrame { frame });
        }
        let encoder_params =
            output.encoder_params.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Ok(Self::EncodedFrame { frame, codec, encoder_params })
    }

    pub const fn emits_frames(&self) -> bool {
        !matches!(self, Self::MetadataOnly)
    }

    pub const fn codec(&self) -> Option<Codec> {
        match self {
            Self::MetadataOnly => None,
            Self::RawFrame { .. } => Some(Codec::RawRgba),
            Self::EncodedFrame { codec, .. } => Some(*codec),
        }
    }

    /// Resolution the stream's output frames and record coordinates use.
    pub fn compute_dest_resolution(&self, source: Resolution) -> Resolution {
        let frame = match self {
            Self::MetadataOnly => return source,
            Self::RawFrame { frame } | Self::EncodedFrame { frame, .. } => frame,
        };

        let dest = if frame.keeps_padding() {
            Resolution::new(
                scale_dim(source.width, frame.total_width(), frame.width),
                scale_dim(source.height, frame.total_height(), frame.height),
            )
        } else {
            source
        };

        match self.codec().and_then(Codec::block_size) {
            Some(block) => Resolution::new(
                round_to_block(dest.width, block),
                round_to_block(dest.height, block),
            ),
            None => dest,
        }
    }

    /// Appends the mode's elements to `chain` and returns the endpoint the
    /// stream sink links to. Metadata-only output adds nothing and returns
    /// `input` unchanged.
    ///
    /// # Errors
    ///
    /// Propagates element creation and link errors.
    pub fn build_output_chain(
        &self,
        chain: &mut ChainBuilder<'_>,
        dest: Resolution,
        input: Endpoint,
    ) -> Result<Endpoint> {
        let (frame, codec, encoder_params) = match self {
            Self::MetadataOnly => return Ok(input),
            Self::RawFrame { frame } => (frame, Codec::RawRgba, None),
            Self::EncodedFrame { frame, codec, encoder_params } => {
                (frame, *codec, Some(encoder_params))
            },
        };

        let mut converter = ElementSpec::new(FAST_CONVERTER);
        if !frame.keeps_padding() {
            if let Some(crop) = frame.content_crop() {
                converter = converter.property("src-crop", crop);
            }
        }
        let converter = chain.add(&converter)?;
        chain.graph().link(&input, &Endpoint::ElementSink(converter))?;

        if let Some(encoder) = codec.encoder() {
            let mut spec = ElementSpec::new(encoder);
            if let Some(params) = encoder_params {
                spec = spec.properties(params);
            }
            chain.append(&spec)?;
        }
        if let Some(parser) = codec.parser() {
            chain.append(&ElementSpec::new(parser).property("config-interval", -1))?;
        }

        let caps = match codec {
            Codec::RawRgba => format!(
                "{}, format=RGBA, width={}, height={}",
                codec.caps_name(),
                dest.width,
                dest.height
            ),
            _ => format!("{}, width={}, height={}", codec.caps_name(), dest.width, dest.height),
        };
        let lock = chain.append(&ElementSpec::new(FORMAT_LOCK).property("caps", caps))?;
        Ok(Endpoint::ElementSrc(lock))
    }
}

fn scale_dim(value: u32, total: u32, content: u32) -> u32 {
    if content == 0 {
        return value;
    }
    let scaled = u64::from(value) * u64::from(total) / u64::from(content);
    u32::try_from(scaled).unwrap_or(u32::MAX)
}

/// Nearest multiple of `block`, ties to even, never below one block.
fn round_to_block(value: u32, block: u32) -> u32 {
    let blocks = (f64::from(value) / f64::from(block)).round_ties_even();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let blocks = blocks as u32;
    blocks.max(1) * block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryGraph;
    use batchkit_core::{ElementGraph, Padding};
    use std::collections::BTreeMap;

    fn output(codec: &str) -> OutputFrameConfig {
        OutputFrameConfig { codec: codec.to_string(), encoder_params: BTreeMap::new() }
    }

    #[test]
    fn test_metadata_only_keeps_source_resolution() {
        let mode = OutputMode::from_config(FrameParameters::new(640, 360), None).unwrap();
        assert!(!mode.emits_frames());
        assert_eq!(mode.compute_dest_resolution(Resolution::new(101, 202)), Resolution::new(101, 202));
    }

    #[test]
    fn test_png_rounds_to_multiple_of_eight() {
        let mode =
            OutputMode::from_config(FrameParameters::new(640, 360), Some(&output("png"))).unwrap();
        assert_eq!(mode.compute_dest_resolution(Resolution::new(101, 202)), Resolution::new(104, 200));
        // 100 / 8 = 12.5 rounds to even.
        assert_eq!(mode.compute_dest_resolution(Resolution::new(100, 4)), Resolution::new(96, 8));
    }

    #[test]
    fn test_other_codecs_do_not_round() {
        for codec in ["h264", "hevc", "jpeg", "raw-rgba"] {
            let mode = OutputMode::from_config(FrameParameters::new(640, 360), Some(&output(codec)))
                .unwrap();
            assert_eq!(
                mode.compute_dest_resolution(Resolution::new(101, 202)),
                Resolution::new(101, 202),
                "{codec}"
            );
        }
    }

    #[test]
    fn test_kept_padding_scales_destination() {
        let frame = FrameParameters::new(100, 50)
            .with_padding(Padding { left: 10, right: 10, top: 5, bottom: 5, keep: true });
        let mode = OutputMode::from_config(frame, Some(&output("raw-rgba"))).unwrap();
        assert_eq!(mode.compute_dest_resolution(Resolution::new(200, 100)), Resolution::new(240, 120));
    }

    #[test]
    fn test_unknown_codec_is_configuration_error() {
        let err = OutputMode::from_config(FrameParameters::new(1, 1), Some(&output("av1")))
            .unwrap_err();
        assert!(matches!(err, BatchKitError::Configuration(_)));
    }

    #[test]
    fn test_h264_chain_has_converter_encoder_parser_lock() {
        let graph = MemoryGraph::new();
        let mut params = BTreeMap::new();
        params.insert("bitrate".to_string(), serde_json::json!(4_000_000));
        let cfg = OutputFrameConfig { codec: "h264".to_string(), encoder_params: params };
        let frame = FrameParameters::new(640, 360)
            .with_padding(Padding { left: 8, right: 8, top: 0, bottom: 0, keep: false });
        let mode = OutputMode::from_config(frame, Some(&cfg)).unwrap();

        let queue = graph.add(&ElementSpec::new("queue")).unwrap();
        let mut chain = ChainBuilder::new(&graph);
        let out = mode
            .build_output_chain(&mut chain, Resolution::new(1280, 720), Endpoint::ElementSrc(queue))
            .unwrap();
        let elements = chain.finish();

        let factories: Vec<&str> = elements.iter().map(|e| &*e.factory).collect();
        assert_eq!(factories, ["nvvideoconvert", "nvv4l2h264enc", "h264parse", "capsfilter"]);
        assert_eq!(out, Endpoint::ElementSrc(elements[3].clone()));

        let convert = graph.spec_of(&elements[0]).unwrap();
        assert_eq!(convert.properties["src-crop"], "8:0:640:360");
        assert_eq!(graph.spec_of(&elements[1]).unwrap().properties["bitrate"], 4_000_000);
        assert_eq!(graph.spec_of(&elements[2]).unwrap().properties["config-interval"], -1);
        assert_eq!(
            graph.spec_of(&elements[3]).unwrap().properties["caps"],
            "video/x-h264, width=1280, height=720"
        );
    }

    #[test]
    fn test_metadata_only_chain_is_empty() {
        let graph = MemoryGraph::new();
        let mut chain = ChainBuilder::new(&graph);
        let input = Endpoint::SplitOutput(0);
        let out = OutputMode::MetadataOnly
            .build_output_chain(&mut chain, Resolution::new(1, 1), input.clone())
            .unwrap();
        assert_eq!(out, input);
        assert!(chain.finish().is_empty());
    }
}
