// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Core data types shared by every pipeline component.

use crate::error::{BatchKitError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Opaque, stable identifier of an input stream.
///
/// Unique among currently attached streams. Cloning is cheap.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(Arc<str>);

impl StreamId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for StreamId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

/// Frame dimensions in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Padding added around every frame before batching.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Padding {
    #[serde(default)]
    pub left: u32,
    #[serde(default)]
    pub right: u32,
    #[serde(default)]
    pub top: u32,
    #[serde(default)]
    pub bottom: u32,
    /// Keep the padded area in output frames.
    #[serde(default)]
    pub keep: bool,
}

/// Geometry of the frames inside the shared batching stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FrameParameters {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub padding: Option<Padding>,
}

impl FrameParameters {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height, padding: None }
    }

    #[must_use]
    pub const fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = Some(padding);
        self
    }

    /// Width including padding.
    pub const fn total_width(&self) -> u32 {
        match self.padding {
            Some(p) => self.width + p.left + p.right,
            None => self.width,
        }
    }

    /// Height including padding.
    pub const fn total_height(&self) -> u32 {
        match self.padding {
            Some(p) => self.height + p.top + p.bottom,
            None => self.height,
        }
    }

    pub const fn keeps_padding(&self) -> bool {
        matches!(self.padding, Some(Padding { keep: true, .. }))
    }

    /// `left:top:width:height` crop rectangle of the unpadded content, if padded.
    pub fn content_crop(&self) -> Option<String> {
        self.padding.map(|p| format!("{}:{}:{}:{}", p.left, p.top, self.width, self.height))
    }
}

/// A single caps field value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapsValue {
    Int(i64),
    Str(String),
}

impl fmt::Display for CapsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(v) => f.write_str(v),
        }
    }
}

/// Negotiated stream format: a media type plus named fields.
///
/// The textual form is `media/type, key=value, key=value`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoCaps {
    pub media_type: String,
    pub fields: BTreeMap<String, CapsValue>,
}

impl VideoCaps {
    pub fn new(media_type: impl Into<String>) -> Self {
        Self { media_type: media_type.into(), fields: BTreeMap::new() }
    }

    /// Raw video caps with the given geometry.
    pub fn raw(format: &str, width: u32, height: u32) -> Self {
        Self::new("video/x-raw")
            .with_field("format", CapsValue::Str(format.to_string()))
            .with_field("width", CapsValue::Int(i64::from(width)))
            .with_field("height", CapsValue::Int(i64::from(height)))
    }

    #[must_use]
    pub fn with_field(mut self, name: &str, value: CapsValue) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn is_video(&self) -> bool {
        self.media_type.starts_with("video")
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.fields.get(name) {
            Some(CapsValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.fields.get(name) {
            Some(CapsValue::Str(v)) => Some(v),
            _ => None,
        }
    }

    /// Extracts the negotiated width and height.
    ///
    /// # Errors
    ///
    /// Returns [`BatchKitError::Negotiation`] if either field is missing,
    /// not an integer, or out of range.
    pub fn resolution(&self) -> Result<Resolution> {
        let field = |name: &str| -> Result<u32> {
            let value = self.get_int(name).ok_or_else(|| {
                BatchKitError::Negotiation(format!("Failed to parse \"{name}\" of caps \"{self}\""))
            })?;
            u32::try_from(value).ok().filter(|v| *v > 0).ok_or_else(|| {
                BatchKitError::Negotiation(format!("Invalid \"{name}\"={value} in caps \"{self}\""))
            })
        };
        Ok(Resolution::new(field("width")?, field("height")?))
    }
}

impl fmt::Display for VideoCaps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.media_type)?;
        for (name, value) in &self.fields {
            write!(f, ", {name}={value}")?;
        }
        Ok(())
    }
}

impl FromStr for VideoCaps {
    type Err = BatchKitError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(',').map(str::trim);
        let media_type = parts
            .next()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| BatchKitError::Negotiation(format!("Empty caps string \"{s}\"")))?;

        let mut caps = Self::new(media_type);
        for part in parts.filter(|p| !p.is_empty()) {
            let (name, raw) = part.split_once('=').ok_or_else(|| {
                BatchKitError::Negotiation(format!("Malformed caps field \"{part}\" in \"{s}\""))
            })?;
            let raw = raw.trim();
            let value = raw.parse::<i64>().map_or_else(
                |_| CapsValue::Str(raw.to_string()),
                CapsValue::Int,
            );
            caps.fields.insert(name.trim().to_string(), value);
        }
        Ok(caps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_parameters_totals() {
        let frame = FrameParameters::new(1280, 720).with_padding(Padding {
            left: 10,
            right: 20,
            top: 5,
            bottom: 15,
            keep: false,
        });
        assert_eq!(frame.total_width(), 1310);
        assert_eq!(frame.total_height(), 740);
        assert_eq!(frame.content_crop().as_deref(), Some("10:5:1280:720"));
        assert!(!frame.keeps_padding());
        assert_eq!(FrameParameters::new(640, 480).total_width(), 640);
    }

    #[test]
    fn test_caps_parse_and_resolution() {
        let caps: VideoCaps = "video/x-raw, format=NV12, width=1920, height=1080".parse().unwrap();
        assert!(caps.is_video());
        assert_eq!(caps.get_str("format"), Some("NV12"));
        assert_eq!(caps.resolution().unwrap(), Resolution::new(1920, 1080));
    }

    #[test]
    fn test_caps_missing_height_is_negotiation_error() {
        let caps: VideoCaps = "video/x-raw, width=1920".parse().unwrap();
        let err = caps.resolution().unwrap_err();
        assert!(matches!(err, BatchKitError::Negotiation(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_caps_non_video() {
        let caps: VideoCaps = "audio/x-raw, rate=48000".parse().unwrap();
        assert!(!caps.is_video());
    }

    #[test]
    fn test_caps_display_round_trip() {
        let caps = VideoCaps::raw("RGBA", 640, 480);
        assert_eq!(caps.to_string(), "video/x-raw, format=RGBA, height=480, width=640");
    }
}
