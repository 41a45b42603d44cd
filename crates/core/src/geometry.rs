// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Bounding box geometry.
//!
//! Boxes are center-based. An axis-aligned [`BBox`] and a rotated [`RBBox`]
//! form the closed set wrapped by [`BoundingBox`].

use serde::{Deserialize, Serialize};

/// Regular (axis-aligned) bounding box.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x_center: f64,
    pub y_center: f64,
    pub width: f64,
    pub height: f64,
}

impl BBox {
    pub const fn new(x_center: f64, y_center: f64, width: f64, height: f64) -> Self {
        Self { x_center, y_center, width, height }
    }

    /// Builds a box from its top-left corner and size.
    pub fn from_ltwh(left: f64, top: f64, width: f64, height: f64) -> Self {
        Self::new(left + 0.5 * width, top + 0.5 * height, width, height)
    }

    pub fn top(&self) -> f64 {
        0.5f64.mul_add(-self.height, self.y_center)
    }

    pub fn left(&self) -> f64 {
        0.5f64.mul_add(-self.width, self.x_center)
    }

    pub fn bottom(&self) -> f64 {
        0.5f64.mul_add(self.height, self.y_center)
    }

    pub fn right(&self) -> f64 {
        0.5f64.mul_add(self.width, self.x_center)
    }

    /// `[x_min, y_min, x_max, y_max]` representation.
    pub fn tlbr(&self) -> (f64, f64, f64, f64) {
        (self.left(), self.top(), self.right(), self.bottom())
    }

    pub fn scale(&mut self, scale_x: f64, scale_y: f64) {
        self.x_center *= scale_x;
        self.y_center *= scale_y;
        self.width *= scale_x;
        self.height *= scale_y;
    }
}

/// Rotated bounding box. `angle` is in degrees around the center point.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RBBox {
    pub x_center: f64,
    pub y_center: f64,
    pub width: f64,
    pub height: f64,
    pub angle: f64,
}

impl RBBox {
    pub const fn new(x_center: f64, y_center: f64, width: f64, height: f64, angle: f64) -> Self {
        Self { x_center, y_center, width, height, angle }
    }

    /// Scales the box along the image axes.
    ///
    /// Non-uniform scaling shears a rotated rectangle; the side vectors are
    /// scaled independently and the angle follows the width side.
    pub fn scale(&mut self, scale_x: f64, scale_y: f64) {
        self.x_center *= scale_x;
        self.y_center *= scale_y;

        #[allow(clippy::float_cmp)]
        if scale_x == scale_y {
            self.width *= scale_x;
            self.height *= scale_y;
            return;
        }

        let (sin, cos) = self.angle.to_radians().sin_cos();
        let (wx, wy) = (self.width * cos * scale_x, self.width * sin * scale_y);
        let (hx, hy) = (-self.height * sin * scale_x, self.height * cos * scale_y);

        self.width = wx.hypot(wy);
        self.height = hx.hypot(hy);
        self.angle = wy.atan2(wx).to_degrees();
    }
}

/// Either kind of bounding box.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BoundingBox {
    Aligned(BBox),
    Rotated(RBBox),
}

impl BoundingBox {
    pub const fn center(&self) -> (f64, f64) {
        match self {
            Self::Aligned(b) => (b.x_center, b.y_center),
            Self::Rotated(b) => (b.x_center, b.y_center),
        }
    }

    pub const fn size(&self) -> (f64, f64) {
        match self {
            Self::Aligned(b) => (b.width, b.height),
            Self::Rotated(b) => (b.width, b.height),
        }
    }

    pub const fn angle(&self) -> Option<f64> {
        match self {
            Self::Aligned(_) => None,
            Self::Rotated(b) => Some(b.angle),
        }
    }

    pub fn translate(&mut self, dx: f64, dy: f64) {
        match self {
            Self::Aligned(b) => {
                b.x_center += dx;
                b.y_center += dy;
            },
            Self::Rotated(b) => {
                b.x_center += dx;
                b.y_center += dy;
            },
        }
    }

    pub fn scale(&mut self, scale_x: f64, scale_y: f64) {
        match self {
            Self::Aligned(b) => b.scale(scale_x, scale_y),
            Self::Rotated(b) => b.scale(scale_x, scale_y),
        }
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_bbox_edges() {
        let bbox = BBox::from_ltwh(10.0, 20.0, 100.0, 50.0);
        assert_eq!(bbox.x_center, 60.0);
        assert_eq!(bbox.y_center, 45.0);
        assert_eq!(bbox.tlbr(), (10.0, 20.0, 110.0, 70.0));
    }

    #[test]
    fn test_bbox_scale() {
        let mut bbox = BBox::new(50.0, 50.0, 20.0, 10.0);
        bbox.scale(2.0, 0.5);
        assert_eq!(bbox, BBox::new(100.0, 25.0, 40.0, 5.0));
    }

    #[test]
    fn test_rbbox_uniform_scale_keeps_angle() {
        let mut rbbox = RBBox::new(10.0, 10.0, 4.0, 2.0, 30.0);
        rbbox.scale(2.0, 2.0);
        assert_eq!(rbbox, RBBox::new(20.0, 20.0, 8.0, 4.0, 30.0));
    }

    #[test]
    fn test_rbbox_axis_aligned_non_uniform_scale() {
        let mut rbbox = RBBox::new(10.0, 10.0, 4.0, 2.0, 0.0);
        rbbox.scale(2.0, 3.0);
        assert!(approx(rbbox.width, 8.0));
        assert!(approx(rbbox.height, 6.0));
        assert!(approx(rbbox.angle, 0.0));
    }

    #[test]
    fn test_rbbox_right_angle_non_uniform_scale() {
        let mut rbbox = RBBox::new(0.0, 0.0, 4.0, 2.0, 90.0);
        rbbox.scale(2.0, 3.0);
        // Width side points along y, height side along x.
        assert!(approx(rbbox.width, 12.0));
        assert!(approx(rbbox.height, 4.0));
        assert!(approx(rbbox.angle, 90.0));
    }

    #[test]
    fn test_bounding_box_translate() {
        let mut bbox = BoundingBox::Aligned(BBox::new(5.0, 5.0, 2.0, 2.0));
        bbox.translate(-5.0, 1.0);
        assert_eq!(bbox.center(), (0.0, 6.0));
        assert_eq!(bbox.angle(), None);
    }
}
