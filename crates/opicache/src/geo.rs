//! Ground-space primitives shared by every stage: axis-aligned extents and
//! north-up geotransforms.

use serde::{Deserialize, Serialize};

/// Axis-aligned ground extent, serialized the way `overviews.json` stores
/// `dataSet.boundingBox`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    /// `[xmin, ymin]`
    #[serde(rename = "LowerCorner")]
    pub lower: [f64; 2],
    /// `[xmax, ymax]`
    #[serde(rename = "UpperCorner")]
    pub upper: [f64; 2],
}

impl BBox {
    #[inline]
    pub fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Self {
        Self {
            lower: [xmin, ymin],
            upper: [xmax, ymax],
        }
    }

    #[inline]
    pub fn xmin(&self) -> f64 {
        self.lower[0]
    }

    #[inline]
    pub fn ymin(&self) -> f64 {
        self.lower[1]
    }

    #[inline]
    pub fn xmax(&self) -> f64 {
        self.upper[0]
    }

    #[inline]
    pub fn ymax(&self) -> f64 {
        self.upper[1]
    }

    /// Bounding box of a set of points; `None` when no point is finite.
    pub fn from_points<'a, I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a [f64; 2]>,
    {
        let (mut xmin, mut ymin) = (f64::INFINITY, f64::INFINITY);
        let (mut xmax, mut ymax) = (f64::NEG_INFINITY, f64::NEG_INFINITY);

        for &[x, y] in points {
            if x.is_finite() && y.is_finite() {
                xmin = xmin.min(x);
                xmax = xmax.max(x);
                ymin = ymin.min(y);
                ymax = ymax.max(y);
            }
        }

        xmin.is_finite().then(|| Self::new(xmin, ymin, xmax, ymax))
    }

    /// Smallest box containing both.
    pub fn union(&self, other: &BBox) -> BBox {
        BBox::new(
            self.xmin().min(other.xmin()),
            self.ymin().min(other.ymin()),
            self.xmax().max(other.xmax()),
            self.ymax().max(other.ymax()),
        )
    }

    pub fn contains(&self, other: &BBox) -> bool {
        self.xmin() <= other.xmin()
            && self.ymin() <= other.ymin()
            && self.xmax() >= other.xmax()
            && self.ymax() >= other.ymax()
    }

    pub fn intersects(&self, other: &BBox) -> bool {
        self.xmin() < other.xmax()
            && other.xmin() < self.xmax()
            && self.ymin() < other.ymax()
            && other.ymin() < self.ymax()
    }
}

/// North-up affine grid: pixel `(col, row)` covers
/// `[origin_x + col*pixel_width, origin_x + (col+1)*pixel_width]` horizontally
/// and descends from `origin_y` by `pixel_height` per row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    /// Positive; rows run southwards.
    pub pixel_height: f64,
}

impl GeoTransform {
    /// Square-pixel grid anchored at an upper-left corner.
    #[inline]
    pub fn north_up(origin_x: f64, origin_y: f64, resolution: f64) -> Self {
        Self {
            origin_x,
            origin_y,
            pixel_width: resolution,
            pixel_height: resolution,
        }
    }

    /// Ground coordinate of the centre of pixel `(col, row)`.
    #[inline]
    pub fn pixel_center(&self, col: u32, row: u32) -> (f64, f64) {
        (
            self.origin_x + (col as f64 + 0.5) * self.pixel_width,
            self.origin_y - (row as f64 + 0.5) * self.pixel_height,
        )
    }

    /// Fractional pixel coordinates of a ground point.
    #[inline]
    pub fn to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.origin_x) / self.pixel_width,
            (self.origin_y - y) / self.pixel_height,
        )
    }

    /// Ground extent of a `width` x `height` raster on this grid.
    pub fn extent(&self, width: u32, height: u32) -> BBox {
        BBox::new(
            self.origin_x,
            self.origin_y - height as f64 * self.pixel_height,
            self.origin_x + width as f64 * self.pixel_width,
            self.origin_y,
        )
    }
}
