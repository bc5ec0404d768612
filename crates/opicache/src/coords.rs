//! Ground coordinates ↔ pyramid tile/slab indices.
//!
//! Index 0 is anchored at the CRS bounding-box corner `(xmin, ymax)`, never at
//! the live data extent. Columns grow eastwards, rows southwards.

use crate::geo::{BBox, GeoTransform};

/// Quotients are rounded to this many decimals before `floor`/`ceil` so that a
/// coordinate lying on a tile boundary up to float noise lands on the
/// boundary itself.
const INDEX_DECIMALS: i32 = 8;

#[inline]
fn round_index(v: f64) -> f64 {
    let scale = 10f64.powi(INDEX_DECIMALS);
    (v * scale).round() / scale
}

/// First index whose cell contains `offset`.
#[inline]
pub fn min_index(offset: f64, span: f64) -> i64 {
    round_index(offset / span).floor() as i64
}

/// Last index whose cell still overlaps an extent ending at `offset`.
#[inline]
pub fn max_index(offset: f64, span: f64) -> i64 {
    round_index(offset / span).ceil() as i64 - 1
}

/// Ground resolution at `level`; `level_max` is native, each step up is twice
/// as coarse.
#[inline]
pub fn level_resolution(base_resolution: f64, level_max: u32, level: u32) -> f64 {
    base_resolution * 2f64.powi(level_max as i32 - level as i32)
}

/// Inclusive column/row range. Signed so that footprints west or north of
/// the origin can be detected instead of wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRange {
    pub min_col: i64,
    pub min_row: i64,
    pub max_col: i64,
    pub max_row: i64,
}

impl IndexRange {
    /// Whether every index is addressable (non-negative and non-inverted).
    pub fn is_addressable(&self) -> bool {
        self.min_col >= 0
            && self.min_row >= 0
            && self.max_col >= self.min_col
            && self.max_row >= self.min_row
    }

    pub fn union(&self, other: &IndexRange) -> IndexRange {
        IndexRange {
            min_col: self.min_col.min(other.min_col),
            min_row: self.min_row.min(other.min_row),
            max_col: self.max_col.max(other.max_col),
            max_row: self.max_row.max(other.max_row),
        }
    }

    /// All `(col, row)` pairs, column-major like the cutting loops.
    pub fn cells(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let (c0, c1) = (self.min_col.max(0), self.max_col);
        let (r0, r1) = (self.min_row.max(0), self.max_row);
        (c0..=c1).flat_map(move |c| (r0..=r1).map(move |r| (c as u32, r as u32)))
    }

    pub fn cell_count(&self) -> u64 {
        if self.max_col < self.min_col || self.max_row < self.min_row {
            return 0;
        }
        ((self.max_col - self.min_col + 1) * (self.max_row - self.min_row + 1)) as u64
    }
}

/// The tiling of one pyramid level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grid {
    pub level: u32,
    pub origin_x: f64,
    pub origin_y: f64,
    pub resolution: f64,
    pub tile_width: u32,
    pub tile_height: u32,
    /// Tiles per slab edge.
    pub slab_width: u32,
    pub slab_height: u32,
}

impl Grid {
    /// Ground width of one tile.
    #[inline]
    pub fn tile_span_x(&self) -> f64 {
        self.resolution * self.tile_width as f64
    }

    #[inline]
    pub fn tile_span_y(&self) -> f64 {
        self.resolution * self.tile_height as f64
    }

    #[inline]
    pub fn slab_span_x(&self) -> f64 {
        self.tile_span_x() * self.slab_width as f64
    }

    #[inline]
    pub fn slab_span_y(&self) -> f64 {
        self.tile_span_y() * self.slab_height as f64
    }

    /// Pixel size of one slab raster.
    #[inline]
    pub fn slab_pixels(&self) -> (u32, u32) {
        (
            self.tile_width * self.slab_width,
            self.tile_height * self.slab_height,
        )
    }

    fn range(&self, bbox: &BBox, span_x: f64, span_y: f64) -> IndexRange {
        IndexRange {
            min_col: min_index(bbox.xmin() - self.origin_x, span_x),
            min_row: min_index(self.origin_y - bbox.ymax(), span_y),
            max_col: max_index(bbox.xmax() - self.origin_x, span_x),
            max_row: max_index(self.origin_y - bbox.ymin(), span_y),
        }
    }

    /// Tiles touched by `bbox`.
    pub fn tile_range(&self, bbox: &BBox) -> IndexRange {
        self.range(bbox, self.tile_span_x(), self.tile_span_y())
    }

    /// Slabs touched by `bbox`.
    pub fn slab_range(&self, bbox: &BBox) -> IndexRange {
        self.range(bbox, self.slab_span_x(), self.slab_span_y())
    }

    /// Tile containing a ground point.
    pub fn tile_of(&self, x: f64, y: f64) -> (i64, i64) {
        (
            min_index(x - self.origin_x, self.tile_span_x()),
            min_index(self.origin_y - y, self.tile_span_y()),
        )
    }

    /// Slab containing a ground point.
    pub fn slab_of(&self, x: f64, y: f64) -> (i64, i64) {
        (
            min_index(x - self.origin_x, self.slab_span_x()),
            min_index(self.origin_y - y, self.slab_span_y()),
        )
    }

    pub fn tile_bbox(&self, col: u32, row: u32) -> BBox {
        let x0 = self.origin_x + col as f64 * self.tile_span_x();
        let y1 = self.origin_y - row as f64 * self.tile_span_y();
        BBox::new(x0, y1 - self.tile_span_y(), x0 + self.tile_span_x(), y1)
    }

    pub fn slab_bbox(&self, col: u32, row: u32) -> BBox {
        let x0 = self.origin_x + col as f64 * self.slab_span_x();
        let y1 = self.origin_y - row as f64 * self.slab_span_y();
        BBox::new(x0, y1 - self.slab_span_y(), x0 + self.slab_span_x(), y1)
    }

    /// Geotransform of the slab raster `(col, row)`.
    pub fn slab_transform(&self, col: u32, row: u32) -> GeoTransform {
        GeoTransform::north_up(
            self.origin_x + col as f64 * self.slab_span_x(),
            self.origin_y - row as f64 * self.slab_span_y(),
            self.resolution,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_l14() -> Grid {
        Grid {
            level: 14,
            origin_x: 0.0,
            origin_y: 12_000_000.0,
            resolution: 0.05,
            tile_width: 256,
            tile_height: 256,
            slab_width: 16,
            slab_height: 16,
        }
    }

    #[test]
    fn resolution_doubles_per_level() {
        assert_eq!(level_resolution(0.05, 14, 14), 0.05);
        assert_eq!(level_resolution(0.05, 14, 13), 0.1);
        assert_eq!(level_resolution(0.05, 14, 10), 0.8);
    }

    #[test]
    fn image_at_origin_maps_to_first_tile_and_slab() {
        let g = grid_l14();
        // 256 px at 0.05 m, upper-left corner on the origin.
        let bbox = BBox::new(0.0, 12_000_000.0 - 12.8, 12.8, 12_000_000.0);

        let tiles = g.tile_range(&bbox);
        assert_eq!(
            tiles,
            IndexRange {
                min_col: 0,
                min_row: 0,
                max_col: 0,
                max_row: 0
            }
        );
        let slabs = g.slab_range(&bbox);
        assert_eq!(slabs, tiles);
    }

    #[test]
    fn boundary_noise_does_not_spill_into_next_tile() {
        let g = grid_l14();
        // 12.8 m computed through large coordinates carries float noise.
        let ymin = 12_000_000.0 - 2.0 * 12.8;
        let bbox = BBox::new(12.8, ymin, 3.0 * 12.8, 12_000_000.0 - 12.8);
        let tiles = g.tile_range(&bbox);
        assert_eq!((tiles.min_col, tiles.max_col), (1, 2));
        assert_eq!((tiles.min_row, tiles.max_row), (1, 1));
    }

    #[test]
    fn point_inside_tile_round_trips() {
        let g = grid_l14();
        for &(col, row) in &[(0u32, 0u32), (3, 7), (1000, 42), (65_535, 1)] {
            let b = g.tile_bbox(col, row);
            let probes = [
                (b.xmin() + 0.001, b.ymax() - 0.001),
                (0.5 * (b.xmin() + b.xmax()), 0.5 * (b.ymin() + b.ymax())),
                (b.xmax() - 0.001, b.ymin() + 0.001),
            ];
            for (x, y) in probes {
                assert_eq!(g.tile_of(x, y), (col as i64, row as i64));
            }
        }
    }

    #[test]
    fn slab_covers_its_tiles() {
        let g = grid_l14();
        let slab = g.slab_bbox(2, 3);
        let tiles = g.tile_range(&slab);
        assert_eq!((tiles.min_col, tiles.max_col), (32, 47));
        assert_eq!((tiles.min_row, tiles.max_row), (48, 63));
        assert_eq!(g.slab_transform(2, 3).extent(4096, 4096), slab);
    }

    #[test]
    fn footprint_west_of_origin_is_not_addressable() {
        let g = grid_l14();
        let bbox = BBox::new(-5.0, 11_999_990.0, 5.0, 11_999_995.0);
        assert!(!g.tile_range(&bbox).is_addressable());
    }

    #[test]
    fn cells_enumerates_inclusive_range() {
        let r = IndexRange {
            min_col: 1,
            min_row: 4,
            max_col: 2,
            max_row: 5,
        };
        let cells: Vec<_> = r.cells().collect();
        assert_eq!(cells, vec![(1, 4), (1, 5), (2, 4), (2, 5)]);
        assert_eq!(r.cell_count(), 4);
    }
}
