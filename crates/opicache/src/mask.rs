//! Binary ownership masks rasterized from graph polygons.

use crate::geo::GeoTransform;
use crate::graph::Polygon;

/// One byte per pixel, `1` where the pixel is claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Mask {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize],
        }
    }

    /// Even-odd fill of `polygons` on the grid `geo`, sampled at pixel
    /// centres.
    ///
    /// Spans are half-open (`[enter, exit)` in x, `[ymin, ymax)` in y), so two
    /// polygons sharing an edge never claim the same pixel.
    pub fn rasterize(polygons: &[Polygon], geo: &GeoTransform, width: u32, height: u32) -> Self {
        let mut mask = Mask::new(width, height);
        let mut crossings: Vec<f64> = Vec::new();

        for polygon in polygons {
            for row in 0..height {
                let y = geo.origin_y - (row as f64 + 0.5) * geo.pixel_height;

                crossings.clear();
                for ring in polygon {
                    let n = ring.len();
                    if n < 3 {
                        continue;
                    }
                    let mut j = n - 1;
                    for i in 0..n {
                        let [xi, yi] = ring[i];
                        let [xj, yj] = ring[j];
                        if (yi > y) != (yj > y) {
                            let x = xi + (y - yi) * (xj - xi) / (yj - yi);
                            crossings.push((x - geo.origin_x) / geo.pixel_width);
                        }
                        j = i;
                    }
                }
                if crossings.len() < 2 {
                    continue;
                }
                crossings.sort_by(f64::total_cmp);

                for span in crossings.chunks_exact(2) {
                    mask.fill_span(row, span[0], span[1]);
                }
            }
        }
        mask
    }

    /// Claims the pixels of `row` whose centre lies in `[enter, exit)`
    /// (fractional pixel coordinates).
    fn fill_span(&mut self, row: u32, enter: f64, exit: f64) {
        let first = (enter - 0.5).ceil().max(0.0);
        let end = (exit - 0.5).ceil().min(self.width as f64);
        if end <= first {
            return;
        }
        let base = row as usize * self.width as usize;
        self.data[base + first as usize..base + end as usize].fill(1);
    }

    #[inline]
    pub fn get(&self, col: u32, row: u32) -> bool {
        self.data[row as usize * self.width as usize + col as usize] != 0
    }

    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&v| v != 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|&v| v == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Polygon {
        vec![vec![
            [xmin, ymin],
            [xmax, ymin],
            [xmax, ymax],
            [xmin, ymax],
            [xmin, ymin],
        ]]
    }

    fn grid() -> GeoTransform {
        GeoTransform::north_up(0.0, 8.0, 1.0)
    }

    #[test]
    fn rectangle_fills_exactly() {
        let m = Mask::rasterize(&[rect(2.0, 3.0, 5.0, 6.0)], &grid(), 8, 8);
        assert_eq!(m.count(), 9);
        // Rows 2..=4 have centres 5.5, 4.5 and 3.5.
        assert!(m.get(2, 2) && m.get(4, 4));
        assert!(!m.get(5, 2) && !m.get(2, 5) && !m.get(1, 3));
    }

    #[test]
    fn shared_edges_split_pixels() {
        let left = Mask::rasterize(&[rect(0.0, 0.0, 3.5, 8.0)], &grid(), 8, 8);
        let right = Mask::rasterize(&[rect(3.5, 0.0, 8.0, 8.0)], &grid(), 8, 8);
        assert_eq!(left.count() + right.count(), 64);
        assert!(left.data.iter().zip(&right.data).all(|(a, b)| a ^ b == 1));

        let top = Mask::rasterize(&[rect(0.0, 4.5, 8.0, 8.0)], &grid(), 8, 8);
        let bottom = Mask::rasterize(&[rect(0.0, 0.0, 8.0, 4.5)], &grid(), 8, 8);
        assert_eq!(top.count() + bottom.count(), 64);
    }

    #[test]
    fn holes_are_left_open() {
        let mut poly = rect(0.0, 0.0, 8.0, 8.0);
        poly.extend(rect(2.0, 2.0, 6.0, 6.0));
        let m = Mask::rasterize(&[poly], &grid(), 8, 8);
        assert_eq!(m.count(), 64 - 16);
        assert!(!m.get(3, 3));
    }

    #[test]
    fn polygon_outside_grid_is_empty() {
        let m = Mask::rasterize(&[rect(20.0, 20.0, 30.0, 30.0)], &grid(), 8, 8);
        assert!(m.is_empty());
        let clipped = Mask::rasterize(&[rect(-5.0, -5.0, 1.0, 100.0)], &grid(), 8, 8);
        assert_eq!(clipped.count(), 8);
    }
}
