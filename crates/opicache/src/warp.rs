//! Resampling of a georeferenced raster onto another grid.

use crate::raster::Raster;

/// Raster-transform seam: fills `target` on its own grid from `source`.
pub trait Resampler: Send + Sync {
    /// Returns the number of target pixels that fell inside the source.
    /// Uncovered pixels are left untouched.
    fn resample(&self, source: &Raster, target: &mut Raster) -> usize;
}

/// Nearest neighbour: each target pixel centre takes the source pixel it
/// lands in.
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestResampler;

/// Source index hit by each target centre along one axis. Both grids are
/// north-up, so columns and rows map independently.
fn axis_lookup(n: u32, src_len: u32, to_src: impl Fn(u32) -> f64) -> Vec<Option<u32>> {
    (0..n)
        .map(|i| {
            let s = to_src(i).floor();
            (s >= 0.0 && s < src_len as f64).then_some(s as u32)
        })
        .collect()
}

impl Resampler for NearestResampler {
    fn resample(&self, source: &Raster, target: &mut Raster) -> usize {
        let bands = source.bands.min(target.bands) as usize;
        let (src, dst) = (source.geo, target.geo);

        let cols = axis_lookup(target.width, source.width, |c| {
            let x = dst.origin_x + (c as f64 + 0.5) * dst.pixel_width;
            (x - src.origin_x) / src.pixel_width
        });
        let rows = axis_lookup(target.height, source.height, |r| {
            let y = dst.origin_y - (r as f64 + 0.5) * dst.pixel_height;
            (src.origin_y - y) / src.pixel_height
        });

        let mut covered = 0;
        for (row, sr) in rows.iter().enumerate() {
            let Some(sr) = *sr else { continue };
            for (col, sc) in cols.iter().enumerate() {
                let Some(sc) = *sc else { continue };
                let from = &source.pixel(sc, sr)[..bands];
                target.pixel_mut(col as u32, row as u32)[..bands].copy_from_slice(from);
                covered += 1;
            }
        }
        covered
    }
}
