//! Cutting one source image into per-slab opi artifacts.

use std::fs;

use log::{debug, trace};

use crate::coords::IndexRange;
use crate::error::Result;
use crate::layout::CacheLayout;
use crate::overviews::Overviews;
use crate::raster::{Raster, RasterFormat};
use crate::slab_path::SlabPath;
use crate::source::SourceImage;
use crate::warp::Resampler;

/// Resamples `image` into every slab of `slabs` at `level` and writes one opi
/// artifact per slab it actually covers. Returns the number written.
///
/// Reads nothing but its arguments and writes only files tagged with the
/// image identifier, so cuts of different images can run concurrently.
pub fn cut(
    image: &SourceImage,
    level: u32,
    slabs: &IndexRange,
    overviews: &Overviews,
    layout: &CacheLayout,
    resampler: &dyn Resampler,
) -> Result<usize> {
    let grid = overviews.grid(level);
    let (width, height) = grid.slab_pixels();
    let bands = image.raster.bands;
    let format = RasterFormat::for_bands(bands);

    let mut written = 0;
    for (x, y) in slabs.cells() {
        let mut slab = Raster::blank(width, height, bands, grid.slab_transform(x, y));
        let covered = resampler.resample(&image.raster, &mut slab);
        if covered == 0 {
            trace!("{}: slab {level}/{x}_{y} not covered", image.id);
            continue;
        }

        let path = SlabPath::encode(x, y, overviews.path_depth);
        let file = layout.opi_file(level, &path, &image.id, format);
        if let Some(dir) = file.parent() {
            fs::create_dir_all(dir)?;
        }
        slab.write(&file, format)?;
        written += 1;
    }

    debug!("{}: {written} opi slab(s) at level {level}", image.id);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::GeoTransform;
    use crate::overviews::tests::small;
    use crate::warp::NearestResampler;

    #[test]
    fn writes_one_artifact_per_covered_slab() {
        let dir = tempfile::tempdir().unwrap();
        let layout = CacheLayout::new(dir.path());
        let ov = small();

        // 12 x 4 m image starting at the origin: slabs are 8 m wide.
        let mut raster = Raster::blank(12, 4, 3, GeoTransform::north_up(0.0, 12_000_000.0, 1.0));
        raster.data.fill(200);
        let image = SourceImage {
            id: "IMG".into(),
            raster,
        };
        let slabs = ov.grid(14).slab_range(&image.footprint());
        assert_eq!((slabs.min_col, slabs.max_col, slabs.max_row), (0, 1, 0));

        let n = cut(&image, 14, &slabs, &ov, &layout, &NearestResampler).unwrap();
        assert_eq!(n, 2);

        let format = RasterFormat::for_bands(3);
        let listed = layout.list_opi(14, &SlabPath::encode(1, 0, 2), format).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "IMG");
    }
}
