//! Local ownership edits applied straight to the finest-level rasters.
//!
//! A patch hands the area covered by its polygons to one registered image:
//! the graph takes the image's color there and the ortho takes the image's
//! opi pixels. The orchestrator also records the patch in the graph store, so
//! a later recomposite of the slab gives the same result.

use std::io;

use log::debug;

use crate::compositor::{commit_pair, ortho_layout};
use crate::coords::IndexRange;
use crate::error::{CacheError, Result};
use crate::geo::BBox;
use crate::graph::{normalize_image_id, GraphFeature, Polygon};
use crate::layout::CacheLayout;
use crate::mask::Mask;
use crate::overviews::{Overviews, Rgb};
use crate::raster::Raster;
use crate::slab_path::SlabPath;

#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    /// Owner as given in the patch; resolved against the registry when
    /// applied.
    pub image_id: String,
    pub polygons: Vec<Polygon>,
}

impl Patch {
    /// Every polygon of `features` goes to the owner of the first feature.
    pub fn from_features(features: Vec<GraphFeature>) -> Result<Self> {
        let image_id = features
            .first()
            .map(|f| f.owner.clone())
            .ok_or_else(|| CacheError::Config("patch has no polygon feature".into()))?;
        let polygons = features.into_iter().flat_map(|f| f.polygons).collect();
        Ok(Self { image_id, polygons })
    }

    pub fn bbox(&self) -> Option<BBox> {
        BBox::from_points(self.polygons.iter().flatten().flatten())
    }
}

/// Registered identifier and color for the patch owner.
pub fn resolve_owner(patch: &Patch, overviews: &Overviews) -> Result<(String, Rgb)> {
    if let Some(color) = overviews.color_of(&patch.image_id) {
        return Ok((patch.image_id.clone(), color));
    }
    let key = normalize_image_id(&patch.image_id);
    overviews
        .list_opi
        .iter()
        .find(|(id, _)| normalize_image_id(id) == key)
        .map(|(id, e)| (id.clone(), e.color))
        .ok_or_else(|| CacheError::UnknownImage(patch.image_id.clone()))
}

/// Finest-level slabs the patch may touch.
pub fn patch_slabs(patch: &Patch, overviews: &Overviews) -> Option<IndexRange> {
    let bbox = patch.bbox()?;
    let range = overviews.grid(overviews.finest_level()).slab_range(&bbox);
    let clipped = IndexRange {
        min_col: range.min_col.max(0),
        min_row: range.min_row.max(0),
        ..range
    };
    (clipped.cell_count() > 0).then_some(clipped)
}

/// Applies the patch to one finest-level slab. Returns `false` when the patch
/// claims no pixel of it.
pub fn patch_slab(
    patch: &Patch,
    owner: (&str, Rgb),
    x: u32,
    y: u32,
    overviews: &Overviews,
    layout: &CacheLayout,
) -> Result<bool> {
    let level = overviews.finest_level();
    let grid = overviews.grid(level);
    let (width, height) = grid.slab_pixels();
    let geo = grid.slab_transform(x, y);

    let mask = Mask::rasterize(&patch.polygons, &geo, width, height);
    if mask.is_empty() {
        return Ok(false);
    }

    let (image_id, color) = owner;
    let (bands, format) = ortho_layout(overviews);
    let path = SlabPath::encode(x, y, overviews.path_depth);
    let opi_path = layout.opi_file(level, &path, image_id, format);
    if !opi_path.is_file() {
        return Err(CacheError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{image_id} has no opi artifact {}", opi_path.display()),
        )));
    }
    let size = (width, height);
    let opi = Raster::read_slab(&opi_path, geo, bands, size)?;

    let ortho_path = layout.ortho_file(level, &path, format);
    let graph_path = layout.graph_file(level, &path);
    let (mut ortho, mut graph) = if graph_path.is_file() {
        (
            Raster::read_slab(&ortho_path, geo, bands, size)?,
            Raster::read_slab(&graph_path, geo, 3, size)?,
        )
    } else {
        (
            Raster::blank(width, height, bands, geo),
            Raster::blank(width, height, 3, geo),
        )
    };

    for row in 0..height {
        for col in 0..width {
            if mask.get(col, row) {
                graph.pixel_mut(col, row).copy_from_slice(&color);
                ortho.pixel_mut(col, row).copy_from_slice(opi.pixel(col, row));
            }
        }
    }

    commit_pair(&ortho, &ortho_path, format, &graph, &graph_path)?;
    debug!("slab {level}/{x}_{y}: patched {} px for {image_id}", mask.count());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::composite;
    use crate::compositor::tests::{feature, rect, two_image_cache, A, B, Y0};
    use crate::geo::GeoTransform;
    use crate::raster::RasterFormat;

    #[test]
    fn owner_resolution_uses_normalized_ids() {
        let (_dir, _layout, ov, _) = two_image_cache();
        let patch = Patch::from_features(vec![feature("OPI_B", rect(0.0, 0.0, 1.0, 1.0))]).unwrap();
        assert_eq!(resolve_owner(&patch, &ov).unwrap(), ("B".to_string(), B));

        let unknown = Patch::from_features(vec![feature("Q", rect(0.0, 0.0, 1.0, 1.0))]).unwrap();
        assert!(matches!(resolve_owner(&unknown, &ov), Err(CacheError::UnknownImage(_))));
        assert!(Patch::from_features(Vec::new()).is_err());
    }

    #[test]
    fn patch_reassigns_masked_pixels_only() {
        let (_dir, layout, ov, graph) = two_image_cache();
        composite(14, 0, 0, &ov, &layout, &graph).unwrap();

        // Hand the top-left 2 x 2 px of A's half to B.
        let patch = Patch::from_features(vec![feature("B", rect(0.0, Y0 - 2.0, 2.0, Y0))]).unwrap();
        let slabs = patch_slabs(&patch, &ov).unwrap();
        assert_eq!(slabs.cell_count(), 1);
        assert!(patch_slab(&patch, ("B", B), 0, 0, &ov, &layout).unwrap());

        let path = SlabPath::encode(0, 0, ov.path_depth);
        let g = Raster::read_bands(
            &layout.graph_file(14, &path),
            GeoTransform::north_up(0.0, Y0, 1.0),
            3,
        )
        .unwrap();
        assert_eq!(g.pixel(0, 0), &B);
        assert_eq!(g.pixel(1, 1), &B);
        assert_eq!(g.pixel(2, 2), &A);
        assert_eq!(g.pixel(7, 0), &B);
    }

    #[test]
    fn patch_without_opi_fails_the_slab() {
        let (_dir, layout, ov, _) = two_image_cache();
        // Slab (1, 0) has no artifact for B.
        let patch = Patch::from_features(vec![feature("B", rect(9.0, Y0 - 2.0, 10.0, Y0))]).unwrap();
        assert!(patch_slab(&patch, ("B", B), 1, 0, &ov, &layout).is_err());
        // Slab (0, 0) is not touched by it.
        assert!(!patch_slab(&patch, ("B", B), 0, 0, &ov, &layout).unwrap());
    }

    #[test]
    fn mis_sized_graph_raster_fails_the_slab() {
        let (_dir, layout, ov, graph) = two_image_cache();
        composite(14, 0, 0, &ov, &layout, &graph).unwrap();
        let path = SlabPath::encode(0, 0, ov.path_depth);
        let graph_path = layout.graph_file(14, &path);
        let geo = GeoTransform::north_up(0.0, Y0, 1.0);
        Raster::blank(2, 2, 3, geo).write(&graph_path, RasterFormat::GRAPH).unwrap();
        let before = std::fs::read(&graph_path).unwrap();

        let patch = Patch::from_features(vec![feature("B", rect(0.0, Y0 - 2.0, 2.0, Y0))]).unwrap();
        let err = patch_slab(&patch, ("B", B), 0, 0, &ov, &layout).unwrap_err();
        assert!(matches!(err, CacheError::Georef { .. }));
        assert_eq!(std::fs::read(&graph_path).unwrap(), before);
    }
}
