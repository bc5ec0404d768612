//! Coarser levels, built from the four child slabs one level finer.
//!
//! Parent slab `(L, x, y)` covers children `(L+1, 2x+dx, 2y+dy)`; each parent
//! pixel covers a 2×2 block of child pixels.

use log::debug;

use crate::colors::BACKGROUND;
use crate::compositor::{commit_pair, ortho_layout, remove_pair, SlabOutcome};
use crate::error::Result;
use crate::layout::CacheLayout;
use crate::overviews::Overviews;
use crate::raster::Raster;
use crate::slab_path::SlabPath;

/// Graph value of a 2×2 block: the first owned child pixel in row-major order.
/// Ortho value: rounded mean over the owned child pixels. `None` when no
/// child pixel is owned.
fn reduce_block(graph: &Raster, ortho: &Raster, col: u32, row: u32, out: &mut [u8]) -> Option<[u8; 3]> {
    let mut owner = None;
    let mut sums = [0u32; 4];
    let mut owned = 0u32;

    for (dc, dr) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
        let (c, r) = (col + dc, row + dr);
        let g = graph.pixel(c, r);
        if g == BACKGROUND {
            continue;
        }
        owner.get_or_insert([g[0], g[1], g[2]]);
        for (sum, &v) in sums.iter_mut().zip(ortho.pixel(c, r)) {
            *sum += v as u32;
        }
        owned += 1;
    }

    if owned > 0 {
        for (o, sum) in out.iter_mut().zip(sums) {
            *o = ((sum + owned / 2) / owned) as u8;
        }
    }
    owner
}

/// Rebuilds slab `(x, y)` of `level` from level `level + 1`.
pub fn coarsen(level: u32, x: u32, y: u32, overviews: &Overviews, layout: &CacheLayout) -> Result<SlabOutcome> {
    let grid = overviews.grid(level);
    let child_grid = overviews.grid(level + 1);
    let (width, height) = grid.slab_pixels();
    let (half_w, half_h) = (width / 2, height / 2);
    let (bands, format) = ortho_layout(overviews);
    let geo = grid.slab_transform(x, y);

    let path = SlabPath::encode(x, y, overviews.path_depth);
    let ortho_path = layout.ortho_file(level, &path, format);
    let graph_path = layout.graph_file(level, &path);

    let mut ortho = Raster::blank(width, height, bands, geo);
    let mut graph = Raster::blank(width, height, 3, geo);
    let mut children = 0;

    for (dx, dy) in [(0u32, 0u32), (1, 0), (0, 1), (1, 1)] {
        let (cx, cy) = (2 * x + dx, 2 * y + dy);
        let child_path = SlabPath::encode(cx, cy, overviews.path_depth);
        let child_graph_path = layout.graph_file(level + 1, &child_path);
        if !child_graph_path.is_file() {
            continue;
        }
        let child_geo = child_grid.slab_transform(cx, cy);
        let child_size = child_grid.slab_pixels();
        let child_graph = Raster::read_slab(&child_graph_path, child_geo, 3, child_size)?;
        let child_ortho = Raster::read_slab(
            &layout.ortho_file(level + 1, &child_path, format),
            child_geo,
            bands,
            child_size,
        )?;

        for row in 0..half_h {
            for col in 0..half_w {
                let (pc, pr) = (dx * half_w + col, dy * half_h + row);
                let out = ortho.pixel_mut(pc, pr);
                if let Some(color) = reduce_block(&child_graph, &child_ortho, 2 * col, 2 * row, out) {
                    graph.pixel_mut(pc, pr).copy_from_slice(&color);
                }
            }
        }
        children += 1;
    }

    if children == 0 {
        remove_pair(&ortho_path, &graph_path)?;
        return Ok(SlabOutcome::Empty);
    }

    commit_pair(&ortho, &ortho_path, format, &graph, &graph_path)?;
    debug!("slab {level}/{x}_{y}: coarsened from {children} child slab(s)");
    Ok(SlabOutcome::Written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::composite;
    use crate::compositor::tests::{two_image_cache, A, B, Y0};
    use crate::geo::GeoTransform;
    use crate::raster::RasterFormat;

    #[test]
    fn block_reduction_prefers_first_owned_pixel() {
        let gt = GeoTransform::north_up(0.0, 2.0, 1.0);
        let mut graph = Raster::blank(2, 2, 3, gt);
        let mut ortho = Raster::blank(2, 2, 1, gt);
        // Top-left unowned, top-right B, bottom row A.
        graph.pixel_mut(1, 0).copy_from_slice(&B);
        graph.pixel_mut(0, 1).copy_from_slice(&A);
        graph.pixel_mut(1, 1).copy_from_slice(&A);
        ortho.data = vec![255, 10, 20, 31];

        let mut out = [0u8];
        assert_eq!(reduce_block(&graph, &ortho, 0, 0, &mut out), Some(B));
        assert_eq!(out, [20]);

        let empty = Raster::blank(2, 2, 3, gt);
        let mut out = [7u8];
        assert_eq!(reduce_block(&empty, &ortho, 0, 0, &mut out), None);
        assert_eq!(out, [7]);
    }

    #[test]
    fn parent_of_composited_slab() {
        let (_dir, layout, ov, graph) = two_image_cache();
        composite(14, 0, 0, &ov, &layout, &graph).unwrap();

        assert_eq!(coarsen(13, 0, 0, &ov, &layout).unwrap(), SlabOutcome::Written);
        let path = SlabPath::encode(0, 0, ov.path_depth);
        let g = Raster::read_bands(
            &layout.graph_file(13, &path),
            GeoTransform::north_up(0.0, Y0, 2.0),
            3,
        )
        .unwrap();
        // The child fills the parent's upper-left quadrant (4 x 4 px).
        assert_eq!(g.pixel(0, 0), &A);
        assert_eq!(g.pixel(3, 3), &B);
        assert_eq!(g.pixel(4, 0), &[0, 0, 0]);
        assert_eq!(g.pixel(0, 4), &[0, 0, 0]);

        // No child anywhere under slab (5, 5).
        assert_eq!(coarsen(13, 5, 5, &ov, &layout).unwrap(), SlabOutcome::Empty);
    }

    #[test]
    fn mis_sized_child_fails_the_slab() {
        let (_dir, layout, ov, _) = two_image_cache();
        let path = SlabPath::encode(0, 0, ov.path_depth);
        let (_, format) = ortho_layout(&ov);
        let gt = GeoTransform::north_up(0.0, Y0, 1.0);
        let graph_file = layout.graph_file(14, &path);
        std::fs::create_dir_all(graph_file.parent().unwrap()).unwrap();
        std::fs::create_dir_all(layout.ortho_file(14, &path, format).parent().unwrap()).unwrap();
        Raster::blank(2, 2, 3, gt).write(&graph_file, RasterFormat::GRAPH).unwrap();
        Raster::blank(2, 2, 3, gt)
            .write(&layout.ortho_file(14, &path, format), format)
            .unwrap();

        let err = coarsen(13, 0, 0, &ov, &layout).unwrap_err();
        assert!(matches!(err, crate::error::CacheError::Georef { .. }));
        assert!(!layout.graph_file(13, &path).exists());
    }
}
