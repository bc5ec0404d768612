//! Rebuilding the ortho/graph pair of one finest-level slab from its opi
//! artifacts and the ownership graph.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::Result;
use crate::graph::{normalize_image_id, GraphStore};
use crate::layout::{temp_sibling, CacheLayout};
use crate::mask::Mask;
use crate::overviews::{Overviews, Rgb};
use crate::raster::{Raster, RasterFormat};
use crate::slab_path::SlabPath;

/// What a slab rebuild left on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabOutcome {
    Written,
    /// Nothing claimed a pixel; the slab has no output files.
    Empty,
}

/// Band count and container of ortho/opi rasters in this cache. An empty
/// registry defaults to RGB.
pub fn ortho_layout(overviews: &Overviews) -> (u8, RasterFormat) {
    let bands = overviews.composition().map_or(3, |c| c.bands());
    (bands, RasterFormat::for_bands(bands))
}

/// Writes both rasters to temp files, then renames them into place. A
/// failed write leaves the previous pair untouched. If the second rename
/// fails, the freshly renamed ortho is removed as well, so the slab never
/// holds a mismatched pair. No temp file outlives a failure.
pub(crate) fn commit_pair(
    ortho: &Raster,
    ortho_path: &Path,
    ortho_format: RasterFormat,
    graph: &Raster,
    graph_path: &Path,
) -> Result<()> {
    for path in [ortho_path, graph_path] {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
    }
    let ortho_tmp = temp_sibling(ortho_path);
    let graph_tmp = temp_sibling(graph_path);
    let discard = |paths: &[&Path]| {
        for p in paths {
            let _ = fs::remove_file(p);
        }
    };

    let written = ortho
        .write(&ortho_tmp, ortho_format)
        .and_then(|()| graph.write(&graph_tmp, RasterFormat::GRAPH));
    if let Err(e) = written {
        discard(&[ortho_tmp.as_path(), graph_tmp.as_path()]);
        return Err(e);
    }
    if let Err(e) = fs::rename(&ortho_tmp, ortho_path) {
        discard(&[ortho_tmp.as_path(), graph_tmp.as_path()]);
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&graph_tmp, graph_path) {
        warn!("{}: {e}; dropping the slab pair", graph_path.display());
        discard(&[graph_tmp.as_path(), ortho_path]);
        return Err(e.into());
    }
    Ok(())
}

/// Removes a previously written pair, if any.
pub(crate) fn remove_pair(ortho_path: &Path, graph_path: &Path) -> Result<()> {
    for path in [ortho_path, graph_path] {
        match fs::remove_file(path) {
            Ok(()) => debug!("removed stale {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Composites slab `(x, y)` of `level`.
///
/// Graph features are painted in precedence order, so where masks overlap the
/// later feature wins. Overlaps between ordinary features are logged; a patch
/// feature overriding older ones is expected. Artifacts of unregistered images
/// are skipped. Any read or rasterization failure aborts the slab before
/// anything is written.
pub fn composite(
    level: u32,
    x: u32,
    y: u32,
    overviews: &Overviews,
    layout: &CacheLayout,
    graph: &dyn GraphStore,
) -> Result<SlabOutcome> {
    let grid = overviews.grid(level);
    let (width, height) = grid.slab_pixels();
    let geo = grid.slab_transform(x, y);
    let envelope = grid.slab_bbox(x, y);
    let path = SlabPath::encode(x, y, overviews.path_depth);
    let (bands, format) = ortho_layout(overviews);

    let ortho_path = layout.ortho_file(level, &path, format);
    let graph_path = layout.graph_file(level, &path);

    // normalized id -> (color, artifact, decoded artifact)
    let mut artifacts: HashMap<String, (Rgb, PathBuf, Option<Raster>)> = HashMap::new();
    for (image_id, file) in layout.list_opi(level, &path, format)? {
        let Some(color) = overviews.color_of(&image_id) else {
            warn!("{}: image {image_id} is not registered, skipped", file.display());
            continue;
        };
        artifacts.insert(normalize_image_id(&image_id), (color, file, None));
    }
    if artifacts.is_empty() {
        remove_pair(&ortho_path, &graph_path)?;
        return Ok(SlabOutcome::Empty);
    }

    let mut ortho = Raster::blank(width, height, bands, geo);
    let mut graph_raster = Raster::blank(width, height, 3, geo);
    let mut claimed = Mask::new(width, height);
    let mut overlaps = 0usize;
    let mut contributors = BTreeSet::new();

    for feature in graph.features_in(&envelope)? {
        let owner = normalize_image_id(&feature.owner);
        let Some((color, file, opi)) = artifacts.get_mut(&owner) else {
            continue;
        };
        let mask = Mask::rasterize(&feature.polygons, &geo, width, height);
        if mask.is_empty() {
            continue;
        }

        if opi.is_none() {
            *opi = Some(Raster::read_slab(file.as_path(), geo, bands, (width, height))?);
        }
        let Some(opi) = opi.as_ref() else { continue };
        for row in 0..height {
            for col in 0..width {
                if !mask.get(col, row) {
                    continue;
                }
                let i = (row * width + col) as usize;
                if claimed.data[i] != 0 && !feature.patch {
                    overlaps += 1;
                }
                claimed.data[i] = 1;
                graph_raster.pixel_mut(col, row).copy_from_slice(color.as_slice());
                ortho.pixel_mut(col, row).copy_from_slice(opi.pixel(col, row));
            }
        }
        contributors.insert(owner);
    }

    if overlaps > 0 {
        warn!("slab {level}/{x}_{y}: {overlaps} pixel(s) claimed by more than one image");
    }

    if contributors.is_empty() {
        remove_pair(&ortho_path, &graph_path)?;
        return Ok(SlabOutcome::Empty);
    }

    commit_pair(&ortho, &ortho_path, format, &graph_raster, &graph_path)?;
    debug!("slab {level}/{x}_{y}: {} contributor(s)", contributors.len());
    Ok(SlabOutcome::Written)
}
