//! Which image owns the mosaic at a ground point.

use std::fmt;

use crate::colors::{ColorRegistry, BACKGROUND};
use crate::error::Result;
use crate::layout::CacheLayout;
use crate::overviews::{Overviews, Rgb};
use crate::raster::Raster;
use crate::slab_path::SlabPath;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identification {
    /// No graph raster at this point.
    OutOfBounds,
    /// Graph raster present, pixel unowned.
    OutOfGraph,
    /// Pixel color absent from the registry.
    UnknownColor(Rgb),
    Image { id: String, color: Rgb },
}

impl fmt::Display for Identification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identification::OutOfBounds => f.write_str("out of bounds"),
            Identification::OutOfGraph => f.write_str("out of graph"),
            Identification::UnknownColor([r, g, b]) => write!(f, "not found (color {r},{g},{b})"),
            Identification::Image { id, color: [r, g, b] } => {
                write!(f, "{id} (color {r},{g},{b})")
            }
        }
    }
}

/// Reads the finest-level graph pixel under `(x, y)`.
pub fn identify(
    x: f64,
    y: f64,
    overviews: &Overviews,
    colors: &ColorRegistry,
    layout: &CacheLayout,
) -> Result<Identification> {
    let level = overviews.finest_level();
    let grid = overviews.grid(level);
    let (sx, sy) = grid.slab_of(x, y);
    let (Ok(sx), Ok(sy)) = (u32::try_from(sx), u32::try_from(sy)) else {
        return Ok(Identification::OutOfBounds);
    };

    let graph_path = layout.graph_file(level, &SlabPath::encode(sx, sy, overviews.path_depth));
    if !graph_path.is_file() {
        return Ok(Identification::OutOfBounds);
    }

    let graph = Raster::read_bands(&graph_path, grid.slab_transform(sx, sy), 3)?;
    let (px, py) = graph.geo.to_pixel(x, y);
    let (col, row) = (px.floor(), py.floor());
    if col < 0.0 || row < 0.0 || col >= graph.width as f64 || row >= graph.height as f64 {
        return Ok(Identification::OutOfBounds);
    }

    let p = graph.pixel(col as u32, row as u32);
    let color: Rgb = [p[0], p[1], p[2]];
    if color == BACKGROUND {
        return Ok(Identification::OutOfGraph);
    }
    Ok(match colors.owner(color) {
        Some(id) => Identification::Image {
            id: id.to_owned(),
            color,
        },
        None => Identification::UnknownColor(color),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::composite;
    use crate::compositor::tests::{two_image_cache, A, B, Y0};

    #[test]
    fn reports_owner_background_and_bounds() {
        let (_dir, layout, ov, graph) = two_image_cache();
        composite(14, 0, 0, &ov, &layout, &graph).unwrap();
        let mut colors = ColorRegistry::new();
        colors.insert(A, "A");

        assert_eq!(
            identify(1.5, Y0 - 1.5, &ov, &colors, &layout).unwrap(),
            Identification::Image {
                id: "A".into(),
                color: A
            }
        );
        assert_eq!(
            identify(6.5, Y0 - 6.5, &ov, &colors, &layout).unwrap(),
            Identification::UnknownColor(B)
        );
        assert_eq!(
            identify(20.0, Y0 - 1.0, &ov, &colors, &layout).unwrap(),
            Identification::OutOfBounds
        );
        assert_eq!(
            identify(-1.0, Y0 - 1.0, &ov, &colors, &layout).unwrap(),
            Identification::OutOfBounds
        );
        assert_eq!(Identification::OutOfGraph.to_string(), "out of graph");
    }
}
