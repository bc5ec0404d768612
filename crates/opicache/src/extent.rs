//! Per-image slab boxes, dataset extent accumulation and the change set of
//! slabs a run has to rebuild.

use std::collections::{BTreeMap, BTreeSet};

use crate::coords::IndexRange;
use crate::error::{CacheError, Result};
use crate::geo::BBox;
use crate::overviews::{DataSet, Overviews, SlabLimits, TileLimits};

/// Tile and slab ranges touched by one footprint at one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelBox {
    pub tiles: IndexRange,
    pub slabs: IndexRange,
}

/// Touched ranges for every computed level of a cache.
pub type SlabBox = BTreeMap<u32, LevelBox>;

/// Pure: ranges touched by `footprint` at every computed level.
pub fn slab_box(footprint: &BBox, overviews: &Overviews, image_id: &str) -> Result<SlabBox> {
    let mut out = SlabBox::new();
    for level in overviews.computed_levels().descending() {
        let grid = overviews.grid(level);
        let tiles = grid.tile_range(footprint);
        let slabs = grid.slab_range(footprint);
        if !tiles.is_addressable() || !slabs.is_addressable() {
            return Err(CacheError::OutsideGrid {
                image: image_id.to_owned(),
                level,
            });
        }
        out.insert(level, LevelBox { tiles, slabs });
    }
    Ok(out)
}

/// Grows the dataset extent and per-level limits to cover one more image.
pub fn extend(data_set: &mut DataSet, footprint: &BBox, boxes: &SlabBox) {
    data_set.bounding_box = Some(match data_set.bounding_box {
        Some(prior) => prior.union(footprint),
        None => *footprint,
    });

    for (&level, lb) in boxes {
        let tiles = match data_set.limits.get(&level) {
            Some(prior) => prior.range().union(&lb.tiles),
            None => lb.tiles,
        };
        data_set.limits.insert(level, TileLimits::from(tiles));

        let slabs = match data_set.slab_limits.get(&level) {
            Some(prior) => prior.range().union(&lb.slabs),
            None => lb.slabs,
        };
        data_set.slab_limits.insert(level, SlabLimits::from(slabs));
    }
}

/// Computes the image's slab box, folds it into the dataset extents and marks
/// its slabs dirty.
pub fn accumulate(
    overviews: &mut Overviews,
    footprint: &BBox,
    image_id: &str,
    changes: &mut ChangeSet,
) -> Result<SlabBox> {
    let boxes = slab_box(footprint, overviews, image_id)?;
    extend(&mut overviews.data_set, footprint, &boxes);
    changes.mark_box(&boxes);
    Ok(boxes)
}

/// Level → set of slabs to rebuild. Set semantics: a slab is rebuilt once
/// however many images touched it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    levels: BTreeMap<u32, BTreeSet<(u32, u32)>>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the slab was already marked.
    pub fn mark(&mut self, level: u32, x: u32, y: u32) -> bool {
        self.levels.entry(level).or_default().insert((x, y))
    }

    pub fn mark_range(&mut self, level: u32, slabs: &IndexRange) {
        let set = self.levels.entry(level).or_default();
        set.extend(slabs.cells());
    }

    pub fn mark_box(&mut self, boxes: &SlabBox) {
        for (&level, lb) in boxes {
            self.mark_range(level, &lb.slabs);
        }
    }

    /// Marks the parent of every slab at `level` on each coarser level down to
    /// `min_level`.
    pub fn mark_ancestors(&mut self, level: u32, min_level: u32) {
        let mut current: Vec<(u32, u32)> = self.slabs(level).collect();
        for parent_level in (min_level..level).rev() {
            let parents: BTreeSet<(u32, u32)> =
                current.iter().map(|&(x, y)| (x / 2, y / 2)).collect();
            self.levels
                .entry(parent_level)
                .or_default()
                .extend(parents.iter().copied());
            current = parents.into_iter().collect();
        }
    }

    /// Drops every slab of `level`.
    pub fn remove_level(&mut self, level: u32) {
        self.levels.remove(&level);
    }

    pub fn contains(&self, level: u32, x: u32, y: u32) -> bool {
        self.levels
            .get(&level)
            .map_or(false, |set| set.contains(&(x, y)))
    }

    /// Slabs of one level in `(x, y)` order.
    pub fn slabs(&self, level: u32) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.levels.get(&level).into_iter().flatten().copied()
    }

    /// Dirty levels, finest first.
    pub fn levels_descending(&self) -> impl Iterator<Item = u32> + '_ {
        self.levels
            .iter()
            .rev()
            .filter(|(_, set)| !set.is_empty())
            .map(|(&level, _)| level)
    }

    /// `"{x}_{y}"` keys of one level.
    pub fn keys(&self, level: u32) -> Vec<String> {
        self.slabs(level).map(|(x, y)| format!("{x}_{y}")).collect()
    }

    pub fn len(&self) -> usize {
        self.levels.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overviews::tests::descriptor;

    const Y0: f64 = 12_000_000.0;

    #[test]
    fn image_at_origin_scenario() {
        let mut ov = descriptor();
        ov.init_dataset(None).unwrap();
        let mut changes = ChangeSet::new();
        let fp = BBox::new(0.0, Y0 - 12.8, 12.8, Y0);

        let boxes = accumulate(&mut ov, &fp, "A", &mut changes).unwrap();
        assert_eq!(boxes.len(), 5);

        let l14 = ov.data_set.limits[&14];
        assert_eq!(
            (l14.min_tile_col, l14.min_tile_row, l14.max_tile_col, l14.max_tile_row),
            (0, 0, 0, 0)
        );
        let s14 = ov.data_set.slab_limits[&14];
        assert_eq!(
            (s14.min_slab_col, s14.min_slab_row, s14.max_slab_col, s14.max_slab_row),
            (0, 0, 0, 0)
        );
        assert_eq!(ov.data_set.bounding_box, Some(fp));
        assert_eq!(changes.keys(14), vec!["0_0".to_string()]);
        assert_eq!(changes.len(), 5);
    }

    #[test]
    fn extent_is_monotonic() {
        let mut ov = descriptor();
        ov.init_dataset(None).unwrap();
        let mut changes = ChangeSet::new();
        let footprints = [
            BBox::new(500.0, Y0 - 900.0, 700.0, Y0 - 600.0),
            BBox::new(100.0, Y0 - 300.0, 150.0, Y0 - 250.0),
            BBox::new(550.0, Y0 - 700.0, 560.0, Y0 - 690.0),
            BBox::new(2000.0, Y0 - 2500.0, 2100.0, Y0 - 2400.0),
        ];

        let mut prior: Option<(BBox, TileLimits)> = None;
        for (i, fp) in footprints.iter().enumerate() {
            accumulate(&mut ov, fp, &format!("I{i}"), &mut changes).unwrap();
            let now_bbox = ov.data_set.bounding_box.unwrap();
            let now_limits = ov.data_set.limits[&14];
            assert!(now_bbox.contains(fp));
            if let Some((b, l)) = prior {
                assert!(now_bbox.contains(&b));
                assert!(now_limits.min_tile_col <= l.min_tile_col);
                assert!(now_limits.max_tile_row >= l.max_tile_row);
            }
            prior = Some((now_bbox, now_limits));
        }
    }

    #[test]
    fn outside_grid_is_rejected() {
        let ov = descriptor();
        let fp = BBox::new(-100.0, Y0 - 10.0, -50.0, Y0 - 5.0);
        let err = slab_box(&fp, &ov, "W").unwrap_err();
        assert!(matches!(err, CacheError::OutsideGrid { .. }));
    }

    #[test]
    fn change_set_has_set_semantics() {
        let mut c = ChangeSet::new();
        assert!(c.mark(14, 3, 4));
        assert!(!c.mark(14, 3, 4));
        c.mark_ancestors(14, 12);
        assert!(c.contains(13, 1, 2));
        assert!(c.contains(12, 0, 1));
        assert_eq!(c.levels_descending().collect::<Vec<_>>(), vec![14, 13, 12]);
        assert_eq!(c.len(), 3);

        c.remove_level(14);
        assert_eq!(c.levels_descending().collect::<Vec<_>>(), vec![13, 12]);
    }
}
