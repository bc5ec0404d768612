//! `overviews.json`: the pyramid descriptor, the running dataset extents and
//! the image registry (`list_OPI`).
//!
//! A pyramid descriptor is the same document without `dataSet`/`list_OPI`;
//! create mode fills those in. Keys this crate does not know about (WMTS
//! identifiers, titles, ...) are carried through untouched.

use std::collections::BTreeMap;

use serde::de::{self, IgnoredAny};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::coords::{level_resolution, Grid, IndexRange};
use crate::error::{CacheError, Result};
use crate::geo::BBox;

/// One graph-raster pixel value.
pub type Rgb = [u8; 3];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelRange {
    pub min: u32,
    pub max: u32,
}

impl LevelRange {
    #[inline]
    pub fn contains(&self, level: u32) -> bool {
        self.min <= level && level <= self.max
    }

    /// Finest first.
    pub fn descending(&self) -> impl Iterator<Item = u32> {
        (self.min..=self.max).rev()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CrsBounds {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Crs {
    pub code: u32,
    pub bounding_box: CrsBounds,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Tile index bounds of one level, as stored in `dataSet.limits`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TileLimits {
    pub min_tile_col: i64,
    pub min_tile_row: i64,
    pub max_tile_col: i64,
    pub max_tile_row: i64,
}

impl From<IndexRange> for TileLimits {
    fn from(r: IndexRange) -> Self {
        Self {
            min_tile_col: r.min_col,
            min_tile_row: r.min_row,
            max_tile_col: r.max_col,
            max_tile_row: r.max_row,
        }
    }
}

impl TileLimits {
    pub fn range(&self) -> IndexRange {
        IndexRange {
            min_col: self.min_tile_col,
            min_row: self.min_tile_row,
            max_col: self.max_tile_col,
            max_row: self.max_tile_row,
        }
    }
}

/// Slab index bounds of one level, as stored in `dataSet.slabLimits`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SlabLimits {
    pub min_slab_col: i64,
    pub min_slab_row: i64,
    pub max_slab_col: i64,
    pub max_slab_row: i64,
}

impl From<IndexRange> for SlabLimits {
    fn from(r: IndexRange) -> Self {
        Self {
            min_slab_col: r.min_col,
            min_slab_row: r.min_row,
            max_slab_col: r.max_col,
            max_slab_row: r.max_row,
        }
    }
}

impl SlabLimits {
    pub fn range(&self) -> IndexRange {
        IndexRange {
            min_col: self.min_slab_col,
            min_row: self.min_slab_row,
            max_col: self.max_slab_col,
            max_row: self.max_slab_row,
        }
    }
}

/// Running extents of everything ingested so far. Only ever grows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSet {
    /// Stored as `{}` until the first image arrives.
    #[serde(
        default,
        deserialize_with = "bbox_or_empty",
        serialize_with = "bbox_or_empty_map"
    )]
    pub bounding_box: Option<BBox>,
    #[serde(default, deserialize_with = "level_map")]
    pub limits: BTreeMap<u32, TileLimits>,
    #[serde(default, deserialize_with = "level_map")]
    pub slab_limits: BTreeMap<u32, SlabLimits>,
    /// Levels materialized in this cache; a sub-range of the descriptor's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<LevelRange>,
}

fn bbox_or_empty<'de, D>(d: D) -> std::result::Result<Option<BBox>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Set(BBox),
        Empty(IgnoredAny),
    }

    Ok(match Option::<Repr>::deserialize(d)? {
        Some(Repr::Set(b)) => Some(b),
        _ => None,
    })
}

/// Level-keyed maps. Keys arrive as strings once `Overviews` buffers its
/// content for the flattened extra keys, so they are parsed here.
fn level_map<'de, D, T>(d: D) -> std::result::Result<BTreeMap<u32, T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    BTreeMap::<String, T>::deserialize(d)?
        .into_iter()
        .map(|(k, v)| {
            k.trim()
                .parse::<u32>()
                .map(|level| (level, v))
                .map_err(|_| de::Error::custom(format!("invalid level key {k:?}")))
        })
        .collect()
}

fn bbox_or_empty_map<S>(b: &Option<BBox>, s: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match b {
        Some(b) => b.serialize(s),
        None => s.serialize_map(Some(0))?.end(),
    }
}

/// Registry entry of one ingested image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpiEntry {
    pub color: Rgb,
    /// `YYYY-MM-DD`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    /// `HH:MM`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_ut: Option<String>,
    pub with_rgb: bool,
    pub with_ir: bool,
}

impl OpiEntry {
    pub fn composition(&self) -> Composition {
        Composition {
            rgb: self.with_rgb,
            ir: self.with_ir,
        }
    }
}

/// Channel composition of a cache: color, infrared, or both stacked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Composition {
    pub rgb: bool,
    pub ir: bool,
}

impl Composition {
    pub const RGB: Composition = Composition { rgb: true, ir: false };
    pub const IR: Composition = Composition { rgb: false, ir: true };
    pub const RGBIR: Composition = Composition { rgb: true, ir: true };

    /// Bands of ortho and opi rasters.
    pub fn bands(&self) -> u8 {
        match (self.rgb, self.ir) {
            (true, true) => 4,
            (true, false) => 3,
            _ => 1,
        }
    }

    pub fn label(&self) -> &'static str {
        match (self.rgb, self.ir) {
            (true, true) => "RGBIR",
            (true, false) => "RGB",
            (false, true) => "IR",
            (false, false) => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Overviews {
    /// Ground resolution at `level.max`.
    pub resolution: f64,
    pub level: LevelRange,
    pub tile_size: Size,
    /// Tiles per slab edge.
    pub slab_size: Size,
    pub path_depth: u32,
    pub crs: Crs,
    #[serde(default)]
    pub data_set: DataSet,
    #[serde(rename = "list_OPI", default)]
    pub list_opi: BTreeMap<String, OpiEntry>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Overviews {
    pub fn from_json(text: &str) -> Result<Self> {
        let ov: Overviews = serde_json::from_str(text)?;
        ov.validate()?;
        Ok(ov)
    }

    /// Rejects descriptors the coordinate math cannot work with.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(CacheError::Config(msg));

        if !(self.resolution.is_finite() && self.resolution > 0.0) {
            return bad(format!("resolution must be > 0, got {}", self.resolution));
        }
        if self.level.min > self.level.max {
            return bad(format!(
                "level.min ({}) > level.max ({})",
                self.level.min, self.level.max
            ));
        }
        let Size { width, height } = self.tile_size;
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return bad(format!("tileSize must be even and > 0, got {width}x{height}"));
        }
        if self.slab_size.width == 0 || self.slab_size.height == 0 {
            return bad("slabSize must be > 0".into());
        }
        let b = &self.crs.bounding_box;
        let finite = [b.xmin, b.ymin, b.xmax, b.ymax].iter().all(|v| v.is_finite());
        if !finite || b.xmin >= b.xmax || b.ymin >= b.ymax {
            return bad(format!("crs.boundingBox is malformed: {b:?}"));
        }
        if let Some(levels) = self.data_set.level {
            self.check_level_range(levels)?;
        }
        Ok(())
    }

    fn check_level_range(&self, levels: LevelRange) -> Result<()> {
        if levels.min > levels.max
            || !self.level.contains(levels.min)
            || !self.level.contains(levels.max)
        {
            return Err(CacheError::Config(format!(
                "level range {}..={} outside the pyramid {}..={}",
                levels.min, levels.max, self.level.min, self.level.max
            )));
        }
        Ok(())
    }

    /// Resets the dataset section for a fresh cache restricted to `levels`
    /// (the whole pyramid when `None`).
    pub fn init_dataset(&mut self, levels: Option<LevelRange>) -> Result<()> {
        let levels = levels.unwrap_or(self.level);
        self.check_level_range(levels)?;
        self.data_set = DataSet {
            level: Some(levels),
            ..DataSet::default()
        };
        self.list_opi.clear();
        Ok(())
    }

    /// Levels this cache materializes.
    pub fn computed_levels(&self) -> LevelRange {
        self.data_set.level.unwrap_or(self.level)
    }

    /// Level at which opi artifacts are cut.
    pub fn finest_level(&self) -> u32 {
        self.computed_levels().max
    }

    pub fn resolution_at(&self, level: u32) -> f64 {
        level_resolution(self.resolution, self.level.max, level)
    }

    pub fn grid(&self, level: u32) -> Grid {
        Grid {
            level,
            origin_x: self.crs.bounding_box.xmin,
            origin_y: self.crs.bounding_box.ymax,
            resolution: self.resolution_at(level),
            tile_width: self.tile_size.width,
            tile_height: self.tile_size.height,
            slab_width: self.slab_size.width,
            slab_height: self.slab_size.height,
        }
    }

    /// Composition of the registered images; `None` for an empty cache.
    pub fn composition(&self) -> Option<Composition> {
        self.list_opi.values().next().map(OpiEntry::composition)
    }

    pub fn is_registered(&self, image_id: &str) -> bool {
        self.list_opi.contains_key(image_id)
    }

    pub fn color_of(&self, image_id: &str) -> Option<Rgb> {
        self.list_opi.get(image_id).map(|e| e.color)
    }
}
