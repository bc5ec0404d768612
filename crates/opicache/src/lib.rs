//! opicache: slab-sharded ortho/graph mosaic cache.
//!
//! A cache is a directory holding a pyramid of levels (`level.max` is native
//! resolution, each level above is twice as coarse). Every level is cut into
//! slabs of `slabSize` tiles, and each slab is stored as files addressed by an
//! interleaved base-36 path:
//!
//! ```text
//!   <root>/overviews.json                 pyramid descriptor + dataset + list_OPI
//!   <root>/cache_mtd.json                 color -> image registry (r/g/b nested)
//!   <root>/opi/<L>/<seg>/.../<leaf>_<id>.<ext>   per-image resampled slab
//!   <root>/ortho/<L>/<seg>/.../<leaf>.<ext>      composited mosaic
//!   <root>/graph/<L>/<seg>/.../<leaf>.png        owner-color raster
//! ```
//!
//! Ortho and opi slabs are JPEG for 1 or 3 bands and PNG for RGB+IR. The
//! graph layer is always lossless PNG; `[0, 0, 0]` means no owner.
//!
//! Runs ([`CacheUpdater`]) ingest source images in two fan-outs on a bounded
//! worker pool: cutting each image into per-image slabs, then rebuilding every
//! slab the new images touched, finest level first.

pub mod colors;
pub mod compositor;
pub mod coords;
pub mod cutter;
pub mod error;
pub mod extent;
pub mod geo;
pub mod graph;
pub mod identify;
pub mod layout;
pub mod mask;
pub mod orchestrator;
pub mod overviews;
pub mod patch;
pub mod progress;
pub mod pyramid;
pub mod raster;
pub mod slab_path;
pub mod source;
pub mod verify;
pub mod warp;

pub use colors::{ColorRegistry, BACKGROUND};
pub use coords::{Grid, IndexRange};
pub use error::{CacheError, Result};
pub use geo::{BBox, GeoTransform};
pub use graph::{GeoJsonConnector, GeoJsonGraph, GraphConnector, GraphStore};
pub use identify::{identify, Identification};
pub use layout::CacheLayout;
pub use orchestrator::{default_processors, CacheUpdater, Mode, RunOptions, RunReport, SlabKey};
pub use overviews::{Composition, LevelRange, Overviews};
pub use patch::Patch;
pub use slab_path::SlabPath;
pub use source::{pair_sources, SourceSpec};
pub use verify::{prune_orphans, verify, Issue};
