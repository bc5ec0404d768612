use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Every failure the cache engine can report.
///
/// Configuration-class variants abort a run before any worker starts; the
/// others are scoped to one image or one slab and end up in a
/// [`RunReport`](crate::RunReport).
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cache {} already in use", .0.display())]
    CacheInUse(PathBuf),

    #[error("cache {} doesn't exist or has no metadata", .0.display())]
    CacheMissing(PathBuf),

    #[error("opi type not compatible (existing cache type: {cache}, update type: {update})")]
    CompositionMismatch { cache: String, update: String },

    #[error("graph store: {0}")]
    Graph(String),

    #[error("{}: no usable georeferencing ({reason})", .path.display())]
    Georef { path: PathBuf, reason: String },

    #[error("image {image}: footprint outside the grid at level {level}")]
    OutsideGrid { image: String, level: u32 },

    #[error("image {image}: no {channel} source")]
    MissingChannel { image: String, channel: &'static str },

    #[error("image {0} is not registered in the cache")]
    UnknownImage(String),

    #[error("{}: expected {expected} band(s), found {found}", .path.display())]
    BandMismatch {
        path: PathBuf,
        expected: u8,
        found: u8,
    },

    #[error("worker pool: {0}")]
    Pool(String),
}

impl CacheError {
    /// Whether this error must abort the whole run rather than a single
    /// image or slab.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CacheError::Config(_)
                | CacheError::CacheInUse(_)
                | CacheError::CacheMissing(_)
                | CacheError::CompositionMismatch { .. }
                | CacheError::Pool(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
