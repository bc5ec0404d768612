//! Base-36 digit-interleaved slab paths.
//!
//! `x` and `y` are written in base 36, left-padded to `path_depth + 1` digits,
//! and the i-th digits of both form the i-th path segment. Every directory
//! therefore holds at most 36² entries however large the cache grows.
//!
//! Precondition (not checked): `36^(path_depth + 1)` must exceed the largest
//! slab index of the finest level. Larger indices keep their extra leading
//! digits in the first segment, which breaks the fan-out bound and lets two
//! different slabs share a path (`(37, 0)` and `(1, 36)` both give `/110` at
//! depth 0).

use std::fmt;
use std::path::{Path, PathBuf};

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// `value` in base 36, left-padded with `'0'` to at least `width` digits.
pub fn to_base36(mut value: u64, width: usize) -> String {
    let mut digits = Vec::with_capacity(width.max(1));
    loop {
        digits.push(DIGITS[(value % 36) as usize]);
        value /= 36;
        if value == 0 {
            break;
        }
    }
    while digits.len() < width {
        digits.push(b'0');
    }
    digits.reverse();
    // Only ASCII digits were pushed.
    digits.into_iter().map(char::from).collect()
}

/// Derived storage key of one slab. Not persisted anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlabPath {
    segments: Vec<String>,
}

impl SlabPath {
    pub fn encode(x: u32, y: u32, path_depth: u32) -> Self {
        let width = path_depth as usize + 1;
        let sx = to_base36(x as u64, width);
        let sy = to_base36(y as u64, width);

        // Overflowing indices: extra leading digits stay with the first segment.
        let (hx, tx) = sx.split_at(sx.len() - width + 1);
        let (hy, ty) = sy.split_at(sy.len() - width + 1);

        let mut segments = Vec::with_capacity(width);
        segments.push(format!("{hx}{hy}"));
        for (cx, cy) in tx.chars().zip(ty.chars()) {
            segments.push(format!("{cx}{cy}"));
        }

        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Directory part, relative to a level directory.
    pub fn dir(&self) -> PathBuf {
        self.segments[..self.segments.len() - 1].iter().collect()
    }

    /// Last segment, the file-name stem of ortho/graph rasters and the prefix
    /// of opi artifacts.
    pub fn leaf(&self) -> &str {
        &self.segments[self.segments.len() - 1]
    }

    /// File path for this slab under `level_dir`, with `stem_suffix` appended
    /// to the leaf (e.g. `"_IMG42"`) and extension `ext`.
    pub fn file_in(&self, level_dir: &Path, stem_suffix: &str, ext: &str) -> PathBuf {
        level_dir
            .join(self.dir())
            .join(format!("{}{}.{}", self.leaf(), stem_suffix, ext))
    }
}

impl fmt::Display for SlabPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}
