//! On-disk layout of a cache directory and whole-file metadata I/O.
//!
//! ```text
//! <cache>/overviews.json
//! <cache>/cache_mtd.json
//! <cache>/opi/<level>/<dirs>/<leaf>_<imageId>.<ext>
//! <cache>/ortho/<level>/<dirs>/<leaf>.<ext>
//! <cache>/graph/<level>/<dirs>/<leaf>.png
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::colors::ColorRegistry;
use crate::error::{CacheError, Result};
use crate::overviews::Overviews;
use crate::raster::RasterFormat;
use crate::slab_path::SlabPath;

pub const OVERVIEWS_FILE: &str = "overviews.json";
pub const COLORS_FILE: &str = "cache_mtd.json";

/// The three raster layers of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Opi,
    Ortho,
    Graph,
}

impl Layer {
    pub fn dir_name(self) -> &'static str {
        match self {
            Layer::Opi => "opi",
            Layer::Ortho => "ortho",
            Layer::Graph => "graph",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn overviews_path(&self) -> PathBuf {
        self.root.join(OVERVIEWS_FILE)
    }

    pub fn colors_path(&self) -> PathBuf {
        self.root.join(COLORS_FILE)
    }

    pub fn level_dir(&self, layer: Layer, level: u32) -> PathBuf {
        self.root.join(layer.dir_name()).join(level.to_string())
    }

    /// Directory holding every artifact of one slab.
    pub fn slab_dir(&self, layer: Layer, level: u32, path: &SlabPath) -> PathBuf {
        self.level_dir(layer, level).join(path.dir())
    }

    pub fn opi_file(&self, level: u32, path: &SlabPath, image_id: &str, format: RasterFormat) -> PathBuf {
        path.file_in(
            &self.level_dir(Layer::Opi, level),
            &format!("_{image_id}"),
            format.extension(),
        )
    }

    pub fn ortho_file(&self, level: u32, path: &SlabPath, format: RasterFormat) -> PathBuf {
        path.file_in(&self.level_dir(Layer::Ortho, level), "", format.extension())
    }

    pub fn graph_file(&self, level: u32, path: &SlabPath) -> PathBuf {
        path.file_in(
            &self.level_dir(Layer::Graph, level),
            "",
            RasterFormat::GRAPH.extension(),
        )
    }

    /// Opi artifacts of one slab as `(image_id, path)`, sorted by identifier.
    ///
    /// A missing slab directory means no contributor.
    pub fn list_opi(&self, level: u32, path: &SlabPath, format: RasterFormat) -> Result<Vec<(String, PathBuf)>> {
        let dir = self.slab_dir(Layer::Opi, level, path);
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let prefix = format!("{}_", path.leaf());
        let suffix = format!(".{}", format.extension());
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(&suffix))
            {
                if !id.is_empty() {
                    out.push((id.to_owned(), entry.path()));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    pub fn has_metadata(&self) -> bool {
        self.overviews_path().is_file()
    }

    /// Loads both metadata files; missing or unreadable ones are fatal.
    pub fn load(&self) -> Result<(Overviews, ColorRegistry)> {
        let ov_path = self.overviews_path();
        let colors_path = self.colors_path();
        if !ov_path.is_file() || !colors_path.is_file() {
            return Err(CacheError::CacheMissing(self.root.clone()));
        }

        let overviews = fs::read_to_string(&ov_path)
            .map_err(CacheError::from)
            .and_then(|text| Overviews::from_json(&text))
            .map_err(|e| CacheError::Config(format!("{}: {e}", ov_path.display())))?;
        let colors = fs::read_to_string(&colors_path)
            .map_err(CacheError::from)
            .and_then(|text| serde_json::from_str(&text).map_err(CacheError::from))
            .map_err(|e| CacheError::Config(format!("{}: {e}", colors_path.display())))?;
        Ok((overviews, colors))
    }

    /// Writes both metadata files, each through a temp file and a rename.
    pub fn save(&self, overviews: &Overviews, colors: &ColorRegistry) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        write_json_atomic(&self.colors_path(), colors)?;
        write_json_atomic(&self.overviews_path(), overviews)
    }
}

/// Sibling temp path used for atomic replacement of `path`.
pub fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = temp_sibling(path);
    {
        let mut f = fs::File::create(&tmp)?;
        serde_json::to_writer_pretty(&mut f, value)?;
        f.write_all(b"\n")?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overviews::tests::descriptor;

    #[test]
    fn artifact_paths() {
        let layout = CacheLayout::new("/c");
        let p = SlabPath::encode(0, 0, 2);
        let jpg = RasterFormat::Jpeg { quality: 90 };
        assert_eq!(
            layout.opi_file(14, &p, "IMG_1", jpg),
            PathBuf::from("/c/opi/14/00/00/00_IMG_1.jpg")
        );
        assert_eq!(
            layout.ortho_file(14, &p, jpg),
            PathBuf::from("/c/ortho/14/00/00/00.jpg")
        );
        assert_eq!(
            layout.graph_file(10, &p),
            PathBuf::from("/c/graph/10/00/00/00.png")
        );
    }

    #[test]
    fn list_opi_filters_by_leaf_and_extension() {
        let dir = tempfile::tempdir().unwrap();
        let layout = CacheLayout::new(dir.path());
        let p = SlabPath::encode(1, 2, 1);
        let jpg = RasterFormat::Jpeg { quality: 90 };
        let slab_dir = layout.slab_dir(Layer::Opi, 14, &p);
        fs::create_dir_all(&slab_dir).unwrap();
        for name in ["12_B.jpg", "12_A.jpg", "13_C.jpg", "12_D.png", "12_.jpg"] {
            fs::write(slab_dir.join(name), b"x").unwrap();
        }

        let ids: Vec<String> = layout
            .list_opi(14, &p, jpg)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["A", "B"]);

        let empty = layout.list_opi(13, &p, jpg).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn metadata_round_trip_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let layout = CacheLayout::new(dir.path().join("cache"));
        assert!(matches!(layout.load(), Err(CacheError::CacheMissing(_))));

        let mut ov = descriptor();
        ov.init_dataset(None).unwrap();
        let mut colors = ColorRegistry::new();
        colors.insert([9, 9, 9], "A");
        layout.save(&ov, &colors).unwrap();
        assert!(layout.has_metadata());
        assert!(!temp_sibling(&layout.overviews_path()).exists());

        let (ov2, colors2) = layout.load().unwrap();
        assert_eq!(ov2, ov);
        assert_eq!(colors2, colors);
    }
}
