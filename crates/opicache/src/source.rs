//! Source images: world-file georeferencing, RGB/IR pairing and loading.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{CacheError, Result};
use crate::geo::{BBox, GeoTransform};
use crate::graph::normalize_image_id;
use crate::overviews::Composition;
use crate::raster::Raster;

/// Sidecar candidates for `image`, most specific first.
fn world_file_candidates(image: &Path) -> Vec<PathBuf> {
    let ext = image
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    let mut exts = Vec::new();
    if ext.len() >= 2 {
        let mut chars = ext.chars();
        if let (Some(first), Some(last)) = (chars.next(), chars.last()) {
            exts.push(format!("{first}{last}w"));
        }
    }
    exts.push(format!("{ext}w"));
    exts.push("wld".to_owned());

    let mut out = Vec::with_capacity(exts.len() * 2);
    for e in exts {
        out.push(image.with_extension(e.to_lowercase()));
        out.push(image.with_extension(e.to_uppercase()));
    }
    out
}

/// Parses a north-up world file (`A D B E C F`, one value per line). `C`/`F`
/// address the centre of the upper-left pixel.
pub fn parse_world_file(path: &Path, text: &str) -> Result<GeoTransform> {
    let bad = |reason: &str| CacheError::Georef {
        path: path.to_path_buf(),
        reason: reason.to_owned(),
    };

    let values = text
        .split_whitespace()
        .map(str::parse::<f64>)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| bad("non-numeric world file entry"))?;
    let [a, d, b, e, c, f] = <[f64; 6]>::try_from(values.as_slice())
        .map_err(|_| bad("world file must hold six values"))?;

    if !values.iter().all(|v| v.is_finite()) {
        return Err(bad("non-finite world file entry"));
    }
    if d != 0.0 || b != 0.0 {
        return Err(bad("rotated world files are not supported"));
    }
    if a <= 0.0 || e >= 0.0 {
        return Err(bad("pixel size must be positive in x and negative in y"));
    }

    Ok(GeoTransform {
        origin_x: c - a / 2.0,
        origin_y: f - e / 2.0,
        pixel_width: a,
        pixel_height: -e,
    })
}

/// Georeferencing of `image` from the first sidecar found.
pub fn read_georef(image: &Path) -> Result<GeoTransform> {
    for candidate in world_file_candidates(image) {
        if candidate.is_file() {
            debug!("{}: world file {}", image.display(), candidate.display());
            let text = fs::read_to_string(&candidate)?;
            return parse_world_file(&candidate, &text);
        }
    }
    Err(CacheError::Georef {
        path: image.to_path_buf(),
        reason: "no world file".into(),
    })
}

/// Input files of one acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    /// Registered identifier.
    pub id: String,
    pub rgb: Option<PathBuf>,
    pub ir: Option<PathBuf>,
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Pairs RGB and IR files by normalized stem. The identifier is the RGB stem,
/// or the IR stem for files without an RGB partner. Sorted by identifier.
pub fn pair_sources(rgb: &[PathBuf], ir: &[PathBuf]) -> Vec<SourceSpec> {
    let mut by_key: BTreeMap<String, SourceSpec> = BTreeMap::new();
    for path in rgb {
        let id = stem(path);
        match by_key.entry(normalize_image_id(&id)) {
            Entry::Occupied(e) => warn!(
                "{} and {} name the same image, keeping the first",
                e.get().rgb.as_deref().unwrap_or(path.as_path()).display(),
                path.display()
            ),
            Entry::Vacant(e) => {
                e.insert(SourceSpec {
                    id,
                    rgb: Some(path.clone()),
                    ir: None,
                });
            }
        }
    }
    for path in ir {
        let id = stem(path);
        let spec = by_key.entry(normalize_image_id(&id)).or_insert_with(|| SourceSpec {
            id,
            rgb: None,
            ir: None,
        });
        match &spec.ir {
            Some(first) => warn!(
                "{} and {} name the same infrared image, keeping the first",
                first.display(),
                path.display()
            ),
            None => spec.ir = Some(path.clone()),
        }
    }

    let mut out: Vec<SourceSpec> = by_key.into_values().collect();
    out.sort_by(|a, b| a.id.cmp(&b.id));
    out
}

/// A decoded, georeferenced source image with the cache's band layout.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub id: String,
    pub raster: Raster,
}

impl SourceImage {
    /// Loads `spec` for a run of composition `comp`.
    pub fn load(spec: &SourceSpec, comp: Composition) -> Result<Self> {
        let missing = |channel| CacheError::MissingChannel {
            image: spec.id.clone(),
            channel,
        };

        let rgb = match (&spec.rgb, comp.rgb) {
            (Some(p), true) => Some(Raster::read_bands(p, read_georef(p)?, 3)?),
            (None, true) => return Err(missing("RGB")),
            _ => None,
        };
        let ir = match (&spec.ir, comp.ir) {
            (Some(p), true) => Some(first_band(Raster::read(p, read_georef(p)?)?)),
            (None, true) => return Err(missing("IR")),
            _ => None,
        };

        let raster = match (rgb, ir) {
            (Some(rgb), Some(ir)) => {
                if !same_grid(&rgb, &ir) {
                    return Err(CacheError::Georef {
                        path: spec.ir.clone().unwrap_or_default(),
                        reason: "IR georeferencing differs from its RGB partner".into(),
                    });
                }
                Raster::stack(&rgb, &ir).ok_or_else(|| missing("IR"))?
            }
            (Some(r), None) | (None, Some(r)) => r,
            (None, None) => return Err(missing("RGB")),
        };

        Ok(Self {
            id: spec.id.clone(),
            raster,
        })
    }

    /// `LowerCorner = [ulx, lry]`, `UpperCorner = [lrx, uly]`.
    pub fn footprint(&self) -> BBox {
        self.raster.geo.extent(self.raster.width, self.raster.height)
    }
}

fn first_band(r: Raster) -> Raster {
    if r.bands == 1 {
        return r;
    }
    let data = r.data.chunks_exact(r.bands as usize).map(|p| p[0]).collect();
    Raster {
        bands: 1,
        data,
        ..r
    }
}

fn same_grid(a: &Raster, b: &Raster) -> bool {
    const EPS: f64 = 1e-6;
    a.width == b.width
        && a.height == b.height
        && (a.geo.origin_x - b.geo.origin_x).abs() < EPS
        && (a.geo.origin_y - b.geo.origin_y).abs() < EPS
        && (a.geo.pixel_width - b.geo.pixel_width).abs() < EPS
        && (a.geo.pixel_height - b.geo.pixel_height).abs() < EPS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::RasterFormat;

    fn write_png(dir: &Path, name: &str, bands: u8, fill: u8) -> PathBuf {
        let path = dir.join(format!("{name}.png"));
        let mut r = Raster::blank(4, 2, bands, GeoTransform::north_up(0.0, 0.0, 1.0));
        r.data.fill(fill);
        r.write(&path, RasterFormat::Png).unwrap();
        fs::write(
            dir.join(format!("{name}.pgw")),
            "0.5\n0\n0\n-0.5\n100.25\n199.75\n",
        )
        .unwrap();
        path
    }

    #[test]
    fn world_file_origin_is_pixel_corner() {
        let gt = parse_world_file(Path::new("a.pgw"), "0.5\n0\n0\n-0.5\n100.25\n199.75\n").unwrap();
        assert_eq!(gt, GeoTransform::north_up(100.0, 200.0, 0.5));
    }

    #[test]
    fn rotated_world_file_is_rejected() {
        let err = parse_world_file(Path::new("a.tfw"), "1 0.1 0 -1 0 0").unwrap_err();
        assert!(matches!(err, CacheError::Georef { .. }));
        assert!(parse_world_file(Path::new("a.tfw"), "1 0 0").is_err());
    }

    #[test]
    fn sidecar_candidates() {
        let c = world_file_candidates(Path::new("/d/x.tif"));
        assert_eq!(c[0], PathBuf::from("/d/x.tfw"));
        assert!(c.contains(&PathBuf::from("/d/x.tifw")));
        assert!(c.contains(&PathBuf::from("/d/x.wld")));
    }

    #[test]
    fn pairing_by_normalized_id() {
        let rgb = vec![PathBuf::from("/r/OPI_19FD00020.tif"), PathBuf::from("/r/19FD00021.tif")];
        let ir = vec![PathBuf::from("/i/19FD00020.tif"), PathBuf::from("/i/19FD00099.tif")];
        let specs = pair_sources(&rgb, &ir);
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].id, "19FD00021");
        assert!(specs[0].ir.is_none());
        assert_eq!(specs[1].id, "19FD00099");
        assert!(specs[1].rgb.is_none());
        assert_eq!(specs[2].id, "OPI_19FD00020");
        assert_eq!(specs[2].ir, Some(PathBuf::from("/i/19FD00020.tif")));
    }

    #[test]
    fn colliding_ids_keep_the_first_file() {
        let rgb = vec![PathBuf::from("/r/OPI_X.png"), PathBuf::from("/s/X.png")];
        let ir = vec![PathBuf::from("/i/X.png"), PathBuf::from("/j/OPI_X.png")];
        let specs = pair_sources(&rgb, &ir);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].id, "OPI_X");
        assert_eq!(specs[0].rgb, Some(PathBuf::from("/r/OPI_X.png")));
        assert_eq!(specs[0].ir, Some(PathBuf::from("/i/X.png")));
    }

    #[test]
    fn load_stacks_rgb_and_ir() {
        let dir = tempfile::tempdir().unwrap();
        let rgb = write_png(dir.path(), "A", 3, 10);
        let ir = write_png(dir.path(), "A_ir", 1, 77);
        let spec = SourceSpec {
            id: "A".into(),
            rgb: Some(rgb),
            ir: Some(ir),
        };
        let img = SourceImage::load(&spec, Composition::RGBIR).unwrap();
        assert_eq!(img.raster.bands, 4);
        assert_eq!(img.raster.pixel(3, 1), &[10, 10, 10, 77]);
        assert_eq!(img.footprint(), BBox::new(100.0, 199.0, 102.0, 200.0));

        let rgb_only = SourceSpec { ir: None, ..spec };
        let err = SourceImage::load(&rgb_only, Composition::RGBIR).unwrap_err();
        assert!(matches!(err, CacheError::MissingChannel { channel: "IR", .. }));
    }
}
