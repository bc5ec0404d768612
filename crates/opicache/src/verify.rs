//! Consistency checks over a cache, and removal of orphaned opi artifacts.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;

use log::{info, warn};
use walkdir::WalkDir;

use crate::colors::ColorRegistry;
use crate::error::Result;
use crate::layout::{CacheLayout, Layer};
use crate::overviews::{Overviews, Rgb};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issue {
    /// `list_OPI` color has no registry entry.
    ColorNotRegistered { image: String, color: Rgb },
    /// Registry maps the image's color to someone else.
    ColorOwnerMismatch { image: String, color: Rgb, owner: String },
    /// Registry entry for an image missing from `list_OPI`.
    UnlistedColor { color: Rgb, owner: String },
    /// Several images share one color.
    SharedColor { color: Rgb, images: Vec<String> },
    MixedComposition { image: String, found: &'static str, expected: &'static str },
    MalformedLimits { level: u32, what: &'static str },
    EmptyFile(PathBuf),
    /// Leftover of an interrupted write.
    StaleTemp(PathBuf),
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Issue::ColorNotRegistered { image, color } => {
                write!(f, "{image}: color {color:?} missing from the color registry")
            }
            Issue::ColorOwnerMismatch { image, color, owner } => {
                write!(f, "{image}: color {color:?} is registered to {owner}")
            }
            Issue::UnlistedColor { color, owner } => {
                write!(f, "color {color:?} registered to {owner}, which is not in list_OPI")
            }
            Issue::SharedColor { color, images } => {
                write!(f, "color {color:?} shared by {}", images.join(", "))
            }
            Issue::MixedComposition {
                image,
                found,
                expected,
            } => write!(f, "{image}: composition {found}, cache is {expected}"),
            Issue::MalformedLimits { level, what } => write!(f, "level {level}: malformed {what}"),
            Issue::EmptyFile(p) => write!(f, "{}: empty file", p.display()),
            Issue::StaleTemp(p) => write!(f, "{}: leftover temp file", p.display()),
        }
    }
}

/// Metadata-only checks.
pub fn check_metadata(overviews: &Overviews, colors: &ColorRegistry) -> Vec<Issue> {
    let mut issues = Vec::new();

    let mut by_color: BTreeMap<Rgb, Vec<String>> = BTreeMap::new();
    for (image, entry) in &overviews.list_opi {
        by_color.entry(entry.color).or_default().push(image.clone());
        match colors.owner(entry.color) {
            None => issues.push(Issue::ColorNotRegistered {
                image: image.clone(),
                color: entry.color,
            }),
            Some(owner) if owner != image => issues.push(Issue::ColorOwnerMismatch {
                image: image.clone(),
                color: entry.color,
                owner: owner.to_owned(),
            }),
            Some(_) => {}
        }
    }
    for (color, images) in by_color {
        if images.len() > 1 {
            issues.push(Issue::SharedColor { color, images });
        }
    }
    for (color, owner) in colors.iter() {
        if !overviews.is_registered(owner) {
            issues.push(Issue::UnlistedColor {
                color,
                owner: owner.to_owned(),
            });
        }
    }

    if let Some(expected) = overviews.composition() {
        for (image, entry) in &overviews.list_opi {
            let found = entry.composition();
            if found != expected {
                issues.push(Issue::MixedComposition {
                    image: image.clone(),
                    found: found.label(),
                    expected: expected.label(),
                });
            }
        }
    }

    let levels = overviews.computed_levels();
    for (&level, l) in &overviews.data_set.limits {
        if !levels.contains(level) || !l.range().is_addressable() {
            issues.push(Issue::MalformedLimits {
                level,
                what: "tile limits",
            });
        }
    }
    for (&level, l) in &overviews.data_set.slab_limits {
        if !levels.contains(level) || !l.range().is_addressable() {
            issues.push(Issue::MalformedLimits {
                level,
                what: "slab limits",
            });
        }
    }

    issues
}

/// Loads the cache and runs every check, including a walk for empty and
/// leftover temp files.
pub fn verify(layout: &CacheLayout) -> Result<Vec<Issue>> {
    let (overviews, colors) = layout.load()?;
    let mut issues = check_metadata(&overviews, &colors);

    for entry in WalkDir::new(layout.root()) {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().extension().is_some_and(|e| e == "tmp") {
            issues.push(Issue::StaleTemp(entry.into_path()));
        } else if entry.metadata().map(|m| m.len() == 0).unwrap_or(false) {
            issues.push(Issue::EmptyFile(entry.into_path()));
        }
    }

    info!("{}: {} issue(s)", layout.root().display(), issues.len());
    Ok(issues)
}

/// Identifier encoded in an opi artifact file name (`<leaf>_<imageId>.<ext>`).
fn opi_image_id(file_name: &str) -> Option<&str> {
    let (stem, _ext) = file_name.rsplit_once('.')?;
    let (_leaf, id) = stem.split_once('_')?;
    (!id.is_empty()).then_some(id)
}

/// Deletes opi artifacts whose image is not registered. Returns the removed
/// paths.
pub fn prune_orphans(layout: &CacheLayout, overviews: &Overviews) -> Result<Vec<PathBuf>> {
    let opi_root = layout.root().join(Layer::Opi.dir_name());
    if !opi_root.is_dir() {
        return Ok(Vec::new());
    }

    let mut removed = Vec::new();
    for entry in WalkDir::new(&opi_root) {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        let Some(id) = opi_image_id(name) else {
            continue;
        };
        if !overviews.is_registered(id) {
            warn!("removing orphan opi artifact {}", entry.path().display());
            fs::remove_file(entry.path())?;
            removed.push(entry.into_path());
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::tests::{cut_uniform, entry, two_image_cache, A, B};

    #[test]
    fn consistent_metadata_has_no_issue() {
        let (_dir, _layout, ov, _) = two_image_cache();
        let mut colors = ColorRegistry::new();
        colors.insert(A, "A");
        colors.insert(B, "B");
        assert!(check_metadata(&ov, &colors).is_empty());
    }

    #[test]
    fn detects_registry_drift() {
        let (_dir, _layout, mut ov, _) = two_image_cache();
        ov.list_opi.insert("C".into(), entry(A));
        let mut ir_only = entry([1, 1, 1]);
        ir_only.with_rgb = false;
        ir_only.with_ir = true;
        ov.list_opi.insert("D".into(), ir_only);

        let mut colors = ColorRegistry::new();
        colors.insert(A, "A");
        colors.insert([9, 9, 9], "ghost");

        let issues = check_metadata(&ov, &colors);
        assert!(issues.contains(&Issue::ColorNotRegistered {
            image: "B".into(),
            color: B
        }));
        assert!(issues.contains(&Issue::SharedColor {
            color: A,
            images: vec!["A".into(), "C".into()]
        }));
        assert!(issues.contains(&Issue::UnlistedColor {
            color: [9, 9, 9],
            owner: "ghost".into()
        }));
        assert!(issues.iter().any(|i| matches!(i, Issue::MixedComposition { image, .. } if image == "D")));
    }

    #[test]
    fn verify_flags_empty_files() {
        let (_dir, layout, ov, _) = two_image_cache();
        let mut colors = ColorRegistry::new();
        colors.insert(A, "A");
        colors.insert(B, "B");
        layout.save(&ov, &colors).unwrap();
        fs::write(layout.root().join("opi").join("stray.jpg"), b"").unwrap();

        let issues = verify(&layout).unwrap();
        assert_eq!(issues.len(), 1);
        assert!(matches!(&issues[0], Issue::EmptyFile(p) if p.ends_with("stray.jpg")));
    }

    #[test]
    fn verify_flags_leftover_temp_files() {
        let (_dir, layout, ov, _) = two_image_cache();
        let mut colors = ColorRegistry::new();
        colors.insert(A, "A");
        colors.insert(B, "B");
        layout.save(&ov, &colors).unwrap();
        fs::create_dir_all(layout.root().join("graph")).unwrap();
        fs::write(layout.root().join("graph").join("00.png.tmp"), b"partial").unwrap();

        let issues = verify(&layout).unwrap();
        assert_eq!(issues.len(), 1);
        assert!(matches!(&issues[0], Issue::StaleTemp(p) if p.ends_with("00.png.tmp")));
    }

    #[test]
    fn orphans_are_pruned() {
        let (_dir, layout, ov, _) = two_image_cache();
        cut_uniform("Z_9", 1, &ov, &layout);
        assert_eq!(opi_image_id("00_Z_9.jpg"), Some("Z_9"));

        let removed = prune_orphans(&layout, &ov).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(removed[0].ends_with("00_Z_9.jpg"));
        assert!(prune_orphans(&layout, &ov).unwrap().is_empty());
    }
}
