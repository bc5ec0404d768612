//! Sequencing of a cache run: selection and metadata merging on the calling
//! thread, cutting and slab rebuilding on a bounded worker pool.

use std::fmt;
use std::sync::Arc;

use log::{error, info, warn};
use rand::Rng;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::colors::ColorRegistry;
use crate::compositor::{composite, SlabOutcome};
use crate::coords::IndexRange;
use crate::cutter::cut;
use crate::error::{CacheError, Result};
use crate::extent::{accumulate, slab_box, ChangeSet};
use crate::geo::BBox;
use crate::graph::{Acquisition, GraphConnector, GraphStore};
use crate::layout::CacheLayout;
use crate::overviews::{Composition, LevelRange, OpiEntry, Overviews};
use crate::patch::{patch_slab, patch_slabs, resolve_owner, Patch};
use crate::progress::Progress;
use crate::pyramid::coarsen;
use crate::source::{SourceImage, SourceSpec};
use crate::verify::prune_orphans;
use crate::warp::{NearestResampler, Resampler};

/// Available parallelism minus one, at least one.
pub fn default_processors() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_sub(1)
        .max(1)
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Worker threads for both fan-outs.
    pub processors: usize,
    /// Cut images again even if already registered (keeping their color).
    pub reprocess: bool,
    /// Delete opi artifacts of unregistered images after the run.
    pub prune_orphans: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            processors: default_processors(),
            reprocess: false,
            prune_orphans: false,
        }
    }
}

pub enum Mode {
    /// Fresh cache from a pyramid descriptor, optionally restricted to a
    /// sub-range of its levels.
    Create {
        descriptor: Overviews,
        levels: Option<LevelRange>,
    },
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlabKey {
    pub level: u32,
    pub x: u32,
    pub y: u32,
}

impl fmt::Display for SlabKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}_{}", self.level, self.x, self.y)
    }
}

/// Outcome of a run. Per-image and per-slab failures end up here instead of
/// aborting their siblings.
#[derive(Debug, Default)]
pub struct RunReport {
    pub added: Vec<String>,
    pub skipped: Vec<String>,
    pub image_failures: Vec<(String, CacheError)>,
    pub slab_failures: Vec<(SlabKey, CacheError)>,
    pub slabs_written: usize,
    pub slabs_empty: usize,
    pub pruned: usize,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        !self.image_failures.is_empty() || !self.slab_failures.is_empty()
    }

    pub fn log_summary(&self) {
        for (id, e) in &self.image_failures {
            error!("image {id}: {e}");
        }
        for (key, e) in &self.slab_failures {
            error!("slab {key}: {e}");
        }
        info!(
            "{} image(s) added, {} skipped, {} failed; {} slab(s) written, {} empty, {} failed; {} orphan(s) pruned",
            self.added.len(),
            self.skipped.len(),
            self.image_failures.len(),
            self.slabs_written,
            self.slabs_empty,
            self.slab_failures.len(),
            self.pruned
        );
    }

    fn record_slab(&mut self, key: SlabKey, result: Result<SlabOutcome>) {
        match result {
            Ok(SlabOutcome::Written) => self.slabs_written += 1,
            Ok(SlabOutcome::Empty) => self.slabs_empty += 1,
            Err(e) => {
                warn!("slab {key}: {e}");
                self.slab_failures.push((key, e));
            }
        }
    }
}

/// What a worker hands back for one successfully cut image.
struct Ingested {
    footprint: BBox,
}

/// Owner of a run. Metadata is only ever mutated here, between fan-outs.
pub struct CacheUpdater {
    layout: CacheLayout,
    connector: Arc<dyn GraphConnector>,
    resampler: Arc<dyn Resampler>,
    options: RunOptions,
}

impl CacheUpdater {
    pub fn new(layout: CacheLayout, connector: Arc<dyn GraphConnector>) -> Self {
        Self {
            layout,
            connector,
            resampler: Arc::new(NearestResampler),
            options: RunOptions::default(),
        }
    }

    pub fn with_resampler(mut self, resampler: Arc<dyn Resampler>) -> Self {
        self.resampler = resampler;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    fn pool(&self) -> Result<ThreadPool> {
        ThreadPoolBuilder::new()
            .num_threads(self.options.processors.max(1))
            .build()
            .map_err(|e| CacheError::Pool(e.to_string()))
    }

    /// Connection made before any worker starts; failure is fatal.
    fn connect_checked(&self) -> Result<Arc<dyn GraphStore>> {
        self.connector
            .connect()
            .map_err(|e| CacheError::Config(format!("graph store unreachable: {e}")))
    }

    /// Ingests `sources` into the cache and rebuilds every slab they touch.
    ///
    /// Fatal errors are returned before anything is written. Otherwise the
    /// metadata is persisted and failures are listed in the report.
    pub fn run<R: Rng + ?Sized>(
        &self,
        mode: Mode,
        sources: &[SourceSpec],
        composition: Composition,
        rng: &mut R,
    ) -> Result<RunReport> {
        let (mut overviews, mut colors) = match mode {
            Mode::Create { descriptor, levels } => {
                if self.layout.has_metadata() {
                    return Err(CacheError::CacheInUse(self.layout.root().to_path_buf()));
                }
                descriptor.validate()?;
                let mut ov = descriptor;
                ov.init_dataset(levels)?;
                (ov, ColorRegistry::new())
            }
            Mode::Update => self.layout.load()?,
        };

        if !sources.is_empty() {
            if !composition.rgb && !composition.ir {
                return Err(CacheError::Config("no RGB or IR input given".into()));
            }
            if let Some(existing) = overviews.composition() {
                if existing != composition {
                    return Err(CacheError::CompositionMismatch {
                        cache: existing.label().into(),
                        update: composition.label().into(),
                    });
                }
            }
        }

        let pool = self.pool()?;
        let graph = self.connect_checked()?;
        let mut report = RunReport::default();

        let selected = self.select(sources, &overviews, graph.as_ref(), &mut report);
        info!(
            "{} image(s) to process, {} skipped",
            selected.len(),
            report.skipped.len()
        );

        // Fan-out 1: workers see a read-only snapshot of the metadata.
        let finest = overviews.finest_level();
        let progress = Progress::new("cut", selected.len());
        let snapshot = &overviews;
        let cuts: Vec<(&SourceSpec, Acquisition, Result<Ingested>)> = pool.install(|| {
            selected
                .into_par_iter()
                .map(|(spec, acq)| {
                    let result = self.ingest(spec, composition, finest, snapshot);
                    progress.tick();
                    (spec, acq, result)
                })
                .collect()
        });

        // Merge, in identifier order.
        let mut changes = ChangeSet::new();
        for (spec, acq, result) in cuts {
            let ingested = match result {
                Ok(i) => i,
                Err(e) => {
                    warn!("image {}: {e}", spec.id);
                    report.image_failures.push((spec.id.clone(), e));
                    continue;
                }
            };
            if let Err(e) = accumulate(&mut overviews, &ingested.footprint, &spec.id, &mut changes) {
                report.image_failures.push((spec.id.clone(), e));
                continue;
            }
            let color = match overviews.color_of(&spec.id) {
                Some(c) => c,
                None => colors.assign(&spec.id, rng),
            };
            overviews.list_opi.insert(
                spec.id.clone(),
                OpiEntry {
                    color,
                    date: acq.date,
                    time_ut: acq.time_ut,
                    with_rgb: composition.rgb,
                    with_ir: composition.ir,
                },
            );
            report.added.push(spec.id.clone());
        }

        // Fan-out 2.
        self.regenerate(&overviews, &changes, &pool, &mut report);

        self.layout.save(&overviews, &colors)?;
        if self.options.prune_orphans {
            report.pruned = prune_orphans(&self.layout, &overviews)?.len();
        }
        report.log_summary();
        Ok(report)
    }

    /// Images to cut, with their acquisition metadata, in identifier order.
    fn select<'s>(
        &self,
        sources: &'s [SourceSpec],
        overviews: &Overviews,
        graph: &dyn GraphStore,
        report: &mut RunReport,
    ) -> Vec<(&'s SourceSpec, Acquisition)> {
        let mut specs: Vec<&SourceSpec> = sources.iter().collect();
        specs.sort_by(|a, b| a.id.cmp(&b.id));
        specs.dedup_by(|a, b| {
            let dup = a.id == b.id;
            if dup {
                warn!("image {} given twice, keeping the first", a.id);
            }
            dup
        });

        let mut selected = Vec::with_capacity(specs.len());
        for spec in specs {
            if overviews.is_registered(&spec.id) && !self.options.reprocess {
                info!("image {} already in the cache, skipped", spec.id);
                report.skipped.push(spec.id.clone());
                continue;
            }
            match graph.acquisition(&spec.id) {
                Ok(Some(acq)) => selected.push((spec, acq)),
                Ok(None) => {
                    warn!("image {} is not in the graph, skipped", spec.id);
                    report.skipped.push(spec.id.clone());
                }
                Err(e) => report.image_failures.push((spec.id.clone(), e)),
            }
        }
        selected
    }

    /// Worker body for one image: load, compute its slabs, cut the finest level.
    fn ingest(
        &self,
        spec: &SourceSpec,
        composition: Composition,
        level: u32,
        overviews: &Overviews,
    ) -> Result<Ingested> {
        let image = SourceImage::load(spec, composition)?;
        let footprint = image.footprint();
        let boxes = slab_box(&footprint, overviews, &image.id)?;
        let slabs = boxes
            .get(&level)
            .map(|lb| lb.slabs)
            .ok_or(CacheError::OutsideGrid {
                image: image.id.clone(),
                level,
            })?;
        cut(&image, level, &slabs, overviews, &self.layout, self.resampler.as_ref())?;
        Ok(Ingested { footprint })
    }

    /// Rebuilds every slab of `changes`, finest level first: the finest level
    /// by compositing, coarser ones from their children. Slabs of one level
    /// run in parallel.
    fn regenerate(
        &self,
        overviews: &Overviews,
        changes: &ChangeSet,
        pool: &ThreadPool,
        report: &mut RunReport,
    ) {
        let levels = overviews.computed_levels();
        for level in changes.levels_descending().filter(|&l| levels.contains(l)) {
            let cells: Vec<(u32, u32)> = changes.slabs(level).collect();
            let finest = level == levels.max;
            let progress = Progress::new(if finest { "composite" } else { "coarsen" }, cells.len());

            let results: Vec<(SlabKey, Result<SlabOutcome>)> = pool.install(|| {
                cells
                    .par_iter()
                    .map(|&(x, y)| {
                        let result = if finest {
                            // One short-lived graph handle per task.
                            self.connector
                                .connect()
                                .and_then(|g| composite(level, x, y, overviews, &self.layout, g.as_ref()))
                        } else {
                            coarsen(level, x, y, overviews, &self.layout)
                        };
                        progress.tick();
                        (SlabKey { level, x, y }, result)
                    })
                    .collect()
            });

            for (key, result) in results {
                report.record_slab(key, result);
            }
        }
    }

    /// Rebuilds slabs `[xmin, xmax] × [ymin, ymax]` of `level`, and with
    /// `cascade` every coarser slab above them.
    pub fn regenerate_range(&self, level: u32, slabs: IndexRange, cascade: bool) -> Result<RunReport> {
        let (overviews, _colors) = self.layout.load()?;
        let levels = overviews.computed_levels();
        if !levels.contains(level) {
            return Err(CacheError::Config(format!(
                "level {level} outside the cache levels {}..={}",
                levels.min, levels.max
            )));
        }
        if !slabs.is_addressable() {
            return Err(CacheError::Config(format!("invalid slab range {slabs:?}")));
        }

        let mut changes = ChangeSet::new();
        changes.mark_range(level, &slabs);
        if cascade {
            changes.mark_ancestors(level, levels.min);
        }

        let pool = self.pool()?;
        self.connect_checked()?;
        let mut report = RunReport::default();
        self.regenerate(&overviews, &changes, &pool, &mut report);
        if self.options.prune_orphans {
            report.pruned = prune_orphans(&self.layout, &overviews)?.len();
        }
        report.log_summary();
        Ok(report)
    }

    /// Applies `patch` to the finest level, then re-coarsens every level above
    /// the modified slabs.
    pub fn apply_patch(&self, patch: &Patch) -> Result<RunReport> {
        let (overviews, _colors) = self.layout.load()?;
        let (image_id, color) = resolve_owner(patch, &overviews)?;
        let levels = overviews.computed_levels();
        let finest = levels.max;

        let mut report = RunReport::default();
        let Some(range) = patch_slabs(patch, &overviews) else {
            warn!("patch for {image_id} covers no slab");
            return Ok(report);
        };
        // Recorded first so that any later recomposite reproduces the patch.
        self.connect_checked()?.reassign(&image_id, &patch.polygons)?;

        let cells: Vec<(u32, u32)> = range.cells().collect();
        let pool = self.pool()?;

        let results: Vec<(SlabKey, Result<bool>)> = pool.install(|| {
            cells
                .par_iter()
                .map(|&(x, y)| {
                    let r = patch_slab(patch, (&image_id, color), x, y, &overviews, &self.layout);
                    (SlabKey { level: finest, x, y }, r)
                })
                .collect()
        });

        let mut changes = ChangeSet::new();
        for (key, result) in results {
            match result {
                Ok(true) => {
                    changes.mark(key.level, key.x, key.y);
                    report.slabs_written += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("slab {key}: {e}");
                    report.slab_failures.push((key, e));
                }
            }
        }

        changes.mark_ancestors(finest, levels.min);
        changes.remove_level(finest);
        self.regenerate(&overviews, &changes, &pool, &mut report);
        report.log_summary();
        Ok(report)
    }
}
