use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use opicache::graph::parse_features;
use opicache::{
    default_processors, identify, pair_sources, verify, CacheLayout, CacheUpdater, Composition,
    GeoJsonConnector, IndexRange, LevelRange, Mode, Overviews, Patch, RunOptions, RunReport,
};

#[derive(Parser, Debug)]
#[command(name = "opi2cache", version, about = "Build and maintain ortho/graph mosaic caches")]
struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace). RUST_LOG wins when set.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a cache from a pyramid descriptor and ingest images.
    Create {
        #[command(flatten)]
        run: RunArgs,

        /// Pyramid descriptor (JSON).
        #[arg(long)]
        descriptor: PathBuf,

        /// Restrict computed levels to MIN [MAX].
        #[arg(long, num_args = 1..=2, value_names = ["MIN", "MAX"])]
        level: Vec<u32>,

        /// Seed for color assignment.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Ingest new images into an existing cache.
    Update {
        #[command(flatten)]
        run: RunArgs,

        /// Cut images again even if already registered.
        #[arg(long, default_value_t = false)]
        reprocess: bool,

        #[arg(long)]
        seed: Option<u64>,
    },
    /// Rebuild ortho/graph slabs of one level.
    Regen {
        #[command(flatten)]
        conn: ConnArgs,

        #[arg(long)]
        level: u32,

        /// Inclusive slab range.
        #[arg(long, num_args = 4, value_names = ["XMIN", "YMIN", "XMAX", "YMAX"], allow_negative_numbers = true)]
        slabs: Vec<i64>,

        /// Also rebuild every coarser slab above the range.
        #[arg(long, default_value_t = false)]
        cascade: bool,

        #[arg(long, default_value_t = false)]
        prune_orphans: bool,
    },
    /// Apply a GeoJSON ownership patch to the finest level.
    Patch {
        #[command(flatten)]
        conn: ConnArgs,

        /// FeatureCollection of polygons owned by one registered image.
        patch: PathBuf,
    },
    /// Print the image owning the mosaic at a ground point.
    Identify {
        #[arg(long)]
        cache: PathBuf,

        #[arg(allow_negative_numbers = true)]
        x: f64,

        #[arg(allow_negative_numbers = true)]
        y: f64,
    },
    /// Check metadata consistency and look for empty files.
    Verify {
        #[arg(long)]
        cache: PathBuf,
    },
}

/// Cache location, graph store and worker count.
#[derive(Args, Debug)]
struct ConnArgs {
    #[arg(long)]
    cache: PathBuf,

    /// Graph store (GeoJSON FeatureCollection).
    #[arg(long, env = "OPICACHE_GRAPH")]
    graph: PathBuf,

    /// Worker threads (default: available parallelism - 1).
    #[arg(long, env = "OPICACHE_PROCESSORS")]
    processors: Option<usize>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    conn: ConnArgs,

    /// Glob pattern(s) of RGB source images.
    #[arg(long)]
    rgb: Vec<String>,

    /// Glob pattern(s) of infrared source images.
    #[arg(long)]
    ir: Vec<String>,

    /// Delete opi artifacts of unregistered images after the run.
    #[arg(long, default_value_t = false)]
    prune_orphans: bool,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

/// Expands every pattern; files are returned sorted and deduplicated.
fn expand_globs(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for pattern in patterns {
        let mut matched = 0usize;
        for entry in glob::glob(pattern).with_context(|| format!("invalid pattern {pattern}"))? {
            let path = entry.with_context(|| format!("reading matches of {pattern}"))?;
            if path.is_file() {
                out.push(path);
                matched += 1;
            }
        }
        if matched == 0 {
            warn!("pattern {pattern} matches no file");
        }
    }
    out.sort();
    out.dedup();
    Ok(out)
}

fn updater(conn: &ConnArgs, reprocess: bool, prune_orphans: bool) -> Result<CacheUpdater> {
    let connector = GeoJsonConnector::open(&conn.graph)
        .with_context(|| format!("opening graph store {}", conn.graph.display()))?;
    let options = RunOptions {
        processors: conn.processors.unwrap_or_else(default_processors),
        reprocess,
        prune_orphans,
    };
    Ok(CacheUpdater::new(CacheLayout::new(&conn.cache), Arc::new(connector)).with_options(options))
}

fn rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}

fn load_descriptor(path: &Path, level: &[u32]) -> Result<(Overviews, Option<LevelRange>)> {
    let text = fs::read_to_string(path).with_context(|| format!("reading descriptor {}", path.display()))?;
    let descriptor =
        Overviews::from_json(&text).with_context(|| format!("parsing descriptor {}", path.display()))?;
    let levels = match level {
        [] => None,
        [min] => Some(LevelRange {
            min: *min,
            max: descriptor.level.max,
        }),
        [min, max, ..] => Some(LevelRange { min: *min, max: *max }),
    };
    Ok((descriptor, levels))
}

fn ingest(run: &RunArgs, updater: &CacheUpdater, mode: Mode, seed: Option<u64>) -> Result<RunReport> {
    let rgb = expand_globs(&run.rgb)?;
    let ir = expand_globs(&run.ir)?;
    let composition = Composition {
        rgb: !run.rgb.is_empty(),
        ir: !run.ir.is_empty(),
    };
    let sources = pair_sources(&rgb, &ir);
    info!("{} source image(s) found ({})", sources.len(), composition.label());

    let report = updater
        .run(mode, &sources, composition, &mut rng(seed))
        .with_context(|| format!("cache {}", run.conn.cache.display()))?;
    Ok(report)
}

fn finish(report: RunReport) -> Result<()> {
    if report.has_failures() {
        bail!(
            "{} image(s) and {} slab(s) failed",
            report.image_failures.len(),
            report.slab_failures.len()
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Create {
            run,
            descriptor,
            level,
            seed,
        } => {
            let (descriptor, levels) = load_descriptor(&descriptor, &level)?;
            let updater = updater(&run.conn, false, run.prune_orphans)?;
            let report = ingest(&run, &updater, Mode::Create { descriptor, levels }, seed)?;
            finish(report)
        }
        Command::Update { run, reprocess, seed } => {
            let updater = updater(&run.conn, reprocess, run.prune_orphans)?;
            let report = ingest(&run, &updater, Mode::Update, seed)?;
            finish(report)
        }
        Command::Regen {
            conn,
            level,
            slabs,
            cascade,
            prune_orphans,
        } => {
            let &[min_col, min_row, max_col, max_row] = slabs.as_slice() else {
                bail!("--slabs takes XMIN YMIN XMAX YMAX");
            };
            let range = IndexRange {
                min_col,
                min_row,
                max_col,
                max_row,
            };
            let report = updater(&conn, false, prune_orphans)?
                .regenerate_range(level, range, cascade)
                .with_context(|| format!("regenerating level {level} of {}", conn.cache.display()))?;
            finish(report)
        }
        Command::Patch { conn, patch } => {
            let text = fs::read_to_string(&patch).with_context(|| format!("reading patch {}", patch.display()))?;
            let patch = Patch::from_features(parse_features(&text)?)?;
            let report = updater(&conn, false, false)?
                .apply_patch(&patch)
                .with_context(|| format!("patching {}", conn.cache.display()))?;
            finish(report)
        }
        Command::Identify { cache, x, y } => {
            let layout = CacheLayout::new(&cache);
            let (overviews, colors) = layout.load()?;
            println!("{}", identify(x, y, &overviews, &colors, &layout)?);
            Ok(())
        }
        Command::Verify { cache } => {
            let issues = verify(&CacheLayout::new(&cache))?;
            for issue in &issues {
                println!("{issue}");
            }
            if !issues.is_empty() {
                bail!("{} issue(s) in {}", issues.len(), cache.display());
            }
            println!("{}: ok", cache.display());
            Ok(())
        }
    }
}
