//! Ownership graph: which image owns which ground polygons.
//!
//! [`GraphStore`] is the query and edit seam, [`GraphConnector`] hands out
//! one handle per task. Features are ordered: where two overlap, the later
//! one owns the area, so a patch is recorded by appending its polygons. The
//! bundled backend reads a GeoJSON FeatureCollection whose features carry the
//! owning image in the `cliche` property, and writes patches back to it.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use log::{debug, info, warn};
use rstar::{RTree, RTreeObject, AABB};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{CacheError, Result};
use crate::geo::BBox;
use crate::layout::temp_sibling;

/// Owner property of graph features.
pub const OWNER_FIELD: &str = "cliche";

/// Closed or open ring of ground coordinates.
pub type Ring = Vec<[f64; 2]>;
/// Exterior ring first, then holes.
pub type Polygon = Vec<Ring>;

/// Canonical form used whenever two image identifiers are compared: trimmed,
/// without a leading `OPI_`, with the infrared marker `_ix` folded to `x`.
pub fn normalize_image_id(id: &str) -> String {
    let id = id.trim();
    let id = id.strip_prefix("OPI_").unwrap_or(id);
    id.replace("_ix", "x")
}

/// Acquisition metadata recorded in `list_OPI`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acquisition {
    /// `YYYY-MM-DD`
    pub date: Option<String>,
    /// `HH:MM`
    pub time_ut: Option<String>,
}

impl Acquisition {
    /// From the graph's `date` (`YYYY/MM/DD`) and `heure_tu` (`HHhMM`).
    pub fn from_raw(date: Option<&str>, heure_tu: Option<&str>) -> Self {
        Self {
            date: date.map(|d| d.trim().replace('/', "-")),
            time_ut: heure_tu.map(|t| t.trim().replace('h', ":")),
        }
    }
}

pub trait GraphStore: Send + Sync {
    /// Features whose envelope intersects `envelope`, in precedence order.
    fn features_in(&self, envelope: &BBox) -> Result<Vec<GraphFeature>>;

    /// `None` when the image owns nothing in the graph.
    fn acquisition(&self, image_id: &str) -> Result<Option<Acquisition>>;

    /// Hands the area of `polygons` to `image_id`, above every existing
    /// feature.
    fn reassign(&self, image_id: &str, polygons: &[Polygon]) -> Result<()>;

    /// Polygons owned by `image_id` that intersect `envelope`.
    fn owned_polygons(&self, image_id: &str, envelope: &BBox) -> Result<Vec<Polygon>> {
        let key = normalize_image_id(image_id);
        Ok(self
            .features_in(envelope)?
            .into_iter()
            .filter(|f| normalize_image_id(&f.owner) == key)
            .flat_map(|f| f.polygons)
            .collect())
    }
}

/// Opens store handles. Called once per task; handles are short-lived.
pub trait GraphConnector: Send + Sync {
    fn connect(&self) -> Result<Arc<dyn GraphStore>>;
}

/// One graph feature.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphFeature {
    /// Owner as written in the graph (not normalized).
    pub owner: String,
    pub polygons: Vec<Polygon>,
    pub acquisition: Acquisition,
    /// Written by a patch (`"patch": true`).
    pub patch: bool,
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    features: Vec<RawFeature>,
}

#[derive(Debug, Deserialize)]
struct RawFeature {
    geometry: Option<RawGeometry>,
    #[serde(default)]
    properties: Option<serde_json::Map<String, serde_json::Value>>,
}

type Position = Vec<f64>;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum RawGeometry {
    Polygon { coordinates: Vec<Vec<Position>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Position>>> },
    #[serde(other)]
    Unsupported,
}

fn to_polygon(rings: Vec<Vec<Position>>) -> Polygon {
    rings
        .into_iter()
        .map(|ring| {
            ring.into_iter()
                .filter(|p| p.len() >= 2)
                .map(|p| [p[0], p[1]])
                .collect()
        })
        .collect()
}

fn property<'a>(props: &'a serde_json::Map<String, serde_json::Value>, key: &str) -> Option<&'a str> {
    props.get(key).and_then(|v| v.as_str())
}

/// Parses a GeoJSON FeatureCollection. Features without an owner or without
/// polygon geometry are skipped with a warning.
pub fn parse_features(text: &str) -> Result<Vec<GraphFeature>> {
    Ok(collect_features(serde_json::from_str(text)?))
}

fn collect_features(fc: FeatureCollection) -> Vec<GraphFeature> {
    let mut out = Vec::with_capacity(fc.features.len());

    for (i, raw) in fc.features.into_iter().enumerate() {
        let props = raw.properties.unwrap_or_default();
        let Some(owner) = property(&props, OWNER_FIELD) else {
            warn!("graph feature #{i} has no `{OWNER_FIELD}` property, skipped");
            continue;
        };
        let polygons = match raw.geometry {
            Some(RawGeometry::Polygon { coordinates }) => vec![to_polygon(coordinates)],
            Some(RawGeometry::MultiPolygon { coordinates }) => {
                coordinates.into_iter().map(to_polygon).collect()
            }
            _ => {
                warn!("graph feature #{i} ({owner}) is not a polygon, skipped");
                continue;
            }
        };
        out.push(GraphFeature {
            owner: owner.to_owned(),
            polygons,
            acquisition: Acquisition::from_raw(
                property(&props, "date"),
                property(&props, "heure_tu"),
            ),
            patch: props.get("patch").and_then(Value::as_bool).unwrap_or(false),
        });
    }
    out
}

#[derive(Debug, Clone)]
struct FeatureBox {
    idx: usize,
    env: AABB<[f64; 2]>,
}

impl RTreeObject for FeatureBox {
    type Envelope = AABB<[f64; 2]>;

    #[inline]
    fn envelope(&self) -> Self::Envelope {
        self.env
    }
}

struct GraphIndex {
    features: Vec<GraphFeature>,
    /// Normalized owner per feature.
    owners: Vec<String>,
    by_owner: HashMap<String, Vec<usize>>,
    tree: RTree<FeatureBox>,
}

impl GraphIndex {
    fn push(&mut self, feature: GraphFeature) {
        let idx = self.features.len();
        let owner = normalize_image_id(&feature.owner);
        if let Some(bbox) = BBox::from_points(feature.polygons.iter().flatten().flatten()) {
            self.tree.insert(FeatureBox {
                idx,
                env: AABB::from_corners(bbox.lower, bbox.upper),
            });
        }
        self.by_owner.entry(owner.clone()).or_default().push(idx);
        self.owners.push(owner);
        self.features.push(feature);
    }
}

/// GeoJSON file to write patches back to.
struct Backing {
    path: PathBuf,
    /// The parsed file, so that properties the engine ignores survive a
    /// rewrite.
    doc: Value,
}

/// In-memory graph indexed by feature envelope.
pub struct GeoJsonGraph {
    index: RwLock<GraphIndex>,
    backing: Option<RwLock<Backing>>,
}

impl GeoJsonGraph {
    /// In-memory only; patches are not persisted.
    pub fn from_features(features: Vec<GraphFeature>) -> Self {
        let owners: Vec<String> = features.iter().map(|f| normalize_image_id(&f.owner)).collect();

        let mut by_owner: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, owner) in owners.iter().enumerate() {
            by_owner.entry(owner.clone()).or_default().push(idx);
        }

        let boxes: Vec<FeatureBox> = features
            .iter()
            .enumerate()
            .filter_map(|(idx, f)| {
                let bbox = BBox::from_points(f.polygons.iter().flatten().flatten())?;
                Some(FeatureBox {
                    idx,
                    env: AABB::from_corners(bbox.lower, bbox.upper),
                })
            })
            .collect();

        Self {
            index: RwLock::new(GraphIndex {
                features,
                owners,
                by_owner,
                tree: RTree::bulk_load(boxes),
            }),
            backing: None,
        }
    }

    /// Reads `path`; patches are appended to it.
    pub fn open(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let doc: Value = serde_json::from_str(&text)?;
        let features = collect_features(FeatureCollection::deserialize(&doc)?);
        debug!("{}: {} graph features", path.display(), features.len());

        let mut graph = Self::from_features(features);
        graph.backing = Some(RwLock::new(Backing {
            path: path.to_path_buf(),
            doc,
        }));
        Ok(graph)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, GraphIndex>> {
        self.index.read().map_err(|_| poisoned())
    }

    pub fn len(&self) -> usize {
        self.read().map_or(0, |i| i.features.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> CacheError {
    CacheError::Graph("graph index lock poisoned".into())
}

/// Appends `feature` to the file behind `backing` through a temp file and a
/// rename.
fn persist(backing: &mut Backing, feature: Value) -> Result<()> {
    let mut doc = backing.doc.clone();
    let features = doc
        .get_mut("features")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| CacheError::Graph(format!("{}: no features array", backing.path.display())))?;
    features.push(feature);

    let tmp = temp_sibling(&backing.path);
    fs::write(&tmp, serde_json::to_vec_pretty(&doc)?)?;
    if let Err(e) = fs::rename(&tmp, &backing.path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    backing.doc = doc;
    Ok(())
}

impl GraphStore for GeoJsonGraph {
    fn features_in(&self, envelope: &BBox) -> Result<Vec<GraphFeature>> {
        let index = self.read()?;
        let query = AABB::from_corners(envelope.lower, envelope.upper);

        let mut hits: Vec<usize> = index
            .tree
            .locate_in_envelope_intersecting(&query)
            .map(|fb| fb.idx)
            .collect();
        hits.sort_unstable();

        Ok(hits.into_iter().map(|idx| index.features[idx].clone()).collect())
    }

    fn acquisition(&self, image_id: &str) -> Result<Option<Acquisition>> {
        let index = self.read()?;
        Ok(index
            .by_owner
            .get(&normalize_image_id(image_id))
            .and_then(|ids| ids.first())
            .map(|&idx| index.features[idx].acquisition.clone()))
    }

    fn reassign(&self, image_id: &str, polygons: &[Polygon]) -> Result<()> {
        if let Some(backing) = &self.backing {
            let mut backing = backing.write().map_err(|_| poisoned())?;
            let feature = json!({
                "type": "Feature",
                "properties": { OWNER_FIELD: image_id, "patch": true },
                "geometry": { "type": "MultiPolygon", "coordinates": polygons },
            });
            persist(&mut backing, feature)?;
            info!("{}: {} polygon(s) reassigned to {image_id}", backing.path.display(), polygons.len());
        }

        self.index.write().map_err(|_| poisoned())?.push(GraphFeature {
            owner: image_id.to_owned(),
            polygons: polygons.to_vec(),
            acquisition: Acquisition::default(),
            patch: true,
        });
        Ok(())
    }
}

/// Connector over a GeoJSON graph file parsed once; every handle shares it.
#[derive(Clone)]
pub struct GeoJsonConnector {
    graph: Arc<GeoJsonGraph>,
}

impl GeoJsonConnector {
    /// An unreadable graph is a configuration error.
    pub fn open(path: &Path) -> Result<Self> {
        let graph = GeoJsonGraph::open(path).map_err(|e| {
            CacheError::Config(format!("graph store {} unreachable: {e}", path.display()))
        })?;
        Ok(Self::new(graph))
    }

    pub fn new(graph: GeoJsonGraph) -> Self {
        Self {
            graph: Arc::new(graph),
        }
    }
}

impl GraphConnector for GeoJsonConnector {
    fn connect(&self) -> Result<Arc<dyn GraphStore>> {
        Ok(self.graph.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRAPH: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {"type": "Feature",
             "properties": {"cliche": "OPI_19FD_ix00020", "date": "2019/06/12", "heure_tu": "10h42"},
             "geometry": {"type": "Polygon", "coordinates": [[[0,0],[10,0],[10,10],[0,10],[0,0]]]}},
            {"type": "Feature",
             "properties": {"cliche": "B"},
             "geometry": {"type": "MultiPolygon", "coordinates": [
                [[[20,0,5],[30,0,5],[30,10,5],[20,0,5]]],
                [[[40,0],[50,0],[50,10],[40,0]]]
             ]}},
            {"type": "Feature", "properties": {"cliche": "C"},
             "geometry": {"type": "Point", "coordinates": [1, 2]}},
            {"type": "Feature", "properties": {},
             "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,0]]]}}
        ]
    }"#;

    #[test]
    fn normalization() {
        assert_eq!(normalize_image_id(" OPI_19FD_ix00020 "), "19FDx00020");
        assert_eq!(normalize_image_id("19FDx00020"), "19FDx00020");
        assert_eq!(normalize_image_id("OPI_A"), normalize_image_id("A"));
    }

    #[test]
    fn parse_keeps_polygons_only() {
        let features = parse_features(GRAPH).unwrap();
        assert_eq!(features.len(), 2);
        assert_eq!(features[1].polygons.len(), 2);
        assert_eq!(features[1].polygons[0][0][1], [30.0, 0.0]);
    }

    #[test]
    fn queries_match_normalized_owner_and_envelope() {
        let g = GeoJsonGraph::from_features(parse_features(GRAPH).unwrap());
        let everywhere = BBox::new(-100.0, -100.0, 100.0, 100.0);

        let a = g.owned_polygons("19FDx00020", &everywhere).unwrap();
        assert_eq!(a.len(), 1);

        let b = g.owned_polygons("B", &BBox::new(0.0, 0.0, 12.0, 12.0)).unwrap();
        assert!(b.is_empty());
        let b = g.owned_polygons("B", &everywhere).unwrap();
        assert_eq!(b.len(), 2);

        let acq = g.acquisition("OPI_19FD_ix00020").unwrap().unwrap();
        assert_eq!(acq.date.as_deref(), Some("2019-06-12"));
        assert_eq!(acq.time_ut.as_deref(), Some("10:42"));
        assert!(g.acquisition("C").unwrap().is_none());
    }

    #[test]
    fn reassignment_is_appended_and_written_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.geojson");
        fs::write(&path, GRAPH).unwrap();

        let g = GeoJsonGraph::open(&path).unwrap();
        let square: Polygon = vec![vec![[2.0, 2.0], [4.0, 2.0], [4.0, 4.0], [2.0, 4.0]]];
        g.reassign("B", &[square.clone()]).unwrap();
        assert_eq!(g.len(), 3);

        let hits = g.features_in(&BBox::new(0.0, 0.0, 5.0, 5.0)).unwrap();
        let owners: Vec<&str> = hits.iter().map(|f| f.owner.as_str()).collect();
        assert_eq!(owners, ["OPI_19FD_ix00020", "B"]);
        assert!(hits[1].patch && !hits[0].patch);
        // Acquisition still comes from the original feature.
        assert_eq!(g.acquisition("B").unwrap(), Some(Acquisition::default()));

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"type\": \"Point\""));
        let reread = parse_features(&text).unwrap();
        assert_eq!(reread.len(), 3);
        assert_eq!(reread[2].owner, "B");
        assert!(reread[2].patch);
        assert_eq!(reread[2].polygons, vec![square]);
    }

    #[test]
    fn in_memory_reassignment_is_not_persisted() {
        let g = GeoJsonGraph::from_features(Vec::new());
        g.reassign("A", &[vec![vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]]]]).unwrap();
        assert_eq!(g.owned_polygons("A", &BBox::new(0.0, 0.0, 1.0, 1.0)).unwrap().len(), 1);
    }

    #[test]
    fn unreadable_graph_is_fatal() {
        let err = GeoJsonConnector::open(Path::new("/nonexistent/graph.geojson"))
            .err()
            .unwrap();
        assert!(err.is_fatal());
    }
}
