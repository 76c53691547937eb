//! Graph export: segments + derived weights → the textual node/way
//! document consumed by the first compiler stage.
//!
//! Output must be reproducible: two export runs over the same logical
//! input produce byte-identical documents. The store does not guarantee
//! stable row order, so the exporter sorts segments by id itself before
//! assigning node ids — determinism is a property of this module, not of
//! whatever order rows happened to arrive in.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use courier_common::{GraphError, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ingest::RoadNetwork;
use crate::model::{Road, RoadSegment};
use crate::weights::DerivedWeight;

/// Coordinate quantum: 1e-7 degrees, about a centimeter. Points closer
/// than this collapse into one node.
const COORD_SCALE: f64 = 10_000_000.0;

/// First identifier of the private id space for nodes that have no
/// platform-assigned identifier. Keeps synthetic ids clear of real ones.
const SYNTHETIC_ID_BASE: i64 = 10_000_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExportStats {
    pub nodes: u64,
    pub ways: u64,
    pub skipped_segments: u64,
}

#[derive(Debug)]
pub struct RenderedGraph {
    pub xml: String,
    pub stats: ExportStats,
    pub bbox: BoundingBox,
}

fn quantize(value: f64) -> i64 {
    (value * COORD_SCALE).round() as i64
}

fn coord(value_q: i64) -> String {
    format!("{:.7}", value_q as f64 / COORD_SCALE)
}

/// Total mapping from the platform's administrative road classes to the
/// graph tag vocabulary. Every input maps somewhere; unknowns become
/// "unclassified" rather than failing the export.
pub fn map_road_class(road_type: &str) -> &'static str {
    match road_type.to_ascii_lowercase().as_str() {
        "motorway" | "highway" => "motorway",
        "trunk" | "expressway" => "trunk",
        "primary" | "main" => "primary",
        "secondary" => "secondary",
        "tertiary" | "collector" => "tertiary",
        "residential" | "street" => "residential",
        "service" | "alley" | "access" => "service",
        "living_street" => "living_street",
        "track" | "dirt" => "track",
        _ => "unclassified",
    }
}

fn xml_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Parse segment geometry (JSON array of `[lat, lon]` pairs) into
/// quantized points with consecutive duplicates collapsed. `None` means
/// the segment is unusable and gets skipped, never aborts the run.
fn parse_polyline(geometry: &str) -> Option<Vec<(i64, i64)>> {
    let raw: Vec<[f64; 2]> = serde_json::from_str(geometry).ok()?;
    let mut points: Vec<(i64, i64)> = Vec::with_capacity(raw.len());
    for [lat, lon] in raw {
        if !lat.is_finite() || !lon.is_finite() {
            return None;
        }
        let q = (quantize(lat), quantize(lon));
        if points.last() != Some(&q) {
            points.push(q);
        }
    }
    let mut distinct = points.clone();
    distinct.sort_unstable();
    distinct.dedup();
    if distinct.len() < 2 {
        return None;
    }
    Some(points)
}

struct NodeTable {
    /// quantized (lat, lon) → node id
    by_coord: HashMap<(i64, i64), i64>,
    /// Emission order: first use wins, which is deterministic because
    /// segments are processed in sorted id order.
    emitted: Vec<(i64, i64, i64)>, // (id, lat_q, lon_q)
    emitted_ids: std::collections::HashSet<i64>,
    next_synthetic: i64,
}

impl NodeTable {
    fn new(network: &RoadNetwork) -> Self {
        // Platform-surveyed nodes keep their identifiers; the table is
        // primed with their quantized coordinates but a node is only
        // written once some segment actually references it.
        let mut known = HashMap::new();
        for node in &network.nodes {
            known.insert((quantize(node.lat), quantize(node.lon)), node.id);
        }
        NodeTable {
            by_coord: known,
            emitted: Vec::new(),
            emitted_ids: std::collections::HashSet::new(),
            next_synthetic: SYNTHETIC_ID_BASE,
        }
    }

    fn resolve(&mut self, point: (i64, i64)) -> i64 {
        if let Some(&id) = self.by_coord.get(&point) {
            if self.emitted_ids.insert(id) {
                self.emitted.push((id, point.0, point.1));
            }
            return id;
        }
        let id = self.next_synthetic;
        self.next_synthetic += 1;
        self.by_coord.insert(point, id);
        self.emitted_ids.insert(id);
        self.emitted.push((id, point.0, point.1));
        id
    }
}

struct WayTags {
    highway: &'static str,
    name: Option<String>,
    rating: Option<f64>,
    traffic: f64,
    maxspeed: Option<u32>,
    oneway: bool,
}

fn way_tags(segment: &RoadSegment, road: Option<&Road>, weight: &DerivedWeight) -> WayTags {
    WayTags {
        highway: road
            .map(|r| map_road_class(&r.road_type))
            .unwrap_or("unclassified"),
        name: road.and_then(|r| r.name.clone()),
        rating: weight.rating_factor,
        traffic: weight.traffic_factor,
        maxspeed: segment.speed_limit,
        oneway: segment.one_way || road.map(|r| r.one_way).unwrap_or(false),
    }
}

fn push_way(xml: &mut String, way_id: i64, refs: &[i64], tags: &WayTags) {
    let _ = writeln!(xml, "  <way id=\"{way_id}\">");
    for node_ref in refs {
        let _ = writeln!(xml, "    <nd ref=\"{node_ref}\"/>");
    }
    let _ = writeln!(xml, "    <tag k=\"highway\" v=\"{}\"/>", tags.highway);
    if let Some(name) = &tags.name {
        let _ = writeln!(xml, "    <tag k=\"name\" v=\"{}\"/>", xml_escape(name));
    }
    if let Some(rating) = tags.rating {
        let _ = writeln!(xml, "    <tag k=\"user_rating\" v=\"{rating:.3}\"/>");
    }
    let _ = writeln!(xml, "    <tag k=\"traffic_value\" v=\"{:.1}\"/>", tags.traffic);
    if let Some(maxspeed) = tags.maxspeed {
        let _ = writeln!(xml, "    <tag k=\"maxspeed\" v=\"{maxspeed}\"/>");
    }
    if tags.oneway {
        let _ = writeln!(xml, "    <tag k=\"oneway\" v=\"yes\"/>");
    }
    let _ = writeln!(xml, "  </way>");
}

/// Render the interchange document: bounding-box header, all nodes, all
/// ways, in one pass. One-way segments emit a single directed way;
/// everything else emits the forward way and its exact reversal with an
/// identical tag set — direction asymmetries belong to the profile
/// layer, not the graph.
pub fn render_graph(
    network: &RoadNetwork,
    weights: &HashMap<i64, DerivedWeight>,
) -> Result<RenderedGraph> {
    let mut ordered: Vec<&RoadSegment> = network.segments.iter().collect();
    ordered.sort_by_key(|s| s.id);

    let mut table = NodeTable::new(network);
    let mut stats = ExportStats::default();
    // (refs, tags, emit_reverse)
    let mut ways: Vec<(Vec<i64>, WayTags, bool)> = Vec::with_capacity(ordered.len());

    for segment in ordered {
        let Some(points) = parse_polyline(&segment.geometry) else {
            stats.skipped_segments += 1;
            warn!(segment = segment.id, "skipping segment with unusable geometry");
            continue;
        };
        let refs: Vec<i64> = points.into_iter().map(|p| table.resolve(p)).collect();
        let road = network.roads.get(&segment.road_id);
        let weight = weights.get(&segment.id).copied().unwrap_or(DerivedWeight {
            rating_factor: None,
            traffic_factor: crate::weights::FREE_FLOW_FACTOR,
        });
        let tags = way_tags(segment, road, &weight);
        let reverse = !tags.oneway;
        ways.push((refs, tags, reverse));
    }

    let total = network.segments.len() as u64;
    if stats.skipped_segments * 2 > total {
        return Err(GraphError::Validation(format!(
            "{} of {} segments had unusable geometry; refusing to export a mostly-empty graph",
            stats.skipped_segments, total
        )));
    }

    let mut bbox = BoundingBox {
        min_lat: f64::MAX,
        min_lon: f64::MAX,
        max_lat: f64::MIN,
        max_lon: f64::MIN,
    };
    for (_, lat_q, lon_q) in &table.emitted {
        let lat = *lat_q as f64 / COORD_SCALE;
        let lon = *lon_q as f64 / COORD_SCALE;
        bbox.min_lat = bbox.min_lat.min(lat);
        bbox.min_lon = bbox.min_lon.min(lon);
        bbox.max_lat = bbox.max_lat.max(lat);
        bbox.max_lon = bbox.max_lon.max(lon);
    }

    let mut xml = String::new();
    xml.push_str("<?xml version='1.0' encoding='UTF-8'?>\n");
    xml.push_str("<osm version=\"0.6\" generator=\"courier-graph\">\n");
    let _ = writeln!(
        xml,
        "  <bounds minlat=\"{:.7}\" minlon=\"{:.7}\" maxlat=\"{:.7}\" maxlon=\"{:.7}\"/>",
        bbox.min_lat, bbox.min_lon, bbox.max_lat, bbox.max_lon
    );

    for (id, lat_q, lon_q) in &table.emitted {
        let _ = writeln!(
            xml,
            "  <node id=\"{id}\" lat=\"{}\" lon=\"{}\"/>",
            coord(*lat_q),
            coord(*lon_q)
        );
    }

    let mut way_id = 0i64;
    for (refs, tags, reverse) in &ways {
        way_id += 1;
        push_way(&mut xml, way_id, refs, tags);
        stats.ways += 1;
        if *reverse {
            way_id += 1;
            let reversed: Vec<i64> = refs.iter().rev().copied().collect();
            push_way(&mut xml, way_id, &reversed, tags);
            stats.ways += 1;
        }
    }
    xml.push_str("</osm>\n");

    stats.nodes = table.emitted.len() as u64;
    info!(
        nodes = stats.nodes,
        ways = stats.ways,
        skipped = stats.skipped_segments,
        "graph rendered"
    );
    Ok(RenderedGraph { xml, stats, bbox })
}

/// Render and write the graph document plus its manifest sidecar.
pub fn write_graph(
    path: &Path,
    network: &RoadNetwork,
    weights: &HashMap<i64, DerivedWeight>,
) -> Result<RenderedGraph> {
    let rendered = render_graph(network, weights)?;
    let file = File::create(path)
        .map_err(|e| GraphError::Validation(format!("cannot create {}: {e}", path.display())))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(rendered.xml.as_bytes())
        .and_then(|_| writer.flush())
        .map_err(|e| GraphError::Validation(format!("cannot write {}: {e}", path.display())))?;

    let manifest = GraphManifest::create(path, &rendered.stats, rendered.bbox)?;
    manifest.write(&manifest_path(path))?;
    Ok(rendered)
}

/// Sidecar path for a graph file: `graph.osm` → `graph.manifest.json`.
pub fn manifest_path(graph: &Path) -> PathBuf {
    graph.with_extension("manifest.json")
}

/// Export provenance sidecar: digest, counts, bounding box, timestamp.
#[derive(Debug, Serialize, Deserialize)]
pub struct GraphManifest {
    pub graph_sha256: String,
    pub nodes: u64,
    pub ways: u64,
    pub skipped_segments: u64,
    pub bbox: BoundingBox,
    pub created_at_utc: String,
}

impl GraphManifest {
    pub fn create(graph_path: &Path, stats: &ExportStats, bbox: BoundingBox) -> Result<Self> {
        Ok(GraphManifest {
            graph_sha256: file_sha256(graph_path)?,
            nodes: stats.nodes,
            ways: stats.ways,
            skipped_segments: stats.skipped_segments,
            bbox,
            created_at_utc: crate::store::now_utc(),
        })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .map_err(|e| GraphError::Validation(format!("cannot create {}: {e}", path.display())))?;
        serde_json::to_writer_pretty(file, self)
            .map_err(|e| GraphError::Validation(format!("cannot write manifest: {e}")))
    }

    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| GraphError::Validation(format!("cannot open {}: {e}", path.display())))?;
        serde_json::from_reader(file)
            .map_err(|e| GraphError::Validation(format!("cannot parse manifest: {e}")))
    }

    /// Recompute the graph digest and fail on mismatch.
    pub fn verify(&self, graph_path: &Path) -> Result<()> {
        let actual = file_sha256(graph_path)?;
        if actual != self.graph_sha256 {
            return Err(GraphError::Validation(format!(
                "graph digest mismatch for {}: manifest {}, actual {}",
                graph_path.display(),
                self.graph_sha256,
                actual
            )));
        }
        Ok(())
    }
}

fn file_sha256(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};

    let mut file = File::open(path)
        .map_err(|e| GraphError::Validation(format!("cannot open {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let n = file
            .read(&mut buffer)
            .map_err(|e| GraphError::Validation(format!("cannot read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Road, RoadNode};
    use std::collections::HashMap;

    fn road(id: i64, road_type: &str, one_way: bool) -> Road {
        Road {
            id,
            name: Some("Bergmannstraße".to_string()),
            road_type: road_type.to_string(),
            one_way,
        }
    }

    fn segment(id: i64, road_id: i64, geometry: &str, one_way: bool) -> RoadSegment {
        RoadSegment {
            id,
            road_id,
            geometry: geometry.to_string(),
            one_way,
            speed_limit: None,
            feedback: Vec::new(),
            traffic: None,
        }
    }

    fn network(roads: Vec<Road>, nodes: Vec<RoadNode>, segments: Vec<RoadSegment>) -> RoadNetwork {
        RoadNetwork {
            roads: roads.into_iter().map(|r| (r.id, r)).collect(),
            nodes,
            segments,
        }
    }

    fn weights_for(network: &RoadNetwork) -> HashMap<i64, crate::weights::DerivedWeight> {
        crate::weights::resolve_all(&network.segments)
    }

    #[test]
    fn road_class_mapping_is_total() {
        assert_eq!(map_road_class("MOTORWAY"), "motorway");
        assert_eq!(map_road_class("Main"), "primary");
        assert_eq!(map_road_class("residential"), "residential");
        assert_eq!(map_road_class(""), "unclassified");
        assert_eq!(map_road_class("hyperloop"), "unclassified");
    }

    #[test]
    fn mixed_scenario_way_and_node_counts() {
        // One one-way, one bidirectional, one with unparsable geometry:
        // 1 + 2 + 0 = 3 ways; nodes = distinct quantized coords of the
        // two valid segments.
        let net = network(
            vec![road(10, "residential", false)],
            vec![],
            vec![
                segment(1, 10, "[[52.50,13.40],[52.51,13.41]]", true),
                segment(2, 10, "[[52.51,13.41],[52.52,13.42],[52.53,13.43]]", false),
                segment(3, 10, "not json at all", false),
            ],
        );
        let weights = weights_for(&net);
        let rendered = render_graph(&net, &weights).unwrap();
        assert_eq!(rendered.stats.ways, 3);
        assert_eq!(rendered.stats.skipped_segments, 1);
        // 52.50/13.40, 52.51/13.41 (shared), 52.52/13.42, 52.53/13.43
        assert_eq!(rendered.stats.nodes, 4);
    }

    #[test]
    fn bidirectional_segments_emit_exact_reversals_with_identical_tags() {
        let net = network(
            vec![road(10, "secondary", false)],
            vec![],
            vec![segment(1, 10, "[[52.50,13.40],[52.51,13.41],[52.52,13.42]]", false)],
        );
        let weights = weights_for(&net);
        let rendered = render_graph(&net, &weights).unwrap();

        let ways: Vec<&str> = rendered.xml.split("<way ").skip(1).collect();
        assert_eq!(ways.len(), 2);
        let refs = |way: &str| -> Vec<String> {
            way.lines()
                .filter(|l| l.contains("<nd"))
                .map(|l| l.trim().to_string())
                .collect()
        };
        let tags = |way: &str| -> Vec<String> {
            way.lines()
                .filter(|l| l.contains("<tag"))
                .map(|l| l.trim().to_string())
                .collect()
        };
        let forward = refs(ways[0]);
        let mut backward = refs(ways[1]);
        backward.reverse();
        assert_eq!(forward, backward);
        assert_eq!(tags(ways[0]), tags(ways[1]));
        assert!(forward.len() >= 2);
    }

    #[test]
    fn one_way_flag_is_inherited_from_the_parent_road() {
        let net = network(
            vec![road(10, "primary", true)],
            vec![],
            vec![segment(1, 10, "[[52.50,13.40],[52.51,13.41]]", false)],
        );
        let weights = weights_for(&net);
        let rendered = render_graph(&net, &weights).unwrap();
        assert_eq!(rendered.stats.ways, 1);
        assert!(rendered.xml.contains("<tag k=\"oneway\" v=\"yes\"/>"));
    }

    #[test]
    fn degenerate_geometry_is_skipped_not_fatal() {
        let net = network(
            vec![road(10, "residential", false)],
            vec![],
            vec![
                segment(1, 10, "[[52.50,13.40],[52.51,13.41]]", false),
                // Same point repeated: fewer than 2 distinct coordinates.
                segment(2, 10, "[[52.50,13.40],[52.50,13.40]]", false),
                // Sub-quantum jitter collapses to one point too.
                segment(3, 10, "[[52.50,13.40],[52.5000000004,13.4000000004]]", false),
            ],
        );
        let weights = weights_for(&net);
        let rendered = render_graph(&net, &weights).unwrap();
        assert_eq!(rendered.stats.skipped_segments, 2);
        assert_eq!(rendered.stats.ways, 2);
        // Every emitted way still has at least 2 node refs.
        for way in rendered.xml.split("<way ").skip(1) {
            let nd_count = way.lines().filter(|l| l.contains("<nd")).count();
            assert!(nd_count >= 2);
        }
    }

    #[test]
    fn mostly_unparsable_networks_fail_validation() {
        let net = network(
            vec![road(10, "residential", false)],
            vec![],
            vec![
                segment(1, 10, "[[52.50,13.40],[52.51,13.41]]", false),
                segment(2, 10, "nope", false),
                segment(3, 10, "also nope", false),
            ],
        );
        let weights = weights_for(&net);
        let err = render_graph(&net, &weights).unwrap_err();
        assert!(matches!(err, GraphError::Validation(_)));
    }

    #[test]
    fn known_node_ids_are_reused_and_synthetic_ids_come_from_the_private_space() {
        let net = network(
            vec![road(10, "residential", false)],
            vec![RoadNode { id: 501, lat: 52.50, lon: 13.40 }],
            vec![segment(1, 10, "[[52.50,13.40],[52.51,13.41]]", true)],
        );
        let weights = weights_for(&net);
        let rendered = render_graph(&net, &weights).unwrap();
        assert!(rendered.xml.contains("<node id=\"501\""));
        assert!(rendered.xml.contains(&format!("<node id=\"{SYNTHETIC_ID_BASE}\"")));
    }

    #[test]
    fn export_is_byte_identical_across_runs_and_input_order() {
        let seg_a = segment(1, 10, "[[52.50,13.40],[52.51,13.41]]", false);
        let seg_b = segment(2, 10, "[[52.52,13.42],[52.53,13.43]]", true);
        let net_fwd = network(
            vec![road(10, "tertiary", false)],
            vec![],
            vec![seg_a.clone(), seg_b.clone()],
        );
        let net_rev = network(vec![road(10, "tertiary", false)], vec![], vec![seg_b, seg_a]);

        let weights = weights_for(&net_fwd);
        let first = render_graph(&net_fwd, &weights).unwrap();
        let second = render_graph(&net_rev, &weights).unwrap();
        assert_eq!(first.xml, second.xml);
    }

    #[test]
    fn ratings_and_traffic_format_at_fixed_precision() {
        use crate::model::{FeedbackSample, TrafficCondition, TrafficLevel};
        let mut seg = segment(1, 10, "[[52.50,13.40],[52.51,13.41]]", true);
        seg.feedback = vec![
            FeedbackSample { adjustment: None, severity: Some("MINOR".to_string()) },
            FeedbackSample { adjustment: None, severity: Some("MODERATE".to_string()) },
            FeedbackSample { adjustment: None, severity: Some("MODERATE".to_string()) },
        ];
        seg.traffic = Some(TrafficCondition { level: TrafficLevel::Slow });
        seg.speed_limit = Some(30);
        let net = network(vec![road(10, "residential", false)], vec![], vec![seg]);
        let weights = weights_for(&net);
        let rendered = render_graph(&net, &weights).unwrap();
        // (0.8 + 0.6 + 0.6) / 3 = 0.666…, 3 decimals
        assert!(rendered.xml.contains("<tag k=\"user_rating\" v=\"0.667\"/>"));
        assert!(rendered.xml.contains("<tag k=\"traffic_value\" v=\"2.5\"/>"));
        assert!(rendered.xml.contains("<tag k=\"maxspeed\" v=\"30\"/>"));
    }

    #[test]
    fn segments_without_feedback_omit_the_rating_tag() {
        let net = network(
            vec![road(10, "residential", false)],
            vec![],
            vec![segment(1, 10, "[[52.50,13.40],[52.51,13.41]]", true)],
        );
        let weights = weights_for(&net);
        let rendered = render_graph(&net, &weights).unwrap();
        assert!(!rendered.xml.contains("user_rating"));
        assert!(rendered.xml.contains("<tag k=\"traffic_value\" v=\"5.0\"/>"));
    }

    #[test]
    fn manifest_round_trips_and_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let graph_path = dir.path().join("graph.osm");
        let net = network(
            vec![road(10, "residential", false)],
            vec![],
            vec![segment(1, 10, "[[52.50,13.40],[52.51,13.41]]", false)],
        );
        let weights = weights_for(&net);
        write_graph(&graph_path, &net, &weights).unwrap();

        let manifest = GraphManifest::read(&manifest_path(&graph_path)).unwrap();
        manifest.verify(&graph_path).unwrap();
        assert_eq!(manifest.ways, 2);

        std::fs::write(&graph_path, "tampered").unwrap();
        assert!(manifest.verify(&graph_path).is_err());
    }
}
