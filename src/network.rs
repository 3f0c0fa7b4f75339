//! In-memory road-graph provider.
//!
//! Stores the real edges in a petgraph `DiGraph` keyed by junction, answers
//! nearest-edge queries through an rstar R-tree of per-edge envelopes, and
//! keeps the fake edges injected around anchors in a registry of its own so
//! they can be dropped wholesale between routing runs.

use std::collections::BTreeMap;

use geo::Point;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use rstar::{RTree, RTreeObject, AABB};

use crate::geometry;
use crate::graph::{Frc, Junction, RoadEdge, RoadGraph, RoadInfo, RoadInfoLookup};

/// Radius of nearest-edge queries in meters.
const SEARCH_RADIUS_M: f64 = 100.0;

/// Bounding box of one directed edge in the R-tree.
///
/// Only the box and the edge index are stored; precise distances are computed
/// against the graph's junctions.
#[derive(Debug, Clone)]
struct SegmentEnvelope {
    edge_idx: EdgeIndex,
    min_x: f64,
    min_y: f64,
    max_x: f64,
    max_y: f64,
}

impl SegmentEnvelope {
    fn new(edge_idx: EdgeIndex, start: Point<f64>, end: Point<f64>) -> Self {
        SegmentEnvelope {
            edge_idx,
            min_x: start.x().min(end.x()),
            min_y: start.y().min(end.y()),
            max_x: start.x().max(end.x()),
            max_y: start.y().max(end.y()),
        }
    }
}

impl RTreeObject for SegmentEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners([self.min_x, self.min_y], [self.max_x, self.max_y])
    }
}

/// The road network the router searches over.
pub struct RoadNetwork {
    graph: DiGraph<Junction, u64>,
    junction_to_node: BTreeMap<Junction, NodeIndex>,
    rtree: RTree<SegmentEnvelope>,
    fake_outgoing: BTreeMap<Junction, Vec<RoadEdge>>,
    fake_ingoing: BTreeMap<Junction, Vec<RoadEdge>>,
}

impl RoadNetwork {
    pub fn new() -> Self {
        RoadNetwork {
            graph: DiGraph::new(),
            junction_to_node: BTreeMap::new(),
            rtree: RTree::new(),
            fake_outgoing: BTreeMap::new(),
            fake_ingoing: BTreeMap::new(),
        }
    }

    /// Get or create the node for a junction.
    pub fn get_or_add_junction(&mut self, junction: Junction) -> NodeIndex {
        if let Some(&idx) = self.junction_to_node.get(&junction) {
            return idx;
        }
        let idx = self.graph.add_node(junction);
        self.junction_to_node.insert(junction, idx);
        idx
    }

    /// Add a directed real edge between two junctions.
    pub fn add_road(&mut self, feature_id: u64, start: Junction, end: Junction) {
        let from = self.get_or_add_junction(start);
        let to = self.get_or_add_junction(end);
        let edge_idx = self.graph.add_edge(from, to, feature_id);
        self.rtree
            .insert(SegmentEnvelope::new(edge_idx, start.point(), end.point()));
    }

    pub fn junction_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn road_count(&self) -> usize {
        self.graph.edge_count()
    }

    fn edge_at(&self, edge_idx: EdgeIndex) -> RoadEdge {
        let (source, target) = self
            .graph
            .edge_endpoints(edge_idx)
            .expect("indexed edge exists");
        let feature_id = *self.graph.edge_weight(edge_idx).expect("indexed edge exists");
        RoadEdge::real(self.graph[source], self.graph[target], feature_id)
    }

    fn register_fake(&mut self, edge: RoadEdge) {
        let outgoing = self.fake_outgoing.entry(*edge.start()).or_default();
        if outgoing.contains(&edge) {
            return;
        }
        outgoing.push(edge);
        self.fake_ingoing.entry(*edge.end()).or_default().push(edge);
    }

    fn add_fake_pair(&mut self, a: &Junction, b: &Junction, part_of_real: bool) {
        if a == b {
            return;
        }
        self.register_fake(RoadEdge::fake(*a, *b, part_of_real));
        self.register_fake(RoadEdge::fake(*b, *a, part_of_real));
    }
}

impl Default for RoadNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl RoadGraph for RoadNetwork {
    fn reset_fakes(&mut self) {
        self.fake_outgoing.clear();
        self.fake_ingoing.clear();
    }

    fn add_fake_edges(&mut self, junction: &Junction, vicinity: &[(RoadEdge, Junction)]) {
        for (edge, projection) in vicinity {
            self.add_fake_pair(junction, projection, false);
            self.add_fake_pair(projection, edge.start(), true);
            self.add_fake_pair(projection, edge.end(), true);
        }
    }

    fn find_closest_edges(
        &self,
        point: Point<f64>,
        count: usize,
        out: &mut Vec<(RoadEdge, Junction)>,
    ) {
        // Expand the radius into a degree box, adjusted for latitude.
        let meters_per_deg_lat = 111_132.0;
        let meters_per_deg_lon = 111_132.0 * point.y().to_radians().cos();

        let delta_lat = SEARCH_RADIUS_M / meters_per_deg_lat;
        let delta_lon = SEARCH_RADIUS_M / meters_per_deg_lon;

        let search_box = AABB::from_corners(
            [point.x() - delta_lon, point.y() - delta_lat],
            [point.x() + delta_lon, point.y() + delta_lat],
        );

        let mut hits: Vec<(f64, u64, RoadEdge, Junction)> = Vec::new();
        for envelope in self.rtree.locate_in_envelope_intersecting(&search_box) {
            let edge = self.edge_at(envelope.edge_idx);
            let (projection, _) = geometry::project_point_to_segment(
                point,
                edge.start().point(),
                edge.end().point(),
            );
            let distance = geometry::distance_m(point, projection);
            if distance > SEARCH_RADIUS_M {
                continue;
            }
            let feature_id = edge.feature_id().unwrap_or(0);
            hits.push((distance, feature_id, edge, Junction::new(projection, 0)));
        }

        hits.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        hits.truncate(count);
        out.extend(hits.into_iter().map(|(_, _, edge, proj)| (edge, proj)));
    }

    fn regular_outgoing_edges(&self, junction: &Junction, out: &mut Vec<RoadEdge>) {
        let Some(&idx) = self.junction_to_node.get(junction) else {
            return;
        };
        for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
            out.push(RoadEdge::real(
                *junction,
                self.graph[edge.target()],
                *edge.weight(),
            ));
        }
    }

    fn regular_ingoing_edges(&self, junction: &Junction, out: &mut Vec<RoadEdge>) {
        let Some(&idx) = self.junction_to_node.get(junction) else {
            return;
        };
        for edge in self.graph.edges_directed(idx, Direction::Incoming) {
            out.push(RoadEdge::real(
                self.graph[edge.source()],
                *junction,
                *edge.weight(),
            ));
        }
    }

    fn fake_outgoing_edges(&self, junction: &Junction, out: &mut Vec<RoadEdge>) {
        if let Some(edges) = self.fake_outgoing.get(junction) {
            out.extend_from_slice(edges);
        }
    }

    fn fake_ingoing_edges(&self, junction: &Junction, out: &mut Vec<RoadEdge>) {
        if let Some(edges) = self.fake_ingoing.get(junction) {
            out.extend_from_slice(edges);
        }
    }
}

/// Road metadata table keyed by feature id.
#[derive(Debug, Clone, Default)]
pub struct RoadInfoTable {
    infos: BTreeMap<u64, RoadInfo>,
}

impl RoadInfoTable {
    pub fn new() -> Self {
        RoadInfoTable {
            infos: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, feature_id: u64, info: RoadInfo) {
        self.infos.insert(feature_id, info);
    }
}

impl RoadInfoLookup for RoadInfoTable {
    fn get(&self, feature_id: u64) -> RoadInfo {
        // An unknown id means the graph and the metadata disagree; answer the
        // most restrictive class instead of tearing the search down.
        self.infos
            .get(&feature_id)
            .copied()
            .unwrap_or(RoadInfo { frc: Frc::Frc7 })
    }
}
