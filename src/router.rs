//! Staged shortest-path search and path reconstruction.
//!
//! The search walks the road graph one location-reference segment ("stage")
//! at a time. States are vertices carrying the current junction, the junction
//! and path distance at which the stage was entered, the stage index, and
//! whether the stage's bearing has been checked. A potential function (the
//! distance to the current stage's pivot points) turns the exploration into
//! an A*-style ordering while still allowing the stage-advance transitions.

use std::cmp::{Ordering, Reverse};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BinaryHeap};

use geo::Point;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::geometry::{
    bearing_bucket, distance_m, dot, is_point_on_segment, point_at_segment,
};
use crate::graph::{Frc, Junction, RoadEdge, RoadGraph, RoadInfoLookup};
use crate::score::{Score, BEARING_DIST_M};

const EPS: f64 = 1e-9;

/// Planar tolerance for deciding that a point lies on a candidate edge.
const POINT_ON_SEGMENT_EPS: f64 = 1e-5;

/// Minimum matching score for reattaching a real edge at a path boundary.
const FAKE_COVERAGE_THRESHOLD: f64 = 0.5;

/// Minimum covered fraction of a single-edge approximation candidate.
const SINGLE_EDGE_FRACTION_THRESHOLD: f64 = 0.8;

/// Minimum weighted coverage relative to the expected length for the
/// single-edge approximation.
const SINGLE_EDGE_COVERAGE_THRESHOLD: f64 = 0.5;

/// Real edges whose class exceeds the way-point's `lfrcnp` by more than this
/// many levels are excluded from the stage.
const FRC_TOLERANCE: u8 = 3;

/// One anchor of the location reference.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WayPoint {
    pub point: Point<f64>,
    /// Declared geodesic distance to the next way-point; unused on the last.
    pub distance_to_next_m: f64,
    /// Expected bearing bucket leaving this way-point.
    pub bearing: u8,
    /// Lowest functional road class allowed on the following segment.
    pub lfrcnp: Frc,
}

/// Why a location reference failed to decode.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    #[error("no roads found near way-point {index}")]
    NoNearbyRoads { index: usize },

    #[error("search exhausted before reaching the final way-point")]
    SearchExhausted,

    #[error("matched path is empty")]
    EmptyPath,
}

/// Tunables for the router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// How many nearby edges to consider around a way-point.
    pub max_road_candidates: usize,
    /// Slack added to a stage's declared length before pruning, meters.
    pub distance_accuracy_m: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            max_road_candidates: 10,
            distance_accuracy_m: 1000.0,
        }
    }
}

/// Search state: a junction together with the stage bookkeeping.
#[derive(Debug, Clone)]
struct Vertex {
    junction: Junction,
    stage_start: Junction,
    stage_start_distance: f64,
    stage: usize,
    bearing_checked: bool,
}

impl PartialEq for Vertex {
    fn eq(&self, other: &Self) -> bool {
        self.junction == other.junction
            && self.stage_start == other.stage_start
            && self.stage_start_distance.to_bits() == other.stage_start_distance.to_bits()
            && self.stage == other.stage
            && self.bearing_checked == other.bearing_checked
    }
}

impl Eq for Vertex {}

impl Ord for Vertex {
    fn cmp(&self, other: &Self) -> Ordering {
        self.junction
            .cmp(&other.junction)
            .then_with(|| self.stage_start.cmp(&other.stage_start))
            .then_with(|| {
                self.stage_start_distance
                    .total_cmp(&other.stage_start_distance)
            })
            .then_with(|| self.stage.cmp(&other.stage))
            .then_with(|| self.bearing_checked.cmp(&other.bearing_checked))
    }
}

impl PartialOrd for Vertex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// An edge of the search graph.
///
/// Normal edges step along a graph edge; special edges are zero-length fakes
/// synthesized for the bearing-check and stage-advance transitions.
#[derive(Debug, Clone)]
struct SearchEdge {
    u: Vertex,
    v: Vertex,
    raw: RoadEdge,
    is_special: bool,
}

impl SearchEdge {
    fn normal(u: Vertex, v: Vertex, raw: RoadEdge) -> Self {
        SearchEdge {
            u,
            v,
            raw,
            is_special: false,
        }
    }

    fn special(u: Vertex, v: Vertex) -> Self {
        let raw = RoadEdge::fake(u.junction, v.junction, false);
        SearchEdge {
            u,
            v,
            raw,
            is_special: true,
        }
    }

    /// Raw endpoints in traversal order.
    fn raw_pair(&self) -> (Point<f64>, Point<f64>) {
        (self.raw.start().point(), self.raw.end().point())
    }

    /// Raw endpoints against traversal order.
    fn raw_pair_rev(&self) -> (Point<f64>, Point<f64>) {
        (self.raw.end().point(), self.raw.start().point())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    score: Score,
    /// Insertion counter; makes the heap order total and deterministic.
    seq: u64,
    vertex: Vertex,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .cmp(&other.score)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

type Links = BTreeMap<Vertex, (Vertex, SearchEdge)>;

fn push_vertex(
    u: &Vertex,
    v: Vertex,
    sv: Score,
    edge: SearchEdge,
    scores: &mut BTreeMap<Vertex, Score>,
    links: &mut Links,
    queue: &mut BinaryHeap<Reverse<QueueEntry>>,
    seq: &mut u64,
) {
    if *u == v {
        return;
    }
    let improves = match scores.get(&v) {
        None => true,
        Some(known) => known.total() > sv.total() + EPS,
    };
    if !improves {
        return;
    }
    scores.insert(v.clone(), sv);
    links.insert(v.clone(), (u.clone(), edge));
    queue.push(Reverse(QueueEntry {
        score: sv,
        seq: *seq,
        vertex: v,
    }));
    *seq += 1;
}

/// Map-matching router over a road graph.
///
/// Single-threaded and non-reentrant: one `go` call owns all search state,
/// and the graph's fake-edge registry is rebuilt on every call.
pub struct Router<'a, G, L> {
    graph: &'a mut G,
    road_info: &'a L,
    config: RouterConfig,

    points: Vec<WayPoint>,
    positive_offset_m: f64,
    negative_offset_m: f64,
    pivots: Vec<Vec<Point<f64>>>,
    source: Junction,
    target: Junction,

    outgoing_cache: BTreeMap<Junction, Vec<RoadEdge>>,
    ingoing_cache: BTreeMap<Junction, Vec<RoadEdge>>,
}

impl<'a, G: RoadGraph, L: RoadInfoLookup> Router<'a, G, L> {
    pub fn new(graph: &'a mut G, road_info: &'a L) -> Self {
        let origin = Junction::new(Point::new(0.0, 0.0), 0);
        Router {
            graph,
            road_info,
            config: RouterConfig::default(),
            points: Vec::new(),
            positive_offset_m: 0.0,
            negative_offset_m: 0.0,
            pivots: Vec::new(),
            source: origin,
            target: origin,
            outgoing_cache: BTreeMap::new(),
            ingoing_cache: BTreeMap::new(),
        }
    }

    pub fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    /// Decode a location reference into an ordered sequence of real edges.
    ///
    /// `points` must hold at least two way-points; the offsets trim the
    /// matched path from its start and end. An `Err` is the empty-path
    /// outcome: nothing in the graph matched the reference.
    pub fn go(
        &mut self,
        points: &[WayPoint],
        positive_offset_m: f64,
        negative_offset_m: f64,
    ) -> Result<Vec<RoadEdge>, MatchError> {
        self.init(points, positive_offset_m, negative_offset_m)?;
        self.find_path()
    }

    fn init(
        &mut self,
        points: &[WayPoint],
        positive_offset_m: f64,
        negative_offset_m: f64,
    ) -> Result<(), MatchError> {
        assert!(
            points.len() >= 2,
            "a location reference needs at least two way-points"
        );

        self.points = points.to_vec();
        self.positive_offset_m = positive_offset_m;
        self.negative_offset_m = negative_offset_m;
        self.outgoing_cache.clear();
        self.ingoing_cache.clear();

        self.graph.reset_fakes();

        self.pivots.clear();
        for index in 1..points.len() - 1 {
            let mut vicinity = Vec::new();
            self.graph.find_closest_edges(
                points[index].point,
                self.config.max_road_candidates,
                &mut vicinity,
            );

            let mut pivots = Vec::new();
            for (edge, _) in &vicinity {
                pivots.push(edge.start().point());
                pivots.push(edge.end().point());
            }
            if pivots.is_empty() {
                debug!(index, "no roads around an intermediate way-point");
                return Err(MatchError::NoNearbyRoads { index });
            }
            self.pivots.push(pivots);
        }
        self.pivots.push(vec![points[points.len() - 1].point]);
        debug_assert_eq!(self.pivots.len() + 1, self.points.len());

        self.source = Junction::new(points[0].point, 0);
        let mut source_vicinity = Vec::new();
        self.graph.find_closest_edges(
            self.source.point(),
            self.config.max_road_candidates,
            &mut source_vicinity,
        );
        self.graph.add_fake_edges(&self.source, &source_vicinity);

        self.target = Junction::new(points[points.len() - 1].point, 0);
        let mut target_vicinity = Vec::new();
        self.graph.find_closest_edges(
            self.target.point(),
            self.config.max_road_candidates,
            &mut target_vicinity,
        );
        self.graph.add_fake_edges(&self.target, &target_vicinity);

        debug!(
            source_vicinity = source_vicinity.len(),
            target_vicinity = target_vicinity.len(),
            "anchors connected to the graph"
        );
        Ok(())
    }

    fn find_path(&mut self) -> Result<Vec<RoadEdge>, MatchError> {
        let mut queue: BinaryHeap<Reverse<QueueEntry>> = BinaryHeap::new();
        let mut scores: BTreeMap<Vertex, Score> = BTreeMap::new();
        let mut links: Links = BTreeMap::new();
        let mut seq = 0u64;

        let s = Vertex {
            junction: self.source,
            stage_start: self.source,
            stage_start_distance: 0.0,
            stage: 0,
            bearing_checked: false,
        };
        debug_assert!(!self.need_bearing_check(&s, 0.0));

        scores.insert(s.clone(), Score::default());
        queue.push(Reverse(QueueEntry {
            score: Score::default(),
            seq,
            vertex: s.clone(),
        }));
        seq += 1;

        let pi_s = self.potential(&s);

        while let Some(Reverse(entry)) = queue.pop() {
            let su = entry.score;
            let u = entry.vertex;

            if scores.get(&u) != Some(&su) {
                continue; // stale entry
            }

            if self.is_final(&u) {
                let mut edges = Vec::new();
                let mut cur = u;
                while cur != s {
                    let (prev, edge) = links
                        .get(&cur)
                        .cloned()
                        .expect("reached vertices have back-links");
                    edges.push(edge);
                    cur = prev;
                }
                edges.reverse();
                debug!(edges = edges.len(), "final way-point reached");
                return self.reconstruct_path(edges);
            }

            let stage = u.stage;
            let distance_to_next_m = self.points[stage].distance_to_next_m;
            let pi_u = self.potential(&u);
            let ud = su.distance() + pi_s - pi_u; // real distance to u

            debug_assert!(stage < self.pivots.len());

            // A stage that overran its declared length past the tolerance
            // cannot recover.
            if ud > u.stage_start_distance
                + distance_to_next_m
                + distance_to_next_m.max(self.config.distance_accuracy_m)
            {
                continue;
            }

            if self.near_next_stage(&u, pi_u) && !u.bearing_checked {
                let mut v = u.clone();
                v.bearing_checked = true;

                let mut sv = su;
                if u.junction != u.stage_start {
                    let expected = self.points[stage].bearing;
                    let actual = bearing_bucket(u.stage_start.point(), u.junction.point());
                    sv.add_bearing_penalty(expected, actual);
                }

                let edge = SearchEdge::special(u.clone(), v.clone());
                push_vertex(&u, v, sv, edge, &mut scores, &mut links, &mut queue, &mut seq);
            }

            if self.near_next_stage(&u, pi_u) && u.bearing_checked {
                let v = Vertex {
                    junction: u.junction,
                    stage_start: u.junction,
                    stage_start_distance: ud,
                    stage: stage + 1,
                    bearing_checked: false,
                };
                let pi_v = self.potential(&v);

                let mut sv = su;
                sv.add_distance((pi_v - pi_u).max(0.0));
                sv.add_intermediate_error(distance_m(
                    v.junction.point(),
                    self.points[v.stage].point,
                ));

                if self.is_final(&v) {
                    let expected = self.points[self.points.len() - 1].bearing;
                    let actual = self.reverse_bearing(&u, &links);
                    sv.add_bearing_penalty(expected, actual);
                }

                let edge = SearchEdge::special(u.clone(), v.clone());
                push_vertex(&u, v, sv, edge, &mut scores, &mut links, &mut queue, &mut seq);
            }

            let lfrcnp = self.points[stage].lfrcnp;
            for edge in self.edges_at(&u.junction, true) {
                if !self.passes_restriction(&edge, lfrcnp) {
                    continue;
                }

                let mut v = u.clone();
                v.junction = *edge.end();

                let pi_v = self.potential(&v);
                let w = edge.length_m();

                let mut sv = su;
                sv.add_distance((w + pi_v - pi_u).max(0.0));

                let vd = ud + w; // real distance to v
                if self.need_bearing_check(&v, vd) {
                    debug_assert!(!self.need_bearing_check(&u, ud));

                    // The probe sits 25 m of path into the stage,
                    // interpolated back from the edge end.
                    let delta = vd - v.stage_start_distance - BEARING_DIST_M;
                    let p = point_at_segment(edge.end().point(), edge.start().point(), delta);
                    if v.stage_start.point() != p {
                        let expected = self.points[stage].bearing;
                        let actual = bearing_bucket(v.stage_start.point(), p);
                        sv.add_bearing_penalty(expected, actual);
                    }
                    v.bearing_checked = true;
                }

                if vd > v.stage_start_distance + distance_to_next_m {
                    sv.add_distance_error(
                        (vd - v.stage_start_distance - distance_to_next_m).min(w),
                    );
                }

                if edge.is_fake() {
                    sv.add_fake_penalty(w, edge.is_part_of_real());
                }

                let search_edge = SearchEdge::normal(u.clone(), v.clone(), edge);
                push_vertex(
                    &u, v, sv, search_edge, &mut scores, &mut links, &mut queue, &mut seq,
                );
            }
        }

        debug!("queue drained without reaching the final way-point");
        Err(MatchError::SearchExhausted)
    }

    fn is_final(&self, v: &Vertex) -> bool {
        v.stage + 1 == self.points.len()
    }

    fn potential(&self, v: &Vertex) -> f64 {
        if self.is_final(v) {
            return 0.0;
        }

        let pivots = &self.pivots[v.stage];
        assert!(!pivots.is_empty(), "pivot lists are non-empty by construction");

        let point = v.junction.point();
        pivots
            .iter()
            .map(|pivot| distance_m(*pivot, point))
            .fold(f64::MAX, f64::min)
    }

    fn near_next_stage(&self, v: &Vertex, pi: f64) -> bool {
        v.stage < self.pivots.len() && pi < EPS
    }

    fn need_bearing_check(&self, v: &Vertex, distance_so_far_m: f64) -> bool {
        if self.is_final(v) || v.bearing_checked {
            return false;
        }
        distance_so_far_m >= v.stage_start_distance + BEARING_DIST_M
    }

    fn passes_restriction(&self, edge: &RoadEdge, lfrcnp: Frc) -> bool {
        match edge.feature_id() {
            None => true, // fakes are never restricted
            Some(feature_id) => {
                let frc = self.road_info.get(feature_id).frc;
                frc as u8 <= lfrcnp as u8 + FRC_TOLERANCE
            }
        }
    }

    /// Bearing from `u` toward the point 25 m back along the matched path,
    /// staying within `u`'s stage. If the stage is shorter than that, the
    /// earliest junction of the stage is used.
    fn reverse_bearing(&self, u: &Vertex, links: &Links) -> u8 {
        let a = u.junction.point();

        let mut curr = u.clone();
        let mut passed = 0.0;
        let mut back = None;
        while let Some((prev, edge)) = links.get(&curr) {
            if prev.stage != curr.stage {
                break;
            }

            let weight = edge.raw.length_m();
            if passed + weight >= BEARING_DIST_M {
                let delta = BEARING_DIST_M - passed;
                back = Some(point_at_segment(
                    edge.raw.end().point(),
                    edge.raw.start().point(),
                    delta,
                ));
                break;
            }

            passed += weight;
            curr = prev.clone();
        }

        let b = back.unwrap_or_else(|| curr.junction.point());
        bearing_bucket(a, b)
    }

    /// Regular edges come from the per-junction cache; fakes change with
    /// every init and are fetched fresh.
    fn edges_at(&mut self, junction: &Junction, outgoing: bool) -> Vec<RoadEdge> {
        let mut edges = Vec::new();

        let cache = if outgoing {
            &mut self.outgoing_cache
        } else {
            &mut self.ingoing_cache
        };
        match cache.entry(*junction) {
            Entry::Occupied(cached) => edges.extend_from_slice(cached.get()),
            Entry::Vacant(slot) => {
                let mut regular = Vec::new();
                if outgoing {
                    self.graph.regular_outgoing_edges(junction, &mut regular);
                } else {
                    self.graph.regular_ingoing_edges(junction, &mut regular);
                }
                edges.extend_from_slice(&regular);
                slot.insert(regular);
            }
        }

        if outgoing {
            self.graph.fake_outgoing_edges(junction, &mut edges);
        } else {
            self.graph.fake_ingoing_edges(junction, &mut edges);
        }
        edges
    }

    /// Non-fake reattachment candidates at a path boundary: the junction's
    /// graph edges plus the nearest edges around it, class-restricted.
    fn reattach_candidates(
        &mut self,
        junction: &Junction,
        outgoing: bool,
        lfrcnp: Frc,
    ) -> Vec<RoadEdge> {
        let mut candidates = Vec::new();
        for edge in self.edges_at(junction, outgoing) {
            if !edge.is_fake() && self.passes_restriction(&edge, lfrcnp) {
                candidates.push(edge);
            }
        }

        let mut vicinity = Vec::new();
        self.graph.find_closest_edges(
            junction.point(),
            self.config.max_road_candidates,
            &mut vicinity,
        );
        for (edge, _) in vicinity {
            if !edge.is_fake()
                && self.passes_restriction(&edge, lfrcnp)
                && !candidates.contains(&edge)
            {
                candidates.push(edge);
            }
        }
        candidates
    }

    fn reconstruct_path(&mut self, mut edges: Vec<SearchEdge>) -> Result<Vec<RoadEdge>, MatchError> {
        debug_assert!(self.points.len() >= 2);

        edges.retain(|edge| !edge.is_special);

        let consumed =
            prefix_length_to_consume(edges.iter().map(SearchEdge::raw_pair), self.positive_offset_m);
        debug_assert!(consumed <= edges.len());
        edges.drain(..consumed);

        let consumed = prefix_length_to_consume(
            edges.iter().rev().map(SearchEdge::raw_pair_rev),
            self.negative_offset_m,
        );
        debug_assert!(consumed <= edges.len());
        edges.truncate(edges.len() - consumed);

        // When the search entered the path over fake edges, look for a real
        // edge whose geometry the fake prefix retraces and reattach it.
        let mut front_score = -1.0;
        let mut front_edge = None;
        if let Some(i) = stage_prefix(&edges, 0) {
            let anchor = edges[i].u.junction;
            for candidate in self.reattach_candidates(&anchor, false, self.points[0].lfrcnp) {
                let score = matching_score(
                    candidate.end().point(),
                    candidate.start().point(),
                    edges[..i].iter().rev().map(SearchEdge::raw_pair_rev),
                );
                if score > front_score {
                    front_score = score;
                    front_edge = Some(candidate.reversed());
                }
            }
        }

        let mut back_score = -1.0;
        let mut back_edge = None;
        let last_stage = self.points.len() - 2;
        if let Some(i) = stage_suffix(&edges, last_stage) {
            let anchor = edges[i].v.junction;
            for candidate in
                self.reattach_candidates(&anchor, true, self.points[last_stage].lfrcnp)
            {
                let score = matching_score(
                    candidate.start().point(),
                    candidate.end().point(),
                    edges[i + 1..].iter().map(SearchEdge::raw_pair),
                );
                if score > back_score {
                    back_score = score;
                    back_edge = Some(candidate);
                }
            }
        }

        let mut path: Vec<RoadEdge> = edges
            .iter()
            .filter(|edge| !edge.raw.is_fake())
            .map(|edge| edge.raw)
            .collect();

        if front_score >= FAKE_COVERAGE_THRESHOLD && !path.is_empty() {
            let front = front_edge.expect("a score implies a candidate");
            if path[0] != front {
                path.insert(0, front);
            }
        }

        if back_score >= FAKE_COVERAGE_THRESHOLD && !path.is_empty() {
            let back = back_edge.expect("a score implies a candidate");
            if path[path.len() - 1] != back {
                path.push(back);
            }
        }

        if path.is_empty() {
            // The whole match ran over fake edges.
            self.single_edge_approximation(&edges, &mut path);
        }

        if path.is_empty() {
            debug!("reconstruction produced no real edges");
            Err(MatchError::EmptyPath)
        } else {
            Ok(path)
        }
    }

    /// Stand in a single real edge for an all-fake match: the candidate must
    /// be mostly covered by the fake geometry and long enough to account for
    /// the matched length.
    fn single_edge_approximation(&mut self, edges: &[SearchEdge], path: &mut Vec<RoadEdge>) {
        debug_assert!(edges.iter().all(|edge| edge.raw.is_fake()));

        let expected_length: f64 = edges.iter().map(|edge| edge.raw.length_m()).sum();
        if expected_length < EPS {
            return;
        }

        let mut best_coverage = -1.0;
        let mut best_edge = None;

        for search_edge in edges {
            debug_assert_eq!(search_edge.u.stage, search_edge.v.stage);
            let lfrcnp = self.points[search_edge.u.stage].lfrcnp;

            for junction in [search_edge.u.junction, search_edge.v.junction] {
                let mut vicinity = Vec::new();
                self.graph.find_closest_edges(
                    junction.point(),
                    self.config.max_road_candidates,
                    &mut vicinity,
                );

                for (edge, _) in vicinity {
                    if edge.is_fake() || !self.passes_restriction(&edge, lfrcnp) {
                        continue;
                    }
                    let weight = edge.length_m();
                    let fraction = coverage(edge.start().point(), edge.end().point(), edges);
                    let weighted = weight * fraction;
                    if fraction >= SINGLE_EDGE_FRACTION_THRESHOLD && weighted >= best_coverage {
                        best_coverage = weighted;
                        best_edge = Some(edge);
                    }
                }
            }
        }

        if best_coverage >= expected_length * SINGLE_EDGE_COVERAGE_THRESHOLD {
            if let Some(edge) = best_edge {
                debug!(feature_id = ?edge.feature_id(), "single-edge approximation accepted");
                path.push(edge);
            }
        }
    }
}

/// Number of leading pairs to drop for an offset: an edge is consumed while
/// its length is at most twice the remaining offset.
fn prefix_length_to_consume<I>(pairs: I, mut length_m: f64) -> usize
where
    I: Iterator<Item = (Point<f64>, Point<f64>)>,
{
    let mut n = 0;
    for (u, v) in pairs {
        if length_m <= 0.0 {
            break;
        }
        let len = distance_m(u, v);
        if 2.0 * length_m < len {
            break;
        }
        length_m -= len;
        n += 1;
    }
    n
}

/// Index of the first non-fake edge after a prefix of same-stage fakes, if
/// the path has one.
fn stage_prefix(edges: &[SearchEdge], stage: usize) -> Option<usize> {
    let mut i = 0;
    while i < edges.len()
        && edges[i].raw.is_fake()
        && edges[i].u.stage == stage
        && edges[i].v.stage == stage
    {
        i += 1;
    }
    (i < edges.len() && !edges[i].raw.is_fake()).then_some(i)
}

/// Mirror of `stage_prefix` from the back of the path.
fn stage_suffix(edges: &[SearchEdge], stage: usize) -> Option<usize> {
    let mut i = edges.len();
    while i > 0
        && edges[i - 1].raw.is_fake()
        && edges[i - 1].u.stage == stage
        && edges[i - 1].v.stage == stage
    {
        i -= 1;
    }
    (i > 0 && !edges[i - 1].raw.is_fake()).then(|| i - 1)
}

/// Fraction of segment `[u, v]` covered by a consecutive run of pairs that
/// lie on it and do not point against it.
fn matching_score<I>(u: Point<f64>, v: Point<f64>, pairs: I) -> f64
where
    I: Iterator<Item = (Point<f64>, Point<f64>)>,
{
    let len = distance_m(u, v);
    let uv = v - u;

    let mut cov = 0.0;
    for (s, t) in pairs {
        if !is_point_on_segment(s, u, v, POINT_ON_SEGMENT_EPS)
            || !is_point_on_segment(t, u, v, POINT_ON_SEGMENT_EPS)
        {
            break;
        }
        if dot(uv, t - s) < -POINT_ON_SEGMENT_EPS {
            break;
        }
        cov += distance_m(s, t);
    }

    if len == 0.0 {
        0.0
    } else {
        (cov / len).clamp(0.0, 1.0)
    }
}

/// Covered fraction of segment `[u, v]` under the union of the projections
/// of the search edges that lie along it.
fn coverage(u: Point<f64>, v: Point<f64>, edges: &[SearchEdge]) -> f64 {
    const LENGTH_THRESHOLD_M: f64 = 1.0;

    if distance_m(u, v) < LENGTH_THRESHOLD_M {
        return 0.0;
    }

    let uv = v - u;
    let sqlen = dot(uv, uv);

    let mut intervals = Vec::new();
    for edge in edges {
        let s = edge.u.junction.point();
        let t = edge.v.junction.point();
        if !is_point_on_segment(s, u, v, POINT_ON_SEGMENT_EPS)
            || !is_point_on_segment(t, u, v, POINT_ON_SEGMENT_EPS)
        {
            continue;
        }
        if dot(uv, t - s) < -POINT_ON_SEGMENT_EPS {
            continue;
        }

        let sp = dot(uv, s - u) / sqlen;
        let tp = dot(uv, t - u) / sqlen;
        let start = sp.min(tp).clamp(0.0, 1.0);
        let finish = sp.max(tp).clamp(0.0, 1.0);
        intervals.push((start, finish));
    }

    intervals.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.total_cmp(&b.1)));

    let mut covered = 0.0;
    let mut i = 0;
    while i < intervals.len() {
        let first = intervals[i].0;
        let mut last = intervals[i].1;
        let mut j = i;
        while j < intervals.len() && intervals[j].0 <= last {
            last = last.max(intervals[j].1);
            j += 1;
        }
        covered += last - first;
        i = j;
    }

    debug_assert!(covered <= 1.0 + POINT_ON_SEGMENT_EPS);
    covered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{RoadInfoTable, RoadNetwork};
    use crate::test_utils::NetworkBuilder;

    fn junction(x: f64, y: f64) -> Junction {
        Junction::new(Point::new(x, y), 0)
    }

    fn vertex(junction: Junction, stage: usize) -> Vertex {
        Vertex {
            junction,
            stage_start: junction,
            stage_start_distance: 0.0,
            stage,
            bearing_checked: false,
        }
    }

    fn fake_search_edge(from: Junction, to: Junction, stage: usize) -> SearchEdge {
        SearchEdge::normal(
            vertex(from, stage),
            vertex(to, stage),
            RoadEdge::fake(from, to, true),
        )
    }

    #[test]
    fn test_prefix_length_to_consume() {
        // Three collinear northward pieces of ~111 m each.
        let a = Point::new(0.0, 0.0);
        let b = Point::new(0.0, 0.001);
        let c = Point::new(0.0, 0.002);
        let d = Point::new(0.0, 0.003);
        let pairs = vec![(a, b), (b, c), (c, d)];
        let len = distance_m(a, b);

        assert_eq!(prefix_length_to_consume(pairs.iter().copied(), 0.0), 0);

        // Less than half an edge: nothing consumed.
        assert_eq!(
            prefix_length_to_consume(pairs.iter().copied(), 0.4 * len),
            0
        );

        // A bit over half consumes the first edge, then stops.
        assert_eq!(
            prefix_length_to_consume(pairs.iter().copied(), 0.6 * len),
            1
        );

        // Enough for everything.
        assert_eq!(
            prefix_length_to_consume(pairs.iter().copied(), 3.5 * len),
            3
        );
    }

    #[test]
    fn test_matching_score_full_retrace() {
        let a = junction(0.0, 0.0);
        let b = junction(0.0, 0.0005);
        let c = junction(0.0, 0.001);

        let edges = vec![fake_search_edge(a, b, 0), fake_search_edge(b, c, 0)];
        let score = matching_score(
            a.point(),
            c.point(),
            edges.iter().map(SearchEdge::raw_pair),
        );
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_matching_score_stops_at_first_mismatch() {
        let a = junction(0.0, 0.0);
        let b = junction(0.0, 0.0005);
        let off = junction(0.001, 0.002);

        let edges = vec![fake_search_edge(a, b, 0), fake_search_edge(b, off, 0)];
        let score = matching_score(
            a.point(),
            Point::new(0.0, 0.001),
            edges.iter().map(SearchEdge::raw_pair),
        );
        // Only the first pair counts: half the segment.
        assert!((score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_matching_score_rejects_opposite_direction() {
        // Long enough that the direction filter bites: the dot product of
        // degree-scale deltas must clear the tolerance.
        let a = junction(0.0, 0.0);
        let b = junction(0.0, 0.005);

        let edges = vec![fake_search_edge(b, a, 0)];
        let score = matching_score(
            a.point(),
            Point::new(0.0, 0.01),
            edges.iter().map(SearchEdge::raw_pair),
        );
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_coverage_merges_overlapping_intervals() {
        let a = junction(0.0, 0.0);
        let b = junction(0.0, 0.0006);
        let overlap_start = junction(0.0, 0.0004);
        let c = junction(0.0, 0.001);

        let edges = vec![
            fake_search_edge(a, b, 0),
            fake_search_edge(overlap_start, c, 0),
        ];
        let fraction = coverage(a.point(), c.point(), &edges);
        assert!((fraction - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_coverage_ignores_edges_off_the_segment() {
        let a = junction(0.0, 0.0);
        let b = junction(0.0, 0.0005);
        let off_a = junction(0.01, 0.0);
        let off_b = junction(0.01, 0.0005);

        let edges = vec![fake_search_edge(a, b, 0), fake_search_edge(off_a, off_b, 0)];
        let fraction = coverage(a.point(), Point::new(0.0, 0.001), &edges);
        assert!((fraction - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_coverage_of_short_segment_is_zero() {
        let a = junction(0.0, 0.0);
        let b = junction(0.0, 0.000001);
        let edges = vec![fake_search_edge(a, b, 0)];
        assert_eq!(coverage(a.point(), b.point(), &edges), 0.0);
    }

    #[test]
    fn test_stage_prefix_and_suffix() {
        let a = junction(0.0, 0.0);
        let b = junction(0.0, 0.0005);
        let c = junction(0.0, 0.001);
        let d = junction(0.0, 0.0015);

        let real = SearchEdge::normal(
            vertex(b, 0),
            vertex(c, 0),
            RoadEdge::real(b, c, 1),
        );
        let edges = vec![
            fake_search_edge(a, b, 0),
            real,
            fake_search_edge(c, d, 0),
        ];

        assert_eq!(stage_prefix(&edges, 0), Some(1));
        assert_eq!(stage_suffix(&edges, 0), Some(1));

        // An all-fake path has no prefix edge to anchor on.
        let all_fake = vec![fake_search_edge(a, b, 0), fake_search_edge(b, c, 0)];
        assert_eq!(stage_prefix(&all_fake, 0), None);
        assert_eq!(stage_suffix(&all_fake, 0), None);

        // A fake from another stage stops the scan.
        let other_stage = vec![fake_search_edge(a, b, 1)];
        assert_eq!(stage_prefix(&other_stage, 0), None);
    }

    #[test]
    fn test_passes_restriction_tolerance() {
        let (mut network, infos) = NetworkBuilder::new()
            .junction(1, 0.0, 0.0)
            .junction(2, 0.001, 0.0)
            .road(1, 1, 2, Frc::Frc3)
            .road(2, 1, 2, Frc::Frc4)
            .build();
        let router = Router::new(&mut network, &infos);

        let a = junction(0.0, 0.0);
        let b = junction(0.0, 0.001);
        let within = RoadEdge::real(a, b, 1); // Frc3 vs Frc0 + 3
        let beyond = RoadEdge::real(a, b, 2); // Frc4 vs Frc0 + 3
        let fake = RoadEdge::fake(a, b, false);

        assert!(router.passes_restriction(&within, Frc::Frc0));
        assert!(!router.passes_restriction(&beyond, Frc::Frc0));
        assert!(router.passes_restriction(&beyond, Frc::Frc1));
        assert!(router.passes_restriction(&fake, Frc::Frc0));
    }

    #[test]
    fn test_queue_entry_orders_by_score_then_seq() {
        let v = vertex(junction(0.0, 0.0), 0);

        let mut cheap = Score::default();
        cheap.add_distance(1.0);
        let mut costly = Score::default();
        costly.add_distance(2.0);

        let first = QueueEntry { score: cheap, seq: 7, vertex: v.clone() };
        let second = QueueEntry { score: cheap, seq: 8, vertex: v.clone() };
        let third = QueueEntry { score: costly, seq: 0, vertex: v };

        assert!(first < second);
        assert!(second < third);

        let mut heap = BinaryHeap::new();
        heap.push(Reverse(third.clone()));
        heap.push(Reverse(second.clone()));
        heap.push(Reverse(first.clone()));
        assert_eq!(heap.pop().unwrap().0, first);
        assert_eq!(heap.pop().unwrap().0, second);
        assert_eq!(heap.pop().unwrap().0, third);
    }

    #[test]
    fn test_push_vertex_requires_strict_improvement() {
        let mut scores = BTreeMap::new();
        let mut links = BTreeMap::new();
        let mut queue = BinaryHeap::new();
        let mut seq = 0;

        let u = vertex(junction(0.0, 0.0), 0);
        let v = vertex(junction(0.0, 0.001), 0);
        let edge = SearchEdge::special(u.clone(), v.clone());

        let mut sv = Score::default();
        sv.add_distance(10.0);
        push_vertex(&u, v.clone(), sv, edge.clone(), &mut scores, &mut links, &mut queue, &mut seq);
        assert_eq!(queue.len(), 1);

        // An equal score does not relax again.
        push_vertex(&u, v.clone(), sv, edge.clone(), &mut scores, &mut links, &mut queue, &mut seq);
        assert_eq!(queue.len(), 1);

        // A strictly better one does.
        let mut better = Score::default();
        better.add_distance(5.0);
        push_vertex(&u, v.clone(), better, edge.clone(), &mut scores, &mut links, &mut queue, &mut seq);
        assert_eq!(queue.len(), 2);
        assert_eq!(scores.get(&v), Some(&better));

        // Self-loops are never pushed.
        push_vertex(&u, u.clone(), Score::default(), edge, &mut scores, &mut links, &mut queue, &mut seq);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    #[should_panic(expected = "at least two way-points")]
    fn test_degenerate_input_panics() {
        let mut network = RoadNetwork::new();
        let infos = RoadInfoTable::new();
        let mut router = Router::new(&mut network, &infos);
        let point = WayPoint {
            point: Point::new(0.0, 0.0),
            distance_to_next_m: 0.0,
            bearing: 0,
            lfrcnp: Frc::Frc7,
        };
        let _ = router.go(&[point], 0.0, 0.0);
    }
}
