//! Road-graph data model and the collaborator surface the router consumes.

use std::cmp::Ordering;

use geo::Point;
use serde::{Deserialize, Serialize};

use crate::geometry;

/// Functional Road Class (OpenLR spec)
/// FRC0 = Main road (motorway)
/// FRC7 = Other (lowest importance)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Frc {
    Frc0 = 0, // Main road (motorway, freeway)
    Frc1 = 1, // First class road (major routes)
    Frc2 = 2, // Second class road (regional routes)
    Frc3 = 3, // Third class road (local connecting roads)
    Frc4 = 4, // Fourth class road (local roads of high importance)
    Frc5 = 5, // Fifth class road (local roads)
    Frc6 = 6, // Sixth class road (local roads of low importance)
    Frc7 = 7, // Other (parking, service roads, etc.)
}

impl Frc {
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => Frc::Frc0,
            1 => Frc::Frc1,
            2 => Frc::Frc2,
            3 => Frc::Frc3,
            4 => Frc::Frc4,
            5 => Frc::Frc5,
            6 => Frc::Frc6,
            _ => Frc::Frc7,
        }
    }
}

/// A graph point with an altitude.
///
/// Identity is the exact coordinate bits plus the altitude, so junctions can
/// key ordered maps; anything derived from the same graph data compares
/// equal, anything recomputed does not.
#[derive(Debug, Clone, Copy)]
pub struct Junction {
    point: Point<f64>,
    altitude: i32,
}

impl Junction {
    pub fn new(point: Point<f64>, altitude: i32) -> Self {
        Junction { point, altitude }
    }

    pub fn point(&self) -> Point<f64> {
        self.point
    }

    pub fn altitude(&self) -> i32 {
        self.altitude
    }
}

impl PartialEq for Junction {
    fn eq(&self, other: &Self) -> bool {
        self.point.x().to_bits() == other.point.x().to_bits()
            && self.point.y().to_bits() == other.point.y().to_bits()
            && self.altitude == other.altitude
    }
}

impl Eq for Junction {}

impl Ord for Junction {
    fn cmp(&self, other: &Self) -> Ordering {
        self.point
            .x()
            .total_cmp(&other.point.x())
            .then_with(|| self.point.y().total_cmp(&other.point.y()))
            .then_with(|| self.altitude.cmp(&other.altitude))
    }
}

impl PartialOrd for Junction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Distinguishes real graph edges from synthesized fakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Backed by a road feature.
    Real { feature_id: u64 },
    /// Synthesized link; `part_of_real` marks fakes that shadow real
    /// geometry, as opposed to pure synthetic connectors.
    Fake { part_of_real: bool },
}

/// A directed edge of the road graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoadEdge {
    start: Junction,
    end: Junction,
    kind: EdgeKind,
}

impl RoadEdge {
    pub fn real(start: Junction, end: Junction, feature_id: u64) -> Self {
        RoadEdge {
            start,
            end,
            kind: EdgeKind::Real { feature_id },
        }
    }

    pub fn fake(start: Junction, end: Junction, part_of_real: bool) -> Self {
        RoadEdge {
            start,
            end,
            kind: EdgeKind::Fake { part_of_real },
        }
    }

    pub fn start(&self) -> &Junction {
        &self.start
    }

    pub fn end(&self) -> &Junction {
        &self.end
    }

    pub fn kind(&self) -> EdgeKind {
        self.kind
    }

    pub fn is_fake(&self) -> bool {
        matches!(self.kind, EdgeKind::Fake { .. })
    }

    /// Only meaningful for fakes; real edges answer `false`.
    pub fn is_part_of_real(&self) -> bool {
        matches!(self.kind, EdgeKind::Fake { part_of_real: true })
    }

    pub fn feature_id(&self) -> Option<u64> {
        match self.kind {
            EdgeKind::Real { feature_id } => Some(feature_id),
            EdgeKind::Fake { .. } => None,
        }
    }

    /// Geodesic length of the edge in meters.
    pub fn length_m(&self) -> f64 {
        geometry::distance_m(self.start.point(), self.end.point())
    }

    /// The same edge traversed in the opposite direction.
    pub fn reversed(&self) -> Self {
        RoadEdge {
            start: self.end,
            end: self.start,
            kind: self.kind,
        }
    }
}

/// Road metadata for a real edge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RoadInfo {
    pub frc: Frc,
}

/// Lookup of road metadata by feature id.
pub trait RoadInfoLookup {
    fn get(&self, feature_id: u64) -> RoadInfo;
}

/// The road graph the router searches over.
///
/// The router mutates the graph only through `reset_fakes` and
/// `add_fake_edges`, both called during initialization; everything else is a
/// synchronous read-only query. Enumeration order must be deterministic for a
/// given graph state.
pub trait RoadGraph {
    /// Drop all fake edges injected by previous `add_fake_edges` calls.
    fn reset_fakes(&mut self);

    /// Inject bidirectional fake edges between `junction` and each projected
    /// junction in `vicinity`, plus fakes tying each projection to its real
    /// edge's endpoints.
    fn add_fake_edges(&mut self, junction: &Junction, vicinity: &[(RoadEdge, Junction)]);

    /// Up to `count` nearest real edges to `point` with the projection of
    /// `point` onto each, closest first.
    fn find_closest_edges(
        &self,
        point: Point<f64>,
        count: usize,
        out: &mut Vec<(RoadEdge, Junction)>,
    );

    fn regular_outgoing_edges(&self, junction: &Junction, out: &mut Vec<RoadEdge>);

    fn regular_ingoing_edges(&self, junction: &Junction, out: &mut Vec<RoadEdge>);

    fn fake_outgoing_edges(&self, junction: &Junction, out: &mut Vec<RoadEdge>);

    fn fake_ingoing_edges(&self, junction: &Junction, out: &mut Vec<RoadEdge>);
}
