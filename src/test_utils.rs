//! Test utilities for building road networks programmatically.
//!
//! Provides a builder for constructing small networks without any external
//! data, mirroring the fixtures used by the integration tests.
//!
//! # Example
//!
//! ```rust
//! use openlr_router::test_utils::NetworkBuilder;
//! use openlr_router::Frc;
//!
//! let (network, infos) = NetworkBuilder::new()
//!     .junction(1, 52.622875, 13.49214)
//!     .junction(2, 52.614812, 13.546033)
//!     .road(1, 1, 2, Frc::Frc0)
//!     .build();
//!
//! assert_eq!(network.junction_count(), 2);
//! assert_eq!(network.road_count(), 1);
//! ```

use std::collections::BTreeMap;

use geo::Point;

use crate::graph::{Frc, Junction, RoadInfo};
use crate::network::{RoadInfoTable, RoadNetwork};

/// A builder for constructing test road networks programmatically.
pub struct NetworkBuilder {
    junctions: BTreeMap<i64, Point<f64>>,
    roads: Vec<PendingRoad>,
}

struct PendingRoad {
    feature_id: u64,
    start: i64,
    end: i64,
    frc: Frc,
}

impl NetworkBuilder {
    pub fn new() -> Self {
        NetworkBuilder {
            junctions: BTreeMap::new(),
            roads: Vec::new(),
        }
    }

    /// Add a junction at the given coordinates.
    ///
    /// # Panics
    /// Panics if a junction with the same id already exists.
    pub fn junction(mut self, id: i64, lat: f64, lon: f64) -> Self {
        if self.junctions.contains_key(&id) {
            panic!("junction with id {} already exists", id);
        }
        self.junctions.insert(id, Point::new(lon, lat));
        self
    }

    /// Add a directed road between two junctions. The edge length is its
    /// geodesic length; there is no override.
    pub fn road(mut self, feature_id: u64, start: i64, end: i64, frc: Frc) -> Self {
        self.roads.push(PendingRoad {
            feature_id,
            start,
            end,
            frc,
        });
        self
    }

    /// Add a road drivable in both directions, as two features.
    pub fn two_way_road(
        self,
        forward_id: u64,
        backward_id: u64,
        start: i64,
        end: i64,
        frc: Frc,
    ) -> Self {
        self.road(forward_id, start, end, frc)
            .road(backward_id, end, start, frc)
    }

    /// Build the network and its road-info table.
    ///
    /// # Panics
    /// Panics if any road references a junction that was not added.
    pub fn build(self) -> (RoadNetwork, RoadInfoTable) {
        let mut network = RoadNetwork::new();
        let mut infos = RoadInfoTable::new();

        for road in self.roads {
            let start = self.junctions.get(&road.start).unwrap_or_else(|| {
                panic!(
                    "start junction {} does not exist for road {}",
                    road.start, road.feature_id
                )
            });
            let end = self.junctions.get(&road.end).unwrap_or_else(|| {
                panic!(
                    "end junction {} does not exist for road {}",
                    road.end, road.feature_id
                )
            });

            network.add_road(
                road.feature_id,
                Junction::new(*start, 0),
                Junction::new(*end, 0),
            );
            infos.insert(road.feature_id, RoadInfo { frc: road.frc });
        }

        (network, infos)
    }
}

impl Default for NetworkBuilder {
    fn default() -> Self {
        Self::new()
    }
}
