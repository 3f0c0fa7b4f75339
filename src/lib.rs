pub mod geometry;
pub mod graph;
pub mod network;
pub mod router;
pub mod score;
pub mod test_utils;

pub use graph::{EdgeKind, Frc, Junction, RoadEdge, RoadGraph, RoadInfo, RoadInfoLookup};
pub use network::{RoadInfoTable, RoadNetwork};
pub use router::{MatchError, Router, RouterConfig, WayPoint};
pub use score::Score;
