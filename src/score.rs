//! Composite score ordering the staged search.
//!
//! A score carries the reduced path length and an accumulated penalty in
//! meter-equivalents. The priority queue orders states by the sum, so a
//! penalty of `x` trades off against `x` meters of extra road.

use std::cmp::Ordering;

use crate::geometry::DEGREES_PER_BUCKET;

/// Weight for the total length of plain fake edges.
const TRUE_FAKE_COEFF: f64 = 10.0;

/// Weight for the total length of fake edges that lie along real geometry.
const PART_OF_REAL_COEFF: f64 = 0.001;

/// Weight for passing too far from a stage's pivot points.
const INTERMEDIATE_ERROR_COEFF: f64 = 3.0;

/// Weight for exceeding a stage's declared length.
const DISTANCE_ERROR_COEFF: f64 = 3.0;

/// Weight for deviating from a declared bearing.
const BEARING_ERROR_COEFF: f64 = 5.0;

/// Distance into a stage at which its bearing is evaluated, in meters.
pub const BEARING_DIST_M: f64 = 25.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct Score {
    distance: f64,
    penalty: f64,
}

impl Score {
    pub fn distance(&self) -> f64 {
        self.distance
    }

    pub fn penalty(&self) -> f64 {
        self.penalty
    }

    pub fn total(&self) -> f64 {
        self.distance + self.penalty
    }

    pub fn add_distance(&mut self, d: f64) {
        self.distance += d;
    }

    pub fn add_fake_penalty(&mut self, len_m: f64, part_of_real: bool) {
        let coeff = if part_of_real {
            PART_OF_REAL_COEFF
        } else {
            TRUE_FAKE_COEFF
        };
        self.penalty += coeff * len_m;
    }

    pub fn add_intermediate_error(&mut self, d: f64) {
        self.penalty += INTERMEDIATE_ERROR_COEFF * d;
    }

    pub fn add_distance_error(&mut self, d: f64) {
        self.penalty += DISTANCE_ERROR_COEFF * d;
    }

    /// Penalize the circular distance between two bearing buckets.
    pub fn add_bearing_penalty(&mut self, expected: u8, actual: u8) {
        let diff = (i32::from(expected) - i32::from(actual)).abs();
        let diff = diff.min(256 - diff);
        let angle = (diff as f64 * DEGREES_PER_BUCKET).to_radians();
        self.penalty += BEARING_ERROR_COEFF * angle * BEARING_DIST_M;
    }
}

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.distance.to_bits() == other.distance.to_bits()
            && self.penalty.to_bits() == other.penalty.to_bits()
    }
}

impl Eq for Score {}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.total()
            .total_cmp(&other.total())
            .then_with(|| self.distance.total_cmp(&other.distance))
            .then_with(|| self.penalty.total_cmp(&other.penalty))
    }
}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
