//! Expected arrival times along a course for a target finish duration.
//!
//! Cross-country skiers do not move at constant speed: climbs cost more time
//! per km than flats, descents less. Each segment between consecutive
//! checkpoints gets a cost of `factor × distance`, where the factor grows with
//! the gradient uphill and shrinks downhill (with a floor). The cumulative cost
//! share at a checkpoint is the share of the target duration spent reaching it,
//! so the total always equals the target exactly.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::PacingCoefficients;
use crate::db::models::{Checkpoint, Race};
use crate::helpers::{add_hours, dec_to_f64};

/// Distance and elevation of one point on the course.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoursePoint {
    pub distance_km: f64,
    pub elevation_m: f64,
}

impl From<&Checkpoint> for CoursePoint {
    fn from(cp: &Checkpoint) -> Self {
        Self {
            distance_km: dec_to_f64(cp.distance_km),
            elevation_m: dec_to_f64(cp.elevation_m),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingStrategy {
    /// Flat profile: time proportional to distance.
    Even,
    ElevationAdjusted,
    /// No usable distances: time proportional to checkpoint index.
    IndexFallback,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PacingModel {
    coefficients: PacingCoefficients,
}

impl PacingModel {
    pub fn new(coefficients: PacingCoefficients) -> Self {
        Self { coefficients }
    }

    pub fn strategy(&self, course: &[CoursePoint]) -> PacingStrategy {
        self.compute(course).1
    }

    /// Cumulative share of the target duration at each course point.
    ///
    /// Same length as `course`; the first value is exactly 0 and the last
    /// exactly 1 (a single point yields `[0.0]`).
    pub fn fractions(&self, course: &[CoursePoint]) -> Vec<f64> {
        self.compute(course).0
    }

    /// Expected arrival at every checkpoint of `course` (in course order).
    pub fn expected_arrivals(
        &self,
        race: &Race,
        course: &[Checkpoint],
        target_hours: f64,
    ) -> Vec<DateTime<Utc>> {
        let points: Vec<CoursePoint> = course.iter().map(CoursePoint::from).collect();
        tracing::debug!(
            race_id = %race.id,
            checkpoints = points.len(),
            target_hours,
            strategy = ?self.strategy(&points),
            "computing expected arrivals"
        );
        self.fractions(&points)
            .into_iter()
            .map(|f| add_hours(race.start_time, target_hours * f))
            .collect()
    }

    /// Expected arrival at one checkpoint, `None` if it is not on the course.
    pub fn expected_arrival(
        &self,
        race: &Race,
        course: &[Checkpoint],
        checkpoint_id: Uuid,
        target_hours: f64,
    ) -> Option<DateTime<Utc>> {
        let idx = course.iter().position(|cp| cp.id == checkpoint_id)?;
        self.expected_arrivals(race, course, target_hours)
            .get(idx)
            .copied()
    }

    fn compute(&self, course: &[CoursePoint]) -> (Vec<f64>, PacingStrategy) {
        let n = course.len();
        if n == 0 {
            return (Vec::new(), PacingStrategy::Even);
        }
        if n == 1 {
            return (vec![0.0], PacingStrategy::Even);
        }

        let flat = course.iter().all(|p| p.elevation_m == course[0].elevation_m);
        let (mut fractions, strategy) = if flat {
            match even_fractions(course) {
                Some(f) => (f, PacingStrategy::Even),
                None => (index_fractions(n), PacingStrategy::IndexFallback),
            }
        } else {
            match self.weighted_fractions(course) {
                Some(f) => (f, PacingStrategy::ElevationAdjusted),
                None => (index_fractions(n), PacingStrategy::IndexFallback),
            }
        };

        // pin the endpoints against floating-point drift
        fractions[0] = 0.0;
        fractions[n - 1] = 1.0;
        (fractions, strategy)
    }

    fn cost_factor(&self, gradient: f64) -> f64 {
        let c = &self.coefficients;
        let factor = if gradient >= 0.0 {
            1.0 + c.k_up * gradient
        } else {
            1.0 - c.k_down * gradient.abs()
        };
        factor.max(c.min_cost_factor)
    }

    fn weighted_fractions(&self, course: &[CoursePoint]) -> Option<Vec<f64>> {
        let costs: Vec<f64> = course
            .windows(2)
            .map(|w| {
                let dist = w[1].distance_km - w[0].distance_km;
                if dist <= 0.0 {
                    return 0.0;
                }
                let gradient = (w[1].elevation_m - w[0].elevation_m) / (dist * 1000.0);
                self.cost_factor(gradient) * dist
            })
            .collect();

        let total: f64 = costs.iter().sum();
        if !(total > 0.0 && total.is_finite()) {
            return None;
        }

        let mut fractions = Vec::with_capacity(course.len());
        fractions.push(0.0);
        let mut cumulative = 0.0;
        for cost in costs {
            cumulative += cost;
            fractions.push(cumulative / total);
        }
        Some(fractions)
    }
}

/// Share of the distance covered since the first course point.
fn even_fractions(course: &[CoursePoint]) -> Option<Vec<f64>> {
    let origin = course.first()?.distance_km;
    let span = course.last()?.distance_km - origin;
    if !(span > 0.0 && span.is_finite()) {
        return None;
    }
    Some(
        course
            .iter()
            .map(|p| (p.distance_km - origin) / span)
            .collect(),
    )
}

fn index_fractions(n: usize) -> Vec<f64> {
    let last = (n - 1) as f64;
    (0..n).map(|i| i as f64 / last).collect()
}
