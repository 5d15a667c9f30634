//! Discretized parameter space.
//!
//! Each parameter owns an ordered, finite set of legal values. Anything that
//! places a value into a position goes through `snap` so positions always
//! sit on the grid.

use std::collections::BTreeMap;

use rand::Rng;

use crate::canonical::{Position, Velocity};
use crate::error::ConfigError;

/// Upper bound on grid points generated by `ParameterRange::stepped`.
const MAX_GRID_POINTS: usize = 10_000_000;

/// Outcome of moving a raw value back onto the grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Placement {
    /// Inside `[min, max]`, snapped to the nearest legal value.
    Snapped(f64),
    /// Outside `[min, max]`, pinned to the boundary. The caller zeroes the velocity.
    Clamped(f64),
}

impl Placement {
    pub fn value(self) -> f64 {
        match self { Placement::Snapped(v) | Placement::Clamped(v) => v }
    }

    pub fn is_clamped(self) -> bool { matches!(self, Placement::Clamped(_)) }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterRange {
    values: Vec<f64>,
}

impl ParameterRange {
    pub fn from_values(values: impl IntoIterator<Item = f64>) -> Result<Self, ConfigError> {
        let mut values: Vec<f64> = values.into_iter().collect();
        if values.is_empty() { return Err(ConfigError::EmptyRange); }
        if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(ConfigError::InvalidRange(format!("non-finite value {bad}")));
        }
        values.sort_by(f64::total_cmp);
        values.dedup();
        Ok(Self { values })
    }

    /// Inclusive grid `min, min + step, ...` up to `max`.
    pub fn stepped(min: f64, max: f64, step: f64) -> Result<Self, ConfigError> {
        if !(min.is_finite() && max.is_finite() && step.is_finite()) {
            return Err(ConfigError::InvalidRange(format!("non-finite bounds [{min}, {max}] step {step}")));
        }
        if step <= 0.0 { return Err(ConfigError::InvalidRange(format!("step must be positive (got {step})"))); }
        if max < min { return Err(ConfigError::InvalidRange(format!("max {max} below min {min}"))); }
        // small epsilon keeps `max` when (max - min) / step lands a hair under an integer
        let last = ((max - min) / step + 1e-9).floor();
        if last >= MAX_GRID_POINTS as f64 {
            return Err(ConfigError::InvalidRange(format!("grid exceeds {MAX_GRID_POINTS} points")));
        }
        Self::from_values((0..=last as usize).map(|i| min + i as f64 * step))
    }

    pub fn min(&self) -> f64 { self.values[0] }
    pub fn max(&self) -> f64 { self.values[self.values.len() - 1] }
    pub fn values(&self) -> &[f64] { &self.values }
    pub fn len(&self) -> usize { self.values.len() }
    pub fn is_empty(&self) -> bool { self.values.is_empty() }

    pub fn contains(&self, value: f64) -> bool {
        self.values.binary_search_by(|probe| probe.total_cmp(&value)).is_ok()
    }

    /// Nearest legal value; equidistant values resolve to the smaller one.
    pub fn snap(&self, raw: f64) -> f64 {
        let pos = self.values.partition_point(|v| *v < raw);
        if pos == 0 { return self.values[0]; }
        if pos == self.values.len() { return self.values[pos - 1]; }
        let before = self.values[pos - 1];
        let after = self.values[pos];
        if after - raw < raw - before { after } else { before }
    }

    pub fn clamp_and_snap(&self, raw: f64) -> Placement {
        if raw.is_nan() || raw < self.min() { return Placement::Clamped(self.min()); }
        if raw > self.max() { return Placement::Clamped(self.max()); }
        Placement::Snapped(self.snap(raw))
    }

    /// Uniform sample of `[min, max]` snapped onto the grid.
    pub fn random_value<R: Rng>(&self, rng: &mut R) -> f64 {
        let raw = rng.gen_range(self.min()..=self.max());
        self.snap(raw)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpace {
    ranges: BTreeMap<String, ParameterRange>,
}

impl ParameterSpace {
    pub fn new<N: Into<String>>(ranges: impl IntoIterator<Item = (N, ParameterRange)>) -> Result<Self, ConfigError> {
        let ranges: BTreeMap<String, ParameterRange> = ranges.into_iter().map(|(n, r)| (n.into(), r)).collect();
        if ranges.is_empty() { return Err(ConfigError::EmptySpace); }
        Ok(Self { ranges })
    }

    pub fn range(&self, name: &str) -> Option<&ParameterRange> { self.ranges.get(name) }
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParameterRange)> { self.ranges.iter() }
    pub fn names(&self) -> impl Iterator<Item = &String> { self.ranges.keys() }
    pub fn len(&self) -> usize { self.ranges.len() }
    pub fn is_empty(&self) -> bool { self.ranges.is_empty() }

    pub fn random_value<R: Rng>(&self, name: &str, rng: &mut R) -> Option<f64> {
        self.ranges.get(name).map(|r| r.random_value(rng))
    }

    pub fn clamp_and_snap(&self, name: &str, raw: f64) -> Option<Placement> {
        self.ranges.get(name).map(|r| r.clamp_and_snap(raw))
    }

    pub fn random_position<R: Rng>(&self, rng: &mut R) -> Position {
        self.ranges.iter().map(|(name, r)| (name.clone(), r.random_value(rng))).collect()
    }

    pub fn zero_velocity(&self) -> Velocity {
        self.ranges.keys().map(|name| (name.clone(), 0.0)).collect()
    }

    /// True when `position` names exactly this space's parameters and every value is legal.
    pub fn contains_position(&self, position: &Position) -> bool {
        position.len() == self.ranges.len()
            && position.iter().all(|(name, v)| self.ranges.get(name).map_or(false, |r| r.contains(*v)))
    }
}
