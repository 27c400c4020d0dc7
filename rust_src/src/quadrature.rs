//! Quadrature rules and the Cartesian grid the E-step integrates over.
//!
//! A grid replicates one univariate rule across every item dimension. Node
//! indices are mixed-radix with the first dimension least significant. When
//! specific factors are present, the trailing dimension is shared by every
//! specific group and the leading dimensions form the primary sub-grid, so
//! `node = primary + primary_points * specific`.

use crate::error::{Ba81Error, Result};

/// A univariate rule: ordinates and their (normalized) areas.
#[derive(Debug, Clone)]
pub struct QuadratureRule {
    points: Vec<f64>,
    areas: Vec<f64>,
    log_areas: Vec<f64>,
}

impl QuadratureRule {
    pub fn new(points: Vec<f64>, areas: Vec<f64>) -> Result<Self> {
        if points.len() != areas.len() {
            return Err(Ba81Error::QuadratureLength {
                points: points.len(),
                areas: areas.len(),
            });
        }
        if points.is_empty() {
            return Err(Ba81Error::EmptyQuadrature);
        }
        let log_areas = areas.iter().map(|a| a.ln()).collect();
        Ok(Self {
            points,
            areas,
            log_areas,
        })
    }

    /// Equally spaced points on `[-width, width]` with standard normal areas
    /// normalized to sum to one.
    pub fn normal(n: usize, width: f64) -> Result<Self> {
        if n == 0 {
            return Err(Ba81Error::EmptyQuadrature);
        }
        let points = spaced_points(n, width);
        let density: Vec<f64> = points.iter().map(|&x| (-0.5 * x * x).exp()).collect();
        let total: f64 = density.iter().sum();
        let areas = density.iter().map(|d| d / total).collect();
        Self::new(points, areas)
    }

    /// Descending equally spaced points on `[-width, width]` with flat areas,
    /// as used for EAP scoring.
    pub fn flat(n: usize, width: f64) -> Result<Self> {
        if n == 0 {
            return Err(Ba81Error::EmptyQuadrature);
        }
        let mut points = spaced_points(n, width);
        points.reverse();
        let areas = vec![1.0 / n as f64; n];
        Self::new(points, areas)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[f64] {
        &self.points
    }

    pub fn areas(&self) -> &[f64] {
        &self.areas
    }

    pub fn log_areas(&self) -> &[f64] {
        &self.log_areas
    }
}

fn spaced_points(n: usize, width: f64) -> Vec<f64> {
    if n == 1 {
        return vec![0.0];
    }
    let step = 2.0 * width / (n - 1) as f64;
    (0..n).map(|i| -width + i as f64 * step).collect()
}

#[derive(Debug, Clone)]
pub struct QuadratureGrid {
    rule: QuadratureRule,
    dims: usize,
    has_specific: bool,
    total_points: usize,
    primary_points: usize,
    log_area: Vec<f64>,
    primary_log_area: Vec<f64>,
}

impl QuadratureGrid {
    /// Build a `dims`-dimensional grid. With `has_specific` the last
    /// dimension is the shared specific-factor slot.
    pub fn new(rule: QuadratureRule, dims: usize, has_specific: bool) -> Self {
        let q = rule.len();
        let total_points = q.pow(dims as u32);
        let primary_dims = if has_specific { dims - 1 } else { dims };
        let primary_points = q.pow(primary_dims as u32);

        let log_areas = rule.log_areas();
        let node_log_area = |node: usize, ndims: usize| -> f64 {
            let mut rest = node;
            let mut total = 0.0;
            for _ in 0..ndims {
                total += log_areas[rest % q];
                rest /= q;
            }
            total
        };
        let log_area: Vec<f64> = (0..total_points).map(|n| node_log_area(n, dims)).collect();
        let primary_log_area = if has_specific {
            (0..primary_points)
                .map(|n| node_log_area(n, primary_dims))
                .collect()
        } else {
            log_area.clone()
        };

        Self {
            rule,
            dims,
            has_specific,
            total_points,
            primary_points,
            log_area,
            primary_log_area,
        }
    }

    pub fn rule(&self) -> &QuadratureRule {
        &self.rule
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn has_specific(&self) -> bool {
        self.has_specific
    }

    pub fn primary_dims(&self) -> usize {
        if self.has_specific {
            self.dims - 1
        } else {
            self.dims
        }
    }

    pub fn total_points(&self) -> usize {
        self.total_points
    }

    pub fn primary_points(&self) -> usize {
        self.primary_points
    }

    /// Points along the shared specific dimension; 1 when there is none.
    pub fn specific_points(&self) -> usize {
        if self.has_specific {
            self.rule.len()
        } else {
            1
        }
    }

    #[inline]
    pub fn node(&self, primary: usize, specific: usize) -> usize {
        primary + self.primary_points * specific
    }

    pub fn encode(&self, coord: &[usize]) -> usize {
        let q = self.rule.len();
        coord.iter().rev().fold(0, |acc, &c| acc * q + c)
    }

    pub fn decode(&self, mut node: usize, coord: &mut [usize]) {
        let q = self.rule.len();
        for c in coord.iter_mut().take(self.dims) {
            *c = node % q;
            node /= q;
        }
    }

    /// Ability coordinates of `node`, one per grid dimension.
    pub fn point(&self, node: usize, out: &mut [f64]) {
        let q = self.rule.len();
        let mut rest = node;
        for x in out.iter_mut().take(self.dims) {
            *x = self.rule.points[rest % q];
            rest /= q;
        }
    }

    pub fn log_area(&self) -> &[f64] {
        &self.log_area
    }

    /// Log areas of the primary sub-grid; the full grid when there are no
    /// specific factors.
    pub fn primary_log_area(&self) -> &[f64] {
        &self.primary_log_area
    }

    pub fn specific_log_area(&self) -> &[f64] {
        &self.rule.log_areas
    }
}
