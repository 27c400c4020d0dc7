//! Expected a posteriori ability scores.
//!
//! Scores are computed on a dedicated grid of flat areas over
//! `[-width, width]` with `point_factor` times the working resolution, so
//! the posterior is the normalized likelihood over that range.

use ndarray::Array2;
use rayon::prelude::*;

use crate::design::Design;
use crate::error::Result;
use crate::estep::{self, integrate_specific};
use crate::item_model::ItemBank;
use crate::likelihood::{LikelihoodCache, LikelihoodContext, LikelihoodScratch};
use crate::patterns::ResponsePatterns;
use crate::quadrature::{QuadratureGrid, QuadratureRule};

/// Posterior mean and standard deviation per respondent (original row
/// order) and ability.
#[derive(Debug, Clone)]
pub struct EapScores {
    pub mean: Array2<f64>,
    pub sd: Array2<f64>,
}

#[derive(Debug, Clone)]
pub struct EapEstimator {
    pub point_factor: usize,
    pub width: f64,
    pub cache: bool,
}

impl Default for EapEstimator {
    fn default() -> Self {
        Self {
            point_factor: 2,
            width: 4.0,
            cache: true,
        }
    }
}

struct EapAccum {
    sums: Vec<f64>,
    eis: Vec<f64>,
    all: Vec<f64>,
    point: Vec<f64>,
    scratch: LikelihoodScratch,
}

impl EapAccum {
    fn new(ctx: &LikelihoodContext) -> Self {
        Self {
            sums: vec![0.0; ctx.num_patterns() * ctx.design.max_abilities()],
            eis: vec![0.0; ctx.block_len()],
            all: vec![0.0; ctx.num_patterns()],
            point: vec![0.0; ctx.grid.dims()],
            scratch: ctx.scratch(),
        }
    }

    /// Add `f(x - center) * posterior weight` for every ability; `f` is the
    /// identity without a center and the square with one.
    fn visit(
        &mut self,
        ctx: &LikelihoodContext,
        cache: &LikelihoodCache,
        pattern_log_lik: &[f64],
        center: Option<&[f64]>,
        primary: usize,
    ) {
        let grid = ctx.grid;
        let design = ctx.design;
        let u = ctx.num_patterns();
        let abilities = design.max_abilities();
        let moment = |px: usize, dim: usize, x: f64| match center {
            Some(c) => {
                let d = x - c[px * abilities + dim];
                d * d
            }
            None => x,
        };
        let lxk = cache.primary(ctx, primary, &mut self.scratch);

        if !grid.has_specific() {
            grid.point(primary, &mut self.point);
            let log_area = grid.log_area()[primary];
            for px in 0..u {
                let w = (lxk[px] + log_area - pattern_log_lik[px]).exp();
                for dim in 0..abilities {
                    self.sums[px * abilities + dim] += moment(px, dim, self.point[dim]) * w;
                }
            }
            return;
        }

        integrate_specific(ctx, lxk, &mut self.eis, &mut self.all);
        let groups = ctx.groups();
        let primary_dims = design.primary_dims();
        let slot = design.max_dims() - 1;

        grid.point(grid.node(primary, 0), &mut self.point);
        let pri_log_area = grid.primary_log_area()[primary];
        for px in 0..u {
            let w = (self.all[px] + pri_log_area - pattern_log_lik[px]).exp();
            for dim in 0..primary_dims {
                self.sums[px * abilities + dim] += moment(px, dim, self.point[dim]) * w;
            }
        }

        for sx in 0..grid.specific_points() {
            let node = grid.node(primary, sx);
            grid.point(node, &mut self.point);
            let log_area = grid.log_area()[node];
            for g in 0..groups {
                let dim = slot + g;
                let block = &lxk[(sx * groups + g) * u..(sx * groups + g + 1) * u];
                for px in 0..u {
                    let w = (self.all[px] - self.eis[g * u + px] + block[px] + log_area
                        - pattern_log_lik[px])
                        .exp();
                    self.sums[px * abilities + dim] += moment(px, dim, self.point[slot]) * w;
                }
            }
        }
    }

    fn merge(mut self, other: EapAccum) -> Self {
        for (a, b) in self.sums.iter_mut().zip(&other.sums) {
            *a += b;
        }
        self
    }
}

fn posterior_pass(
    ctx: &LikelihoodContext,
    cache: &LikelihoodCache,
    pattern_log_lik: &[f64],
    center: Option<&[f64]>,
) -> Vec<f64> {
    (0..ctx.grid.primary_points())
        .into_par_iter()
        .fold(
            || EapAccum::new(ctx),
            |mut acc, primary| {
                acc.visit(ctx, cache, pattern_log_lik, center, primary);
                acc
            },
        )
        .reduce_with(EapAccum::merge)
        .unwrap_or_else(|| EapAccum::new(ctx))
        .sums
}

impl EapEstimator {
    /// Score every respondent. `working_points` is the resolution of the
    /// estimation grid.
    pub fn estimate(
        &self,
        items: &ItemBank,
        design: &Design,
        patterns: &ResponsePatterns,
        params: &Array2<f64>,
        working_points: usize,
    ) -> Result<EapScores> {
        let n_points = working_points * self.point_factor;
        if (n_points as f64) < 1.0 + 2.0 * (items.len() as f64).sqrt() {
            log::warn!(
                "EAP grid of {} points is too coarse for {} items (want 1 + 2*sqrt(items))",
                n_points,
                items.len()
            );
        }

        let rule = QuadratureRule::flat(n_points, self.width)?;
        let grid = QuadratureGrid::new(rule, design.max_dims(), design.has_specific());
        let ctx = LikelihoodContext {
            grid: &grid,
            design,
            items,
            patterns,
            params,
        };
        let mut cache = LikelihoodCache::new(self.cache);
        cache.fill(&ctx);
        let pattern_log_lik = estep::run(&ctx, &cache).pattern_log_lik;

        let means = posterior_pass(&ctx, &cache, &pattern_log_lik, None);
        let vars = posterior_pass(&ctx, &cache, &pattern_log_lik, Some(&means));

        let abilities = design.max_abilities();
        let row_pattern = patterns.row_pattern();
        let rows = row_pattern.len();
        let mean = Array2::from_shape_fn((rows, abilities), |(r, d)| {
            means[row_pattern[r] * abilities + d]
        });
        let sd = Array2::from_shape_fn((rows, abilities), |(r, d)| {
            vars[row_pattern[r] * abilities + d].sqrt()
        });
        Ok(EapScores { mean, sd })
    }
}
