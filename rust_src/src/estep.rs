//! Expectation step: marginal pattern likelihoods and latent moments.
//!
//! Without specific factors the grid is integrated in a single pass. With
//! them, each primary point first integrates every specific group over the
//! shared specific dimension (Cai, 2010); group `g` contributes `eis[g]` and
//! the pattern's conditional likelihood at the primary point is
//! `exp(sum_g eis[g])`.

use ndarray::{Array1, Array2};
use rayon::prelude::*;

use crate::likelihood::{LikelihoodCache, LikelihoodContext, LikelihoodScratch};
use crate::utils::{logsumexp, tri_index, tri_len};

#[derive(Debug, Clone)]
pub struct EstepResult {
    /// Log marginal likelihood of each unique pattern.
    pub pattern_log_lik: Vec<f64>,
    /// Population mean of every ability.
    pub mean: Array1<f64>,
    /// Population covariance of every ability, symmetric.
    pub cov: Array2<f64>,
}

impl EstepResult {
    /// `sum_px multiplicity * log L_px`.
    pub fn log_likelihood(&self, multiplicity: &[f64]) -> f64 {
        self.pattern_log_lik
            .iter()
            .zip(multiplicity)
            .map(|(ll, m)| m * ll)
            .sum()
    }
}

/// Per-group marginal log-likelihoods at one primary point.
///
/// `lxk` is a primary block as produced by the likelihood cache. Fills
/// `eis[g * patterns + px]` and `all[px] = sum_g eis`.
pub(crate) fn integrate_specific(
    ctx: &LikelihoodContext,
    lxk: &[f64],
    eis: &mut [f64],
    all: &mut [f64],
) {
    let u = ctx.num_patterns();
    let groups = ctx.groups();
    let spec_log_area = ctx.grid.specific_log_area();
    let mut terms = vec![0.0; spec_log_area.len()];
    all.fill(0.0);
    for g in 0..groups {
        for px in 0..u {
            for (sx, term) in terms.iter_mut().enumerate() {
                *term = lxk[(sx * groups + g) * u + px] + spec_log_area[sx];
            }
            let e = logsumexp(&terms);
            eis[g * u + px] = e;
            all[px] += e;
        }
    }
}

struct Moments {
    lik: Vec<f64>,
    mean: Vec<f64>,
    cov: Vec<f64>,
    eis: Vec<f64>,
    all: Vec<f64>,
    point: Vec<f64>,
    scratch: LikelihoodScratch,
}

impl Moments {
    fn new(ctx: &LikelihoodContext) -> Self {
        let u = ctx.num_patterns();
        let abilities = ctx.design.max_abilities();
        Self {
            lik: vec![0.0; u],
            mean: vec![0.0; u * abilities],
            cov: vec![0.0; u * tri_len(abilities)],
            eis: vec![0.0; ctx.block_len()],
            all: vec![0.0; u],
            point: vec![0.0; ctx.grid.dims()],
            scratch: ctx.scratch(),
        }
    }

    fn visit(&mut self, ctx: &LikelihoodContext, cache: &LikelihoodCache, primary: usize) {
        let u = ctx.num_patterns();
        let grid = ctx.grid;
        let lxk = cache.primary(ctx, primary, &mut self.scratch);
        let latent = LatentLayout::new(ctx);

        if !grid.has_specific() {
            grid.point(primary, &mut self.point);
            let log_area = grid.log_area()[primary];
            for px in 0..u {
                let piece = (lxk[px] + log_area).exp();
                self.lik[px] += piece;
                latent.map(&mut self.mean, &mut self.cov, px, 0, piece, &self.point);
            }
            return;
        }

        integrate_specific(ctx, lxk, &mut self.eis, &mut self.all);
        let groups = ctx.groups();
        for sx in 0..grid.specific_points() {
            let node = grid.node(primary, sx);
            grid.point(node, &mut self.point);
            let log_area = grid.log_area()[node];
            for g in 0..groups {
                let block = &lxk[(sx * groups + g) * u..(sx * groups + g + 1) * u];
                let eis = &self.eis[g * u..(g + 1) * u];
                for px in 0..u {
                    let piece = (self.all[px] - eis[px] + block[px] + log_area).exp();
                    latent.map(&mut self.mean, &mut self.cov, px, g, piece, &self.point);
                }
            }
        }
        let pri_log_area = grid.primary_log_area()[primary];
        for px in 0..u {
            self.lik[px] += (self.all[px] + pri_log_area).exp();
        }
    }

    fn merge(mut self, other: Moments) -> Self {
        for (a, b) in self.lik.iter_mut().zip(&other.lik) {
            *a += b;
        }
        for (a, b) in self.mean.iter_mut().zip(&other.mean) {
            *a += b;
        }
        for (a, b) in self.cov.iter_mut().zip(&other.cov) {
            *a += b;
        }
        self
    }
}

/// Which latent cells a group updates: group 0 carries the primary
/// abilities, and every group carries its own specific ability on the
/// diagonal.
#[derive(Clone, Copy)]
struct LatentLayout {
    abilities: usize,
    primary: usize,
    specific_slot: Option<usize>,
}

impl LatentLayout {
    fn new(ctx: &LikelihoodContext) -> Self {
        let design = ctx.design;
        Self {
            abilities: design.max_abilities(),
            primary: design.primary_dims(),
            specific_slot: design.has_specific().then(|| design.max_dims() - 1),
        }
    }

    #[inline]
    fn map(
        &self,
        mean: &mut [f64],
        cov: &mut [f64],
        px: usize,
        group: usize,
        piece: f64,
        point: &[f64],
    ) {
        let mean = &mut mean[px * self.abilities..(px + 1) * self.abilities];
        let t = tri_len(self.abilities);
        let cov = &mut cov[px * t..(px + 1) * t];
        if group == 0 {
            for d1 in 0..self.primary {
                let w1 = piece * point[d1];
                mean[d1] += w1;
                for d2 in 0..=d1 {
                    cov[tri_index(d2, d1)] += w1 * point[d2];
                }
            }
        }
        if let Some(slot) = self.specific_slot {
            let sdim = slot + group;
            let w1 = piece * point[slot];
            mean[sdim] += w1;
            cov[tri_index(sdim, sdim)] += w1 * point[slot];
        }
    }
}

/// Integrate every pattern over the grid and collect latent moments.
pub fn run(ctx: &LikelihoodContext, cache: &LikelihoodCache) -> EstepResult {
    let moments = (0..ctx.grid.primary_points())
        .into_par_iter()
        .fold(
            || Moments::new(ctx),
            |mut acc, primary| {
                acc.visit(ctx, cache, primary);
                acc
            },
        )
        .reduce_with(Moments::merge)
        .unwrap_or_else(|| Moments::new(ctx));

    finish(ctx, moments)
}

fn finish(ctx: &LikelihoodContext, moments: Moments) -> EstepResult {
    let abilities = ctx.design.max_abilities();
    let t = tri_len(abilities);
    let multiplicity = ctx.patterns.multiplicity();
    let total = ctx.patterns.total();

    let mut mean = Array1::<f64>::zeros(abilities);
    let mut packed = vec![0.0; t];
    for (px, &lik) in moments.lik.iter().enumerate() {
        let weight = multiplicity[px] / lik;
        for d in 0..abilities {
            mean[d] += moments.mean[px * abilities + d] * weight;
        }
        for c in 0..t {
            packed[c] += moments.cov[px * t + c] * weight;
        }
    }
    mean.mapv_inplace(|m| m / total);

    let layout = LatentLayout::new(ctx);
    let mut cov = Array2::<f64>::zeros((abilities, abilities));
    for d1 in 0..layout.primary {
        for d2 in 0..=d1 {
            let v = packed[tri_index(d2, d1)] / total - mean[d1] * mean[d2];
            cov[[d1, d2]] = v;
            cov[[d2, d1]] = v;
        }
    }
    for sdim in layout.primary..abilities {
        cov[[sdim, sdim]] = packed[tri_index(sdim, sdim)] / total - mean[sdim] * mean[sdim];
    }

    let pattern_log_lik = moments.lik.iter().map(|l| l.ln()).collect();
    EstepResult {
        pattern_log_lik,
        mean,
        cov,
    }
}
