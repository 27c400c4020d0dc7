//! Deviance and its derivatives for the optimizer.
//!
//! Expected outcome counts come from the pattern likelihoods of the last
//! E-step; outcome probabilities and derivatives use the current item
//! parameters. Deviance is `-2 * (log prior + sum_node area * sum_items
//! sum_k w_k log P_k)`.

use ndarray::Array2;
use rayon::prelude::*;

use crate::error::{Ba81Error, Result};
use crate::estep::integrate_specific;
use crate::item_model::DerivScratch;
use crate::likelihood::{LikelihoodCache, LikelihoodContext, LikelihoodScratch, NodeScratch};
use crate::param_map::ParamMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FitRequest {
    pub fit: bool,
    pub gradient: bool,
    pub hessian: bool,
}

impl FitRequest {
    pub fn fit() -> Self {
        Self {
            fit: true,
            ..Self::default()
        }
    }

    pub fn gradient() -> Self {
        Self {
            fit: true,
            gradient: true,
            hessian: false,
        }
    }

    pub fn all() -> Self {
        Self {
            fit: true,
            gradient: true,
            hessian: true,
        }
    }

    fn wants_derivs(&self) -> bool {
        self.gradient || self.hessian
    }
}

#[derive(Debug, Clone)]
pub struct FitResult {
    pub deviance: f64,
    pub gradient: Option<Vec<f64>>,
    pub hessian: Option<Array2<f64>>,
}

/// Everything one fit evaluation reads.
pub struct FitInput<'a> {
    /// Context holding the E-step parameter snapshot.
    pub ctx: LikelihoodContext<'a>,
    pub cache: &'a LikelihoodCache,
    pub pattern_log_lik: &'a [f64],
    /// Current item parameters.
    pub params: &'a Array2<f64>,
    pub map: &'a ParamMap,
    /// A 1x1 matrix replacing the items' own prior densities. It is taken
    /// as constant in the item parameters: it shifts the deviance and adds
    /// nothing to the gradient or Hessian, which then carry the integral
    /// terms only.
    pub custom_prior: Option<&'a Array2<f64>>,
}

#[derive(Debug, Default)]
pub struct FitEvaluator {
    fit_count: u64,
    gradient_count: u64,
}

struct FitAccum {
    ll: f64,
    deriv: Vec<f64>,
    scratch: LikelihoodScratch,
    probs: NodeScratch,
    theta: Vec<f64>,
    weight: Vec<f64>,
    derivs: DerivScratch,
    eis: Vec<f64>,
    all: Vec<f64>,
}

impl FitAccum {
    fn new(input: &FitInput, with_derivs: bool) -> Self {
        let ctx = &input.ctx;
        let deriv_len = if with_derivs {
            ctx.items.len() * input.map.pad_size()
        } else {
            0
        };
        Self {
            ll: 0.0,
            deriv: vec![0.0; deriv_len],
            scratch: ctx.scratch(),
            probs: ctx.node_scratch(),
            theta: vec![0.0; ctx.items.max_dims()],
            weight: vec![0.0; ctx.items.max_outcomes()],
            derivs: DerivScratch::default(),
            eis: vec![0.0; ctx.block_len()],
            all: vec![0.0; ctx.num_patterns()],
        }
    }

    fn visit(&mut self, input: &FitInput, log_mult: &[f64], primary: usize) {
        let ctx = &input.ctx;
        let grid = ctx.grid;
        let items = ctx.items;
        let u = ctx.num_patterns();
        let groups = ctx.groups();
        let max_outcomes = items.max_outcomes();
        let pad = input.map.pad_size();
        let with_derivs = !self.deriv.is_empty();

        let lxk = input.cache.primary(ctx, primary, &mut self.scratch);
        if grid.has_specific() {
            integrate_specific(ctx, lxk, &mut self.eis, &mut self.all);
        }

        for sx in 0..grid.specific_points() {
            let node = grid.node(primary, sx);
            ctx.outcome_log_probs(input.params, node, &mut self.probs);
            let area = grid.log_area()[node].exp();

            for item in 0..items.len() {
                let spec = items.spec(item);
                let outcomes = spec.outcomes();
                let g = ctx.design.group(item);
                let block = &lxk[(sx * groups + g) * u..(sx * groups + g + 1) * u];
                let weight = &mut self.weight[..outcomes];
                weight.fill(0.0);
                let spread = (outcomes as f64).ln();
                for px in 0..u {
                    let mut observed = log_mult[px] + block[px] - input.pattern_log_lik[px];
                    if grid.has_specific() {
                        observed += self.all[px] - self.eis[g * u + px];
                    }
                    match ctx.patterns.response(px, item) {
                        Some(pick) => weight[pick] += observed.exp(),
                        None => {
                            let slice = (observed - spread).exp();
                            weight.iter_mut().for_each(|w| *w += slice);
                        }
                    }
                }

                let prob = &self.probs.prob[item * max_outcomes..item * max_outcomes + outcomes];
                let got: f64 = weight.iter().zip(prob).map(|(w, lp)| w * lp).sum();
                self.ll += got * area;

                if with_derivs {
                    let theta = &mut self.theta[..spec.dims()];
                    ctx.design.item_theta(item, &self.probs.point, theta);
                    items.model(item).deriv(
                        spec,
                        input.params.row(item),
                        theta,
                        area,
                        weight,
                        &mut self.deriv[item * pad..(item + 1) * pad],
                        &mut self.derivs,
                    );
                }
            }
        }
    }

    fn merge(mut self, other: FitAccum) -> Self {
        self.ll += other.ll;
        for (a, b) in self.deriv.iter_mut().zip(&other.deriv) {
            *a += b;
        }
        self
    }
}

impl FitEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls that requested the deviance.
    pub fn fit_count(&self) -> u64 {
        self.fit_count
    }

    /// Calls that requested a gradient or Hessian.
    pub fn gradient_count(&self) -> u64 {
        self.gradient_count
    }

    pub fn evaluate(&mut self, input: &FitInput, request: FitRequest) -> Result<FitResult> {
        if !request.fit && !request.wants_derivs() {
            return Ok(FitResult {
                deviance: 0.0,
                gradient: None,
                hessian: None,
            });
        }
        if request.fit {
            self.fit_count += 1;
        }
        let with_derivs = request.wants_derivs();
        if with_derivs {
            self.gradient_count += 1;
        }

        let items = input.ctx.items;
        let prior = match input.custom_prior {
            Some(algebra) => {
                if algebra.dim() != (1, 1) {
                    return Err(Ba81Error::NonScalarAlgebra {
                        rows: algebra.nrows(),
                        cols: algebra.ncols(),
                    });
                }
                algebra[[0, 0]]
            }
            None => (0..items.len())
                .map(|item| {
                    items
                        .model(item)
                        .prior(items.spec(item), input.params.row(item))
                })
                .sum(),
        };
        if !prior.is_finite() {
            return Err(Ba81Error::NonFinitePrior(prior));
        }

        let log_mult: Vec<f64> = input
            .ctx
            .patterns
            .multiplicity()
            .iter()
            .map(|m| m.ln())
            .collect();

        let mut accum = (0..input.ctx.grid.primary_points())
            .into_par_iter()
            .fold(
                || FitAccum::new(input, with_derivs),
                |mut acc, primary| {
                    acc.visit(input, &log_mult, primary);
                    acc
                },
            )
            .reduce_with(FitAccum::merge)
            .unwrap_or_else(|| FitAccum::new(input, with_derivs));

        let deviance = -2.0 * (prior + accum.ll);
        log::debug!(
            "fit #{} (gradient #{}): deviance {:.6}",
            self.fit_count,
            self.gradient_count,
            deviance
        );

        if !with_derivs {
            return Ok(FitResult {
                deviance,
                gradient: None,
                hessian: None,
            });
        }

        let pad = input.map.pad_size();
        if input.custom_prior.is_none() {
            for item in 0..items.len() {
                items.model(item).deriv_prior(
                    items.spec(item),
                    input.params.row(item),
                    &mut accum.deriv[item * pad..(item + 1) * pad],
                );
            }
        }

        let n = input.map.num_free();
        let mut gradient = vec![0.0; n];
        let mut hessian = request.hessian.then(|| Array2::<f64>::zeros((n, n)));
        input
            .map
            .map_derivatives(&accum.deriv, &mut gradient, hessian.as_mut());

        Ok(FitResult {
            deviance,
            gradient: request.gradient.then_some(gradient),
            hessian,
        })
    }
}
