//! Per-pattern log-likelihoods at quadrature nodes.
//!
//! Likelihoods are produced in primary-major blocks: for primary point `p`
//! the block holds `specific_points * groups * patterns` values indexed
//! `(sx * groups + g) * patterns + px`. Without specific factors there is a
//! single group and a single specific point, so a block is one node.

use ndarray::Array2;
use rayon::prelude::*;

use crate::design::Design;
use crate::item_model::ItemBank;
use crate::patterns::ResponsePatterns;
use crate::quadrature::QuadratureGrid;

/// Everything needed to evaluate the response model over a grid.
#[derive(Clone, Copy)]
pub struct LikelihoodContext<'a> {
    pub grid: &'a QuadratureGrid,
    pub design: &'a Design,
    pub items: &'a ItemBank,
    pub patterns: &'a ResponsePatterns,
    /// Parameters the cached likelihoods are computed from.
    pub params: &'a Array2<f64>,
}

/// Per-worker buffers for evaluating one node.
pub struct NodeScratch {
    pub point: Vec<f64>,
    theta: Vec<f64>,
    pub prob: Vec<f64>,
}

pub struct LikelihoodScratch {
    pub node: NodeScratch,
    lxk: Vec<f64>,
}

impl<'a> LikelihoodContext<'a> {
    pub fn num_patterns(&self) -> usize {
        self.patterns.len()
    }

    pub fn groups(&self) -> usize {
        self.design.num_groups()
    }

    pub fn block_len(&self) -> usize {
        self.groups() * self.patterns.len()
    }

    pub fn primary_len(&self) -> usize {
        self.grid.specific_points() * self.block_len()
    }

    pub fn node_scratch(&self) -> NodeScratch {
        NodeScratch {
            point: vec![0.0; self.grid.dims()],
            theta: vec![0.0; self.items.max_dims()],
            prob: vec![0.0; self.items.len() * self.items.max_outcomes()],
        }
    }

    pub fn scratch(&self) -> LikelihoodScratch {
        LikelihoodScratch {
            node: self.node_scratch(),
            lxk: vec![0.0; self.primary_len()],
        }
    }

    /// Log outcome probabilities of every item at `node` under `params`,
    /// written to `scratch.prob` as `items x max_outcomes`. Also leaves the
    /// node's coordinates in `scratch.point`.
    pub fn outcome_log_probs(&self, params: &Array2<f64>, node: usize, scratch: &mut NodeScratch) {
        let max_outcomes = self.items.max_outcomes();
        self.grid.point(node, &mut scratch.point);
        for item in 0..self.items.len() {
            let spec = self.items.spec(item);
            let theta = &mut scratch.theta[..spec.dims()];
            self.design.item_theta(item, &scratch.point, theta);
            let out = &mut scratch.prob[item * max_outcomes..item * max_outcomes + spec.outcomes()];
            self.items
                .model(item)
                .log_prob(spec, params.row(item), theta, out);
        }
    }

    /// Per-group pattern log-likelihoods at one node, `groups x patterns`.
    pub fn fill_node(&self, node: usize, scratch: &mut NodeScratch, out: &mut [f64]) {
        self.outcome_log_probs(self.params, node, scratch);
        out.fill(0.0);
        let n_patterns = self.patterns.len();
        let max_outcomes = self.items.max_outcomes();
        for item in 0..self.items.len() {
            let base = self.design.group(item) * n_patterns;
            let prob = &scratch.prob[item * max_outcomes..];
            for px in 0..n_patterns {
                if let Some(pick) = self.patterns.response(px, item) {
                    out[base + px] += prob[pick];
                }
            }
        }
    }

    pub fn fill_primary(&self, primary: usize, scratch: &mut NodeScratch, out: &mut [f64]) {
        let block = self.block_len();
        for (sx, chunk) in out.chunks_mut(block).enumerate() {
            self.fill_node(self.grid.node(primary, sx), scratch, chunk);
        }
    }
}

/// Optional store of every likelihood block for the current E-step
/// parameters. When disabled, blocks are recomputed on request.
#[derive(Debug, Default)]
pub struct LikelihoodCache {
    enabled: bool,
    data: Vec<f64>,
}

impl LikelihoodCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            data: Vec::new(),
        }
    }

    /// Drop stored blocks, e.g. after the grid resolution changes.
    pub fn invalidate(&mut self) {
        self.data = Vec::new();
    }

    pub fn fill(&mut self, ctx: &LikelihoodContext) {
        if !self.enabled {
            return;
        }
        let len = ctx.primary_len();
        let total = ctx.grid.primary_points() * len;
        if self.data.len() != total {
            log::debug!(
                "allocating likelihood cache: {} primary points x {} values",
                ctx.grid.primary_points(),
                len
            );
            self.data = vec![0.0; total];
        }
        if len == 0 {
            return;
        }
        self.data
            .par_chunks_mut(len)
            .enumerate()
            .for_each_init(
                || ctx.node_scratch(),
                |scratch, (primary, chunk)| ctx.fill_primary(primary, scratch, chunk),
            );
    }

    /// Likelihood blocks for `primary`, from the cache or freshly computed
    /// into `scratch`.
    pub fn primary<'s>(
        &'s self,
        ctx: &LikelihoodContext,
        primary: usize,
        scratch: &'s mut LikelihoodScratch,
    ) -> &'s [f64] {
        if self.enabled {
            let len = ctx.primary_len();
            &self.data[primary * len..(primary + 1) * len]
        } else {
            let LikelihoodScratch { node, lxk } = scratch;
            ctx.fill_primary(primary, node, lxk);
            lxk
        }
    }
}
