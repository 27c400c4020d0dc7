//! Item response functions and the registry that resolves them by model id.
//!
//! Every item carries a spec row `[id, outcomes, dims, ...]`. The model
//! named by `id` interprets the remaining spec cells and the item's row of
//! the parameter matrix.

use std::sync::{Arc, OnceLock};

use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewMut1};

use crate::drm::Drm;
use crate::error::{Ba81Error, Result};
use crate::grm::Grm;
use crate::utils::{tri_index, tri_len, EPSILON};

/// Oldest item model interface this engine can drive.
pub const MIN_INTERFACE_VERSION: u32 = 3;
/// Interface version implemented by the built-in models.
pub const INTERFACE_VERSION: u32 = 3;

pub const SPEC_ID: usize = 0;
pub const SPEC_OUTCOMES: usize = 1;
pub const SPEC_DIMS: usize = 2;

#[derive(Debug, Clone)]
pub struct ItemSpec {
    id: usize,
    outcomes: usize,
    dims: usize,
    values: Vec<f64>,
}

impl ItemSpec {
    /// Parse one spec row. Trailing NaN padding is kept and ignored by models.
    pub fn from_row(item: usize, row: ArrayView1<f64>) -> Result<Self> {
        if row.len() <= SPEC_DIMS {
            return Err(Ba81Error::InvalidSpec {
                item,
                what: format!("spec row has {} cells, need at least 3", row.len()),
            });
        }
        let raw_id = row[SPEC_ID];
        if !raw_id.is_finite() || raw_id.fract() != 0.0 || raw_id < 0.0 {
            return Err(Ba81Error::UnknownModel {
                item,
                id: if raw_id.is_finite() { raw_id as i64 } else { -1 },
            });
        }
        let outcomes = spec_count(item, row[SPEC_OUTCOMES], "outcomes", 2)?;
        let dims = spec_count(item, row[SPEC_DIMS], "dims", 1)?;
        Ok(Self {
            id: raw_id as usize,
            outcomes,
            dims,
            values: row.to_vec(),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn outcomes(&self) -> usize {
        self.outcomes
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

fn spec_count(item: usize, value: f64, what: &str, min: usize) -> Result<usize> {
    if !value.is_finite() || value.fract() != 0.0 || value < min as f64 {
        return Err(Ba81Error::InvalidSpec {
            item,
            what: format!("{what} must be an integer >= {min}, found {value}"),
        });
    }
    Ok(value as usize)
}

/// Capability set of one item response model family.
///
/// `theta` always has `spec.dims()` entries. Derivatives are with respect to
/// the log-likelihood and accumulate into `pad`: the gradient occupies
/// `pad[..num_param]` and the packed lower-triangle Hessian follows at
/// `pad[num_param + tri_index(r1, r2)]`.
pub trait ItemModel: Send + Sync {
    fn name(&self) -> &'static str;

    fn num_spec(&self, spec: &ItemSpec) -> usize;

    fn num_param(&self, spec: &ItemSpec) -> usize;

    /// Reject spec rows this model cannot interpret.
    fn check_spec(&self, _spec: &ItemSpec) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Log probability of every outcome at `theta`.
    fn log_prob(&self, spec: &ItemSpec, param: ArrayView1<f64>, theta: &[f64], out: &mut [f64]);

    /// Accumulate `area * sum_k weight[k] * d log P_k` into `pad`.
    /// `scratch` belongs to the calling worker and may hold anything.
    #[allow(clippy::too_many_arguments)]
    fn deriv(
        &self,
        spec: &ItemSpec,
        param: ArrayView1<f64>,
        theta: &[f64],
        area: f64,
        weight: &[f64],
        pad: &mut [f64],
        scratch: &mut DerivScratch,
    );

    /// Add the derivatives of the log prior density.
    fn deriv_prior(&self, _spec: &ItemSpec, _param: ArrayView1<f64>, _pad: &mut [f64]) {}

    /// Log prior density of the item parameters.
    fn prior(&self, _spec: &ItemSpec, _param: ArrayView1<f64>) -> f64 {
        0.0
    }

    /// Re-express the parameters on a standardized latent scale. `mean` and
    /// `cov` are projected onto the item's dimensions with NaN for unused
    /// ones; only cells with `free[p]` set may change.
    fn rescale(
        &self,
        _spec: &ItemSpec,
        _param: ArrayViewMut1<f64>,
        _free: &[bool],
        _mean: &[f64],
        _cov: &Array2<f64>,
    ) {
    }

    fn prefit(&self, _spec: &ItemSpec, _param: ArrayViewMut1<f64>) {}

    fn postfit(&self, _spec: &ItemSpec, _param: ArrayViewMut1<f64>) {}
}

/// Built-in model families and their registry ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Drm = 0,
    Grm = 1,
}

impl ModelKind {
    pub fn id(self) -> usize {
        self as usize
    }

    fn model(self) -> Arc<dyn ItemModel> {
        match self {
            ModelKind::Drm => Arc::new(Drm),
            ModelKind::Grm => Arc::new(Grm),
        }
    }
}

pub struct ModelRegistry {
    version: u32,
    models: Vec<Arc<dyn ItemModel>>,
}

impl ModelRegistry {
    pub fn new(version: u32, models: Vec<Arc<dyn ItemModel>>) -> Result<Self> {
        if version < MIN_INTERFACE_VERSION {
            return Err(Ba81Error::InterfaceVersion {
                found: version,
                required: MIN_INTERFACE_VERSION,
            });
        }
        Ok(Self { version, models })
    }

    pub fn builtin() -> Self {
        let models = [ModelKind::Drm, ModelKind::Grm]
            .iter()
            .map(|kind| kind.model())
            .collect();
        Self {
            version: INTERFACE_VERSION,
            models,
        }
    }

    /// Process-wide registry of the built-in models.
    pub fn global() -> Arc<ModelRegistry> {
        static GLOBAL: OnceLock<Arc<ModelRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(ModelRegistry::builtin())))
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<Arc<dyn ItemModel>> {
        self.models.get(id).cloned()
    }
}

/// Item specs resolved against a registry.
#[derive(Clone)]
pub struct ItemBank {
    specs: Vec<ItemSpec>,
    models: Vec<Arc<dyn ItemModel>>,
    num_param: Vec<usize>,
    max_outcomes: usize,
    max_dims: usize,
}

impl ItemBank {
    /// `spec` has one row per item, as wide as the widest model spec.
    pub fn new(spec: ArrayView2<f64>, registry: &ModelRegistry) -> Result<Self> {
        let mut specs = Vec::with_capacity(spec.nrows());
        let mut models = Vec::with_capacity(spec.nrows());
        let mut max_spec = 0;
        for (item, row) in spec.outer_iter().enumerate() {
            let parsed = ItemSpec::from_row(item, row)?;
            let model = registry.get(parsed.id()).ok_or(Ba81Error::UnknownModel {
                item,
                id: parsed.id() as i64,
            })?;
            model
                .check_spec(&parsed)
                .map_err(|what| Ba81Error::InvalidSpec { item, what })?;
            max_spec = max_spec.max(model.num_spec(&parsed));
            specs.push(parsed);
            models.push(model);
        }
        if !specs.is_empty() && spec.ncols() != max_spec {
            return Err(Ba81Error::ShapeMismatch {
                what: "item spec columns",
                expected: max_spec,
                found: spec.ncols(),
            });
        }

        let num_param = specs
            .iter()
            .zip(&models)
            .map(|(s, m)| m.num_param(s))
            .collect();
        let max_outcomes = specs.iter().map(|s| s.outcomes()).max().unwrap_or(0);
        let max_dims = specs.iter().map(|s| s.dims()).max().unwrap_or(0);
        Ok(Self {
            specs,
            models,
            num_param,
            max_outcomes,
            max_dims,
        })
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn specs(&self) -> &[ItemSpec] {
        &self.specs
    }

    #[inline]
    pub fn spec(&self, item: usize) -> &ItemSpec {
        &self.specs[item]
    }

    #[inline]
    pub fn model(&self, item: usize) -> &dyn ItemModel {
        self.models[item].as_ref()
    }

    pub fn num_param(&self) -> &[usize] {
        &self.num_param
    }

    pub fn max_param(&self) -> usize {
        self.num_param.iter().copied().max().unwrap_or(0)
    }

    pub fn max_outcomes(&self) -> usize {
        self.max_outcomes
    }

    pub fn max_dims(&self) -> usize {
        self.max_dims
    }
}

/// Outcome probabilities with first and second parameter derivatives at one
/// ability point, shared by the built-in models to form log-likelihood
/// derivatives.
#[derive(Debug, Default)]
pub struct OutcomeDerivs {
    num_param: usize,
    pub prob: Vec<f64>,
    pub d1: Vec<f64>,
    pub d2: Vec<f64>,
}

/// Clear `buf` to `len` zeros, keeping its allocation.
pub(crate) fn zeroed(buf: &mut Vec<f64>, len: usize) -> &mut [f64] {
    buf.clear();
    buf.resize(len, 0.0);
    buf
}

impl OutcomeDerivs {
    /// Size for `outcomes x num_param` and zero every cell.
    pub fn reset(&mut self, outcomes: usize, num_param: usize) {
        self.num_param = num_param;
        zeroed(&mut self.prob, outcomes);
        zeroed(&mut self.d1, outcomes * num_param);
        zeroed(&mut self.d2, outcomes * tri_len(num_param));
    }

    #[inline]
    pub fn d1_mut(&mut self, outcome: usize) -> &mut [f64] {
        let np = self.num_param;
        &mut self.d1[outcome * np..(outcome + 1) * np]
    }

    #[inline]
    pub fn d2_mut(&mut self, outcome: usize) -> &mut [f64] {
        let nt = tri_len(self.num_param);
        &mut self.d2[outcome * nt..(outcome + 1) * nt]
    }

    pub fn accumulate(&self, weight: &[f64], area: f64, pad: &mut [f64]) {
        let np = self.num_param;
        let nt = tri_len(np);
        for (k, &w) in weight.iter().enumerate() {
            if w == 0.0 {
                continue;
            }
            let p = self.prob[k].max(EPSILON);
            let d1 = &self.d1[k * np..(k + 1) * np];
            let d2 = &self.d2[k * nt..(k + 1) * nt];
            let scale = area * w;
            for r2 in 0..np {
                pad[r2] += scale * d1[r2] / p;
                for r1 in 0..=r2 {
                    let t = tri_index(r1, r2);
                    pad[np + t] += scale * (d2[t] / p - d1[r1] * d1[r2] / (p * p));
                }
            }
        }
    }
}

/// Per-worker buffers reused across [`ItemModel::deriv`] calls.
#[derive(Debug, Default)]
pub struct DerivScratch {
    pub outcomes: OutcomeDerivs,
    /// Model-specific workspace.
    pub work: Vec<f64>,
}

/// Cholesky factor of the finite block of `cov` restricted to `dims`.
pub(crate) fn finite_cholesky(cov: &Array2<f64>, dims: &[usize]) -> Option<nalgebra::DMatrix<f64>> {
    let n = dims.len();
    let block = nalgebra::DMatrix::from_fn(n, n, |i, j| cov[[dims[i], dims[j]]]);
    block.cholesky().map(|c| c.l())
}

/// Schilling-Bock update of slopes and intercepts for `theta = mean + L z`:
/// slopes become `L' a` and every intercept gains `a . mean`.
pub(crate) fn rescale_linear(
    mut param: ArrayViewMut1<f64>,
    free: &[bool],
    dims: usize,
    intercepts: std::ops::Range<usize>,
    mean: &[f64],
    cov: &Array2<f64>,
) {
    let active: Vec<usize> = (0..dims)
        .filter(|&d| mean[d].is_finite() && cov[[d, d]].is_finite())
        .collect();
    if active.is_empty() {
        return;
    }
    let Some(chol) = finite_cholesky(cov, &active) else {
        return;
    };

    let slopes: Vec<f64> = active.iter().map(|&d| param[d]).collect();
    let shift: f64 = active
        .iter()
        .zip(&slopes)
        .map(|(&d, &a)| a * mean[d])
        .sum();

    for b in intercepts {
        if free[b] {
            param[b] += shift;
        }
    }
    for (i, &d) in active.iter().enumerate() {
        if !free[d] {
            continue;
        }
        param[d] = (i..active.len()).map(|j| chol[(j, i)] * slopes[j]).sum();
    }
}
