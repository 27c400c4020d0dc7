//! Multidimensional dichotomous response model with a lower asymptote.
//!
//! `P(correct) = g + (1 - g) * sigmoid(a . theta + b)`. Outcome 0 is the
//! incorrect response and outcome 1 the correct one. Parameters are
//! `[a_1 .. a_D, b, g]`; spec cells 3 and 4 hold the Beta prior shape of `g`
//! (1 means no prior contribution).

use ndarray::{Array2, ArrayView1, ArrayViewMut1};

use crate::item_model::{rescale_linear, DerivScratch, ItemModel, ItemSpec};
use crate::utils::{log_sigmoid, sigmoid, tri_index, EPSILON};

const SPEC_PRIOR_ALPHA: usize = 3;
const SPEC_PRIOR_BETA: usize = 4;

pub struct Drm;

impl Drm {
    fn prior_shape(spec: &ItemSpec) -> (f64, f64) {
        let cell = |i: usize| {
            spec.values()
                .get(i)
                .copied()
                .filter(|v| v.is_finite())
                .unwrap_or(1.0)
        };
        (cell(SPEC_PRIOR_ALPHA), cell(SPEC_PRIOR_BETA))
    }

    #[inline]
    fn logit(param: &ArrayView1<f64>, dims: usize, theta: &[f64]) -> f64 {
        let mut z = param[dims];
        for d in 0..dims {
            z += param[d] * theta[d];
        }
        z
    }
}

impl ItemModel for Drm {
    fn name(&self) -> &'static str {
        "drm"
    }

    fn num_spec(&self, _spec: &ItemSpec) -> usize {
        5
    }

    fn num_param(&self, spec: &ItemSpec) -> usize {
        spec.dims() + 2
    }

    fn check_spec(&self, spec: &ItemSpec) -> std::result::Result<(), String> {
        if spec.outcomes() != 2 {
            return Err(format!(
                "drm items have 2 outcomes, spec declares {}",
                spec.outcomes()
            ));
        }
        Ok(())
    }

    fn log_prob(&self, spec: &ItemSpec, param: ArrayView1<f64>, theta: &[f64], out: &mut [f64]) {
        let dims = spec.dims();
        let z = Self::logit(&param, dims, theta);
        let g = param[dims + 1];
        if g == 0.0 {
            out[0] = log_sigmoid(-z);
            out[1] = log_sigmoid(z);
        } else {
            out[0] = (1.0 - g).ln() + log_sigmoid(-z);
            out[1] = (g + (1.0 - g) * sigmoid(z)).max(EPSILON).ln();
        }
    }

    fn deriv(
        &self,
        spec: &ItemSpec,
        param: ArrayView1<f64>,
        theta: &[f64],
        area: f64,
        weight: &[f64],
        pad: &mut [f64],
        scratch: &mut DerivScratch,
    ) {
        let dims = spec.dims();
        let np = dims + 2;
        let (bx, gx) = (dims, dims + 1);
        let z = Self::logit(&param, dims, theta);
        let g = param[gx];
        let s = sigmoid(z);
        let q = s * (1.0 - s);
        let r = q * (1.0 - 2.0 * s);

        let od = &mut scratch.outcomes;
        od.reset(2, np);
        od.prob[1] = g + (1.0 - g) * s;
        od.prob[0] = 1.0 - od.prob[1];

        let x = |p: usize| if p < dims { theta[p] } else { 1.0 };
        {
            let d1 = od.d1_mut(1);
            for p in 0..=bx {
                d1[p] = (1.0 - g) * q * x(p);
            }
            d1[gx] = 1.0 - s;
        }
        {
            let d2 = od.d2_mut(1);
            for p2 in 0..=bx {
                for p1 in 0..=p2 {
                    d2[tri_index(p1, p2)] = (1.0 - g) * r * x(p1) * x(p2);
                }
                d2[tri_index(p2, gx)] = -q * x(p2);
            }
        }
        for i in 0..np {
            od.d1[i] = -od.d1[np + i];
        }
        let nt = np * (np + 1) / 2;
        for i in 0..nt {
            od.d2[i] = -od.d2[nt + i];
        }

        od.accumulate(weight, area, pad);
    }

    fn deriv_prior(&self, spec: &ItemSpec, param: ArrayView1<f64>, pad: &mut [f64]) {
        let (alpha, beta) = Self::prior_shape(spec);
        let dims = spec.dims();
        let np = dims + 2;
        let gx = dims + 1;
        let g = param[gx];
        if alpha != 1.0 {
            pad[gx] += (alpha - 1.0) / g;
            pad[np + tri_index(gx, gx)] -= (alpha - 1.0) / (g * g);
        }
        if beta != 1.0 {
            pad[gx] -= (beta - 1.0) / (1.0 - g);
            pad[np + tri_index(gx, gx)] -= (beta - 1.0) / ((1.0 - g) * (1.0 - g));
        }
    }

    fn prior(&self, spec: &ItemSpec, param: ArrayView1<f64>) -> f64 {
        let (alpha, beta) = Self::prior_shape(spec);
        let g = param[spec.dims() + 1];
        let mut lp = 0.0;
        if alpha != 1.0 {
            lp += (alpha - 1.0) * g.ln();
        }
        if beta != 1.0 {
            lp += (beta - 1.0) * (1.0 - g).ln();
        }
        lp
    }

    fn rescale(
        &self,
        spec: &ItemSpec,
        param: ArrayViewMut1<f64>,
        free: &[bool],
        mean: &[f64],
        cov: &Array2<f64>,
    ) {
        let dims = spec.dims();
        rescale_linear(param, free, dims, dims..dims + 1, mean, cov);
    }
}
