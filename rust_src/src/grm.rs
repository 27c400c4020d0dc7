//! Multidimensional graded response model.
//!
//! With `K` outcomes the cumulative curves are
//! `P*_j = sigmoid(a . theta + b_j)` for `j = 1..K-1`, `P*_0 = 1` and
//! `P*_K = 0`; outcome `k` has probability `P*_k - P*_{k+1}`. Parameters are
//! `[a_1 .. a_D, b_1 .. b_{K-1}]` with decreasing intercepts.

use ndarray::{Array2, ArrayView1, ArrayViewMut1};

use crate::item_model::{rescale_linear, zeroed, DerivScratch, ItemModel, ItemSpec};
use crate::utils::{log_sigmoid, sigmoid, tri_index, tri_len, EPSILON};

pub struct Grm;

fn slope_dot(param: &ArrayView1<f64>, dims: usize, theta: &[f64]) -> f64 {
    (0..dims).map(|d| param[d] * theta[d]).sum()
}

impl ItemModel for Grm {
    fn name(&self) -> &'static str {
        "grm"
    }

    fn num_spec(&self, _spec: &ItemSpec) -> usize {
        3
    }

    fn num_param(&self, spec: &ItemSpec) -> usize {
        spec.dims() + spec.outcomes() - 1
    }

    fn log_prob(&self, spec: &ItemSpec, param: ArrayView1<f64>, theta: &[f64], out: &mut [f64]) {
        let dims = spec.dims();
        let k = spec.outcomes();
        let at = slope_dot(&param, dims, theta);
        let z = |j: usize| at + param[dims + j - 1];

        out[0] = log_sigmoid(-z(1));
        out[k - 1] = log_sigmoid(z(k - 1));
        for ox in 1..k - 1 {
            out[ox] = (sigmoid(z(ox)) - sigmoid(z(ox + 1))).max(EPSILON).ln();
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
        let k = spec.outcomes();
        let np = dims + k - 1;
        let nt = tri_len(np);
        let at = slope_dot(&param, dims, theta);

        // cumulative curves and their derivatives, index 0..=k
        let DerivScratch { outcomes: od, work } = scratch;
        od.reset(k, np);
        let work = zeroed(work, (k + 1) * (1 + np + nt));
        let (star, rest) = work.split_at_mut(k + 1);
        let (dstar, d2star) = rest.split_at_mut((k + 1) * np);
        star[0] = 1.0;
        for j in 1..k {
            let bx = dims + j - 1;
            let s = sigmoid(at + param[bx]);
            let q = s * (1.0 - s);
            let r = q * (1.0 - 2.0 * s);
            star[j] = s;

            let active = (0..dims)
                .map(|d| (d, theta[d]))
                .chain(std::iter::once((bx, 1.0)));
            let d1 = &mut dstar[j * np..(j + 1) * np];
            for (p, x) in active.clone() {
                d1[p] = q * x;
            }
            let d2 = &mut d2star[j * nt..(j + 1) * nt];
            for (p2, x2) in active.clone() {
                for (p1, x1) in active.clone() {
                    if p1 <= p2 {
                        d2[tri_index(p1, p2)] = r * x1 * x2;
                    }
                }
            }
        }

        for ox in 0..k {
            od.prob[ox] = star[ox] - star[ox + 1];
            let d1 = od.d1_mut(ox);
            for p in 0..np {
                d1[p] = dstar[ox * np + p] - dstar[(ox + 1) * np + p];
            }
            let d2 = od.d2_mut(ox);
            for t in 0..nt {
                d2[t] = d2star[ox * nt + t] - d2star[(ox + 1) * nt + t];
            }
        }
        od.accumulate(weight, area, pad);
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
        let intercepts = dims..dims + spec.outcomes() - 1;
        rescale_linear(param, free, dims, intercepts, mean, cov);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, Array1};

    fn spec(outcomes: usize, dims: usize) -> ItemSpec {
        ItemSpec::from_row(0, array![1.0, outcomes as f64, dims as f64].view()).unwrap()
    }

    #[test]
    fn outcome_probabilities_sum_to_one() {
        let s = spec(4, 2);
        let param = array![1.4, 0.5, 1.5, 0.2, -1.1];
        let mut out = [0.0; 4];
        Grm.log_prob(&s, param.view(), &[0.3, -0.6], &mut out);
        let total: f64 = out.iter().map(|lp| lp.exp()).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn two_outcomes_reduce_to_logistic() {
        let s = spec(2, 1);
        let param = array![1.7, -0.4];
        let mut out = [0.0; 2];
        Grm.log_prob(&s, param.view(), &[0.9], &mut out);
        assert_relative_eq!(out[1].exp(), sigmoid(1.7 * 0.9 - 0.4), epsilon = 1e-12);
    }

    #[test]
    fn analytic_derivatives_match_finite_differences() {
        let s = spec(3, 2);
        let np = Grm.num_param(&s);
        let param = array![0.9, 1.3, 0.8, -0.7];
        let theta = [-0.2, 0.5];
        let weight = [1.0, 3.0, 2.0];
        let area = 0.3;

        let loglik = |param: &Array1<f64>| {
            let mut out = [0.0; 3];
            Grm.log_prob(&s, param.view(), &theta, &mut out);
            area * weight.iter().zip(out).map(|(w, lp)| w * lp).sum::<f64>()
        };
        let mut scratch = DerivScratch::default();
        let mut derivs = |param: &Array1<f64>| {
            let mut pad = vec![0.0; np + tri_len(np)];
            Grm.deriv(&s, param.view(), &theta, area, &weight, &mut pad, &mut scratch);
            pad
        };

        let pad = derivs(&param);
        let h = 1e-5;
        for p2 in 0..np {
            let mut up = param.clone();
            let mut dn = param.clone();
            up[p2] += h;
            dn[p2] -= h;
            assert_relative_eq!(pad[p2], (loglik(&up) - loglik(&dn)) / (2.0 * h), epsilon = 1e-6);
            let (gu, gd) = (derivs(&up), derivs(&dn));
            for p1 in 0..=p2 {
                let fd = (gu[p1] - gd[p1]) / (2.0 * h);
                assert_relative_eq!(pad[np + tri_index(p1, p2)], fd, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn reused_scratch_matches_fresh_scratch() {
        let wide = spec(4, 2);
        let narrow = spec(3, 1);
        let drm = ItemSpec::from_row(0, array![0.0, 2.0, 3.0, 1.0, 1.0].view()).unwrap();
        let mut shared = DerivScratch::default();

        let run = |s: &ItemSpec, param: &Array1<f64>, weight: &[f64], scratch: &mut DerivScratch| {
            let np = Grm.num_param(s);
            let mut pad = vec![0.0; np + tri_len(np)];
            Grm.deriv(s, param.view(), &[0.4, -0.3][..s.dims()], 0.7, weight, &mut pad, scratch);
            pad
        };

        let mut drm_pad = vec![0.0; 5 + tri_len(5)];
        crate::drm::Drm.deriv(
            &drm,
            array![0.5, 1.0, -0.2, 0.1, 0.2].view(),
            &[0.3, 0.1, -0.8],
            1.0,
            &[1.0, 2.0],
            &mut drm_pad,
            &mut shared,
        );
        let wide_param = array![1.4, 0.5, 1.5, 0.2, -1.1];
        let narrow_param = array![0.9, 0.8, -0.7];
        let a = run(&wide, &wide_param, &[1.0, 0.0, 2.0, 1.0], &mut shared);
        let b = run(&narrow, &narrow_param, &[2.0, 1.0, 3.0], &mut shared);

        let fresh_a = run(&wide, &wide_param, &[1.0, 0.0, 2.0, 1.0], &mut DerivScratch::default());
        let fresh_b = run(&narrow, &narrow_param, &[2.0, 1.0, 3.0], &mut DerivScratch::default());
        assert_eq!(a, fresh_a);
        assert_eq!(b, fresh_b);
    }

    #[test]
    fn rescale_shifts_every_intercept() {
        let s = spec(3, 1);
        let mut param = array![2.0, 1.0, -1.0];
        let cov = array![[0.25]];
        Grm.rescale(&s, param.view_mut(), &[true; 3], &[0.5], &cov);
        assert_relative_eq!(param[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(param[1], 2.0, epsilon = 1e-12);
        assert_relative_eq!(param[2], 0.0, epsilon = 1e-12);
    }
}
