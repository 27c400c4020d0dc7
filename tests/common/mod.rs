#![allow(dead_code)]

use ba81_rs::{
    Ba81Config, Ba81Expectation, Ba81Model, FitRequest, FreeParameter, QuadratureRule,
    ResponseData,
};
use nalgebra::{DMatrix, DVector};
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use rand_pcg::Pcg64;

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Spec rows for unidimensional 2PL items without a guessing prior.
pub fn drm_spec(items: usize) -> Array2<f64> {
    Array2::from_shape_fn((items, 5), |(_, j)| [0.0, 2.0, 1.0, 1.0, 1.0][j])
}

pub struct Simulated {
    pub theta: Vec<f64>,
    pub data: Array2<f64>,
}

/// 2PL responses (one-based) for standard normal abilities.
pub fn simulate_2pl(persons: usize, slopes: &[f64], intercepts: &[f64], seed: u64) -> Simulated {
    let mut rng = Pcg64::seed_from_u64(seed);
    let theta: Vec<f64> = (0..persons).map(|_| StandardNormal.sample(&mut rng)).collect();
    let mut data = Array2::zeros((persons, slopes.len()));
    for (i, &t) in theta.iter().enumerate() {
        for j in 0..slopes.len() {
            let p = sigmoid(slopes[j] * t + intercepts[j]);
            data[[i, j]] = if rng.random::<f64>() < p { 2.0 } else { 1.0 };
        }
    }
    Simulated { theta, data }
}

/// Starting values `[a = 1, b = 0, g = 0]`, with slopes and intercepts free.
pub fn model_2pl(data: Array2<f64>, quadrature: QuadratureRule) -> Ba81Model {
    let items = data.ncols();
    let mut item_param = Array2::zeros((items, 3));
    let mut free = Vec::new();
    for item in 0..items {
        item_param[[item, 0]] = 1.0;
        free.push(FreeParameter::new(item, 0));
        free.push(FreeParameter::new(item, 1));
    }
    Ba81Model {
        item_spec: drm_spec(items),
        item_param,
        estep_param: None,
        design: None,
        data: ResponseData::from_f64(data.view()).unwrap(),
        quadrature,
        free,
        custom_prior: None,
    }
}

pub fn expectation(model: Ba81Model, rescale: bool) -> Ba81Expectation {
    let config = Ba81Config {
        rescale,
        ..Ba81Config::default()
    };
    Ba81Expectation::new(model, config).unwrap()
}

fn max_abs(v: &[f64]) -> f64 {
    v.iter().fold(0.0, |m, x| m.max(x.abs()))
}

/// One damped Newton step on the expected complete-data deviance. Falls
/// back to steepest descent when the Hessian has no Cholesky factor.
fn newton_step(ex: &mut Ba81Expectation) -> f64 {
    let result = ex.fit(FitRequest::all()).unwrap();
    let grad = DVector::from_vec(result.gradient.unwrap());
    let hess = result.hessian.unwrap();
    let n = grad.len();
    let h = DMatrix::from_fn(n, n, |i, j| hess[[i, j]]);
    let step = match h.cholesky() {
        Some(chol) => chol.solve(&grad),
        None => grad.clone() * 1e-3,
    };

    let x0 = DVector::from_vec(ex.free_values());
    let mut scale = 1.0;
    for _ in 0..20 {
        let x = &x0 - &step * scale;
        ex.set_free_values(x.as_slice()).unwrap();
        let dev = ex.fit(FitRequest::fit()).unwrap().deviance;
        if dev.is_finite() && dev <= result.deviance + 1e-9 * result.deviance.abs() {
            return max_abs(grad.as_slice());
        }
        scale *= 0.5;
    }
    ex.set_free_values(x0.as_slice()).unwrap();
    max_abs(grad.as_slice())
}

pub struct EmTrace {
    pub deviance: Vec<f64>,
    pub gradient: f64,
    pub iterations: usize,
}

/// Alternate E-steps with a few Newton M-steps until the gradient taken
/// right after an E-step (where it equals the observed-data gradient) is
/// below `tol`.
pub fn run_em(ex: &mut Ba81Expectation, tol: f64, max_iter: usize) -> EmTrace {
    let mut deviance = Vec::new();
    let mut gradient = f64::INFINITY;
    let mut iterations = 0;
    while iterations < max_iter {
        iterations += 1;
        deviance.push(ex.e_step().deviance());
        gradient = newton_step(ex);
        if gradient < tol {
            break;
        }
        for _ in 0..4 {
            if newton_step(ex) < tol * 0.1 {
                break;
            }
        }
    }
    EmTrace {
        deviance,
        gradient,
        iterations,
    }
}

pub fn correlation(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len() as f64;
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (a, b) in x.iter().zip(y) {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx) * (a - mx);
        syy += (b - my) * (b - my);
    }
    sxy / (sxx * syy).sqrt()
}
