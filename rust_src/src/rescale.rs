//! Schilling & Bock (2005) rescaling of item parameters onto a standardized
//! latent scale after each E-step.

use ndarray::{Array1, Array2};

use crate::design::Design;
use crate::item_model::ItemBank;
use crate::param_map::ParamMap;

/// Lower Cholesky factor of the latent covariance, if it is positive definite.
pub fn latent_cholesky(cov: &Array2<f64>) -> Option<nalgebra::DMatrix<f64>> {
    let n = cov.nrows();
    let m = nalgebra::DMatrix::from_fn(n, n, |i, j| cov[[i, j]]);
    m.cholesky().map(|c| c.l())
}

/// Population moments restricted to the abilities `item` measures, in item
/// dimension order. Unassigned dimensions are NaN.
pub fn project(
    design: &Design,
    item: usize,
    dims: usize,
    mean: &Array1<f64>,
    cov: &Array2<f64>,
) -> (Vec<f64>, Array2<f64>) {
    let abilities: Vec<Option<usize>> = (0..dims).map(|d| design.ability(item, d)).collect();
    let item_mean = abilities
        .iter()
        .map(|a| a.map(|a| mean[a]).unwrap_or(f64::NAN))
        .collect();
    let item_cov = Array2::from_shape_fn((dims, dims), |(d1, d2)| {
        match (abilities[d1], abilities[d2]) {
            (Some(a1), Some(a2)) => cov[[a1, a2]],
            _ => f64::NAN,
        }
    });
    (item_mean, item_cov)
}

/// Rescale every item in place and return the resulting free-parameter
/// vector.
pub fn rescale_items(
    items: &ItemBank,
    design: &Design,
    map: &ParamMap,
    params: &mut Array2<f64>,
    mean: &Array1<f64>,
    cov: &Array2<f64>,
) -> Vec<f64> {
    for item in 0..items.len() {
        let spec = items.spec(item);
        let (item_mean, item_cov) = project(design, item, spec.dims(), mean, cov);
        let free = map.free_mask(item);
        items
            .model(item)
            .rescale(spec, params.row_mut(item), &free, &item_mean, &item_cov);
    }
    map.free_values(params)
}
