//! Python bindings for the BA81 engine.

use ndarray::Array2;
use numpy::{PyArray1, PyArray2, PyReadonlyArray1, PyReadonlyArray2, ToPyArray};
use pyo3::prelude::*;

use crate::config::Ba81Config;
use crate::expectation::{Ba81Expectation, Ba81Model};
use crate::fit::FitRequest;
use crate::item_model::ModelRegistry;
use crate::param_map::FreeParameter;
use crate::patterns::ResponseData;
use crate::quadrature::QuadratureRule;

/// Free cells from a boolean mask shaped like the parameter matrix; every
/// cell an item actually uses when no mask is given.
fn free_parameters(
    item_spec: &Array2<f64>,
    item_param: &Array2<f64>,
    mask: Option<Array2<bool>>,
) -> PyResult<Vec<FreeParameter>> {
    if let Some(mask) = mask {
        return Ok(mask
            .indexed_iter()
            .filter(|(_, free)| **free)
            .map(|((item, param), _)| FreeParameter::new(item, param))
            .collect());
    }
    let bank = crate::item_model::ItemBank::new(item_spec.view(), &ModelRegistry::global())?;
    let mut free = Vec::new();
    for item in 0..item_param.nrows().min(bank.len()) {
        for param in 0..bank.num_param()[item] {
            free.push(FreeParameter::new(item, param));
        }
    }
    Ok(free)
}

#[allow(clippy::too_many_arguments)]
fn build(
    item_spec: PyReadonlyArray2<f64>,
    item_param: PyReadonlyArray2<f64>,
    data: PyReadonlyArray2<f64>,
    quad_points: PyReadonlyArray1<f64>,
    quad_areas: PyReadonlyArray1<f64>,
    design: Option<PyReadonlyArray2<f64>>,
    free_mask: Option<PyReadonlyArray2<bool>>,
    custom_prior: Option<f64>,
    config: Ba81Config,
) -> PyResult<Ba81Expectation> {
    let item_spec = item_spec.as_array().to_owned();
    let item_param = item_param.as_array().to_owned();
    let free = free_parameters(
        &item_spec,
        &item_param,
        free_mask.map(|m| m.as_array().to_owned()),
    )?;
    let model = Ba81Model {
        item_spec,
        item_param,
        estep_param: None,
        design: design.map(|d| d.as_array().to_owned()),
        data: ResponseData::from_f64(data.as_array())?,
        quadrature: QuadratureRule::new(
            quad_points.as_array().to_vec(),
            quad_areas.as_array().to_vec(),
        )?,
        free,
        custom_prior: custom_prior.map(|v| Array2::from_elem((1, 1), v)),
    };
    Ok(Ba81Expectation::new(model, config)?)
}

/// Run one E-step (with optional Schilling-Bock rescaling)
///
/// Parameters:
/// - item_spec: (n_items, n_spec) rows of [model id, outcomes, dims, ...]
/// - item_param: (n_items, max_param) item parameters
/// - data: (n_persons, n_items) one-based categories, NaN for missing
/// - quad_points, quad_areas: univariate quadrature rule
/// - design: optional (n_items, max_dims) one-based ability indices
///
/// Returns:
/// - marginal log-likelihood
/// - latent mean (n_abilities,)
/// - latent covariance (n_abilities, n_abilities)
/// - item parameters after rescaling (n_items, max_param)
#[allow(clippy::too_many_arguments)]
#[pyfunction]
#[pyo3(signature = (item_spec, item_param, data, quad_points, quad_areas, design=None, free_mask=None, rescale=true, cache=true))]
pub fn ba81_estep<'py>(
    py: Python<'py>,
    item_spec: PyReadonlyArray2<f64>,
    item_param: PyReadonlyArray2<f64>,
    data: PyReadonlyArray2<f64>,
    quad_points: PyReadonlyArray1<f64>,
    quad_areas: PyReadonlyArray1<f64>,
    design: Option<PyReadonlyArray2<f64>>,
    free_mask: Option<PyReadonlyArray2<bool>>,
    rescale: bool,
    cache: bool,
) -> PyResult<(
    f64,
    Bound<'py, PyArray1<f64>>,
    Bound<'py, PyArray2<f64>>,
    Bound<'py, PyArray2<f64>>,
)> {
    let config = Ba81Config {
        rescale,
        cache,
        ..Ba81Config::default()
    };
    let mut expectation = build(
        item_spec, item_param, data, quad_points, quad_areas, design, free_mask, None, config,
    )?;

    let ll = py.detach(|| expectation.e_step().log_likelihood);
    let (mean, cov) = match expectation.latent() {
        Some(latent) => (latent.mean.clone(), latent.cov.clone()),
        None => (ndarray::Array1::zeros(0), Array2::zeros((0, 0))),
    };
    Ok((
        ll,
        mean.to_pyarray(py),
        cov.to_pyarray(py),
        expectation.params().to_pyarray(py),
    ))
}

/// Deviance, gradient and optionally Hessian at the current parameters
///
/// Runs an E-step without rescaling first, so the expected counts come from
/// the same parameters.
///
/// Returns:
/// - deviance
/// - gradient (n_free,)
/// - hessian (n_free, n_free) or None
#[allow(clippy::too_many_arguments)]
#[pyfunction]
#[pyo3(signature = (item_spec, item_param, data, quad_points, quad_areas, design=None, free_mask=None, custom_prior=None, hessian=false))]
pub fn ba81_fit<'py>(
    py: Python<'py>,
    item_spec: PyReadonlyArray2<f64>,
    item_param: PyReadonlyArray2<f64>,
    data: PyReadonlyArray2<f64>,
    quad_points: PyReadonlyArray1<f64>,
    quad_areas: PyReadonlyArray1<f64>,
    design: Option<PyReadonlyArray2<f64>>,
    free_mask: Option<PyReadonlyArray2<bool>>,
    custom_prior: Option<f64>,
    hessian: bool,
) -> PyResult<(
    f64,
    Bound<'py, PyArray1<f64>>,
    Option<Bound<'py, PyArray2<f64>>>,
)> {
    let config = Ba81Config {
        rescale: false,
        ..Ba81Config::default()
    };
    let mut expectation = build(
        item_spec,
        item_param,
        data,
        quad_points,
        quad_areas,
        design,
        free_mask,
        custom_prior,
        config,
    )?;
    let request = if hessian {
        FitRequest::all()
    } else {
        FitRequest::gradient()
    };

    let result = py.detach(|| {
        expectation.e_step();
        expectation.fit(request)
    })?;

    let gradient = ndarray::Array1::from(result.gradient.unwrap_or_default());
    Ok((
        result.deviance,
        gradient.to_pyarray(py),
        result.hessian.map(|h| h.to_pyarray(py)),
    ))
}

/// EAP ability scores on a flat grid twice as fine as the working rule
///
/// Returns:
/// - mean (n_persons, n_abilities)
/// - sd (n_persons, n_abilities)
#[allow(clippy::too_many_arguments)]
#[pyfunction]
#[pyo3(signature = (item_spec, item_param, data, quad_points, quad_areas, design=None, point_factor=2, width=4.0))]
pub fn ba81_eap<'py>(
    py: Python<'py>,
    item_spec: PyReadonlyArray2<f64>,
    item_param: PyReadonlyArray2<f64>,
    data: PyReadonlyArray2<f64>,
    quad_points: PyReadonlyArray1<f64>,
    quad_areas: PyReadonlyArray1<f64>,
    design: Option<PyReadonlyArray2<f64>>,
    point_factor: usize,
    width: f64,
) -> PyResult<(Bound<'py, PyArray2<f64>>, Bound<'py, PyArray2<f64>>)> {
    let config = Ba81Config {
        rescale: false,
        eap_point_factor: point_factor,
        eap_width: width,
        ..Ba81Config::default()
    };
    let mut expectation = build(
        item_spec, item_param, data, quad_points, quad_areas, design, None, None, config,
    )?;
    let scores = py.detach(|| expectation.eap())?;
    Ok((scores.mean.to_pyarray(py), scores.sd.to_pyarray(py)))
}

pub fn register(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(ba81_estep, m)?)?;
    m.add_function(wrap_pyfunction!(ba81_fit, m)?)?;
    m.add_function(wrap_pyfunction!(ba81_eap, m)?)?;
    Ok(())
}
