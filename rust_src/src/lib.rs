//! Bifactor marginal maximum likelihood engine for multidimensional item
//! response theory (Bock & Aitkin, 1981; Cai, 2010).
//!
//! This crate provides:
//! - Quadrature grids with mixed-radix node encoding
//! - Per-pattern likelihoods with optional caching
//! - E-step with two-tier integration over specific factors
//! - Schilling-Bock latent rescaling
//! - Deviance, gradient and Hessian for an external optimizer
//! - EAP ability scoring
//! - Dichotomous and graded item response models

pub mod config;
pub mod design;
pub mod drm;
pub mod eap;
pub mod error;
pub mod estep;
pub mod expectation;
pub mod fit;
pub mod grm;
pub mod item_model;
pub mod likelihood;
pub mod param_map;
pub mod patterns;
pub mod quadrature;
pub mod rescale;
pub mod utils;

#[cfg(feature = "python")]
pub mod python;

pub use config::Ba81Config;
pub use error::{Ba81Error, Result};
pub use expectation::{Ba81Expectation, Ba81Model, EstepOutcome, LatentMoments};
pub use fit::{FitRequest, FitResult};
pub use param_map::{FreeParameter, ParamCell};
pub use patterns::ResponseData;
pub use quadrature::QuadratureRule;

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// Python module for ba81_rs
#[cfg(feature = "python")]
#[pymodule]
fn ba81_rs(m: &Bound<'_, PyModule>) -> PyResult<()> {
    python::register(m)?;
    Ok(())
}
