//! Engine options.

use serde::{Deserialize, Serialize};

use crate::eap::EapEstimator;

fn default_true() -> bool {
    true
}

fn default_eap_point_factor() -> usize {
    2
}

fn default_eap_width() -> f64 {
    4.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ba81Config {
    /// Rescale item parameters to a standardized latent scale after each E-step.
    #[serde(default = "default_true")]
    pub rescale: bool,
    /// Keep every per-node likelihood block in memory between passes.
    #[serde(default = "default_true")]
    pub cache: bool,
    #[serde(default = "default_eap_point_factor")]
    pub eap_point_factor: usize,
    #[serde(default = "default_eap_width")]
    pub eap_width: f64,
    /// Size of a dedicated worker pool; the global rayon pool when unset.
    #[serde(default)]
    pub threads: Option<usize>,
}

impl Default for Ba81Config {
    fn default() -> Self {
        Self {
            rescale: true,
            cache: true,
            eap_point_factor: default_eap_point_factor(),
            eap_width: default_eap_width(),
            threads: None,
        }
    }
}

impl Ba81Config {
    pub fn eap_estimator(&self) -> EapEstimator {
        EapEstimator {
            point_factor: self.eap_point_factor,
            width: self.eap_width,
            cache: self.cache,
        }
    }
}
