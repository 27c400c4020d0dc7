//! Stateful BA81 expectation: owns the data, item parameters and grid for
//! one model and sequences the E-step, rescaling, fit and scoring passes.

use std::sync::Arc;

use ndarray::{Array1, Array2};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::Ba81Config;
use crate::design::Design;
use crate::eap::EapScores;
use crate::error::{Ba81Error, Result};
use crate::estep;
use crate::fit::{FitEvaluator, FitInput, FitRequest, FitResult};
use crate::item_model::{ItemBank, ModelRegistry};
use crate::likelihood::{LikelihoodCache, LikelihoodContext};
use crate::param_map::{FreeParameter, ParamMap};
use crate::patterns::{ResponseData, ResponsePatterns};
use crate::quadrature::{QuadratureGrid, QuadratureRule};
use crate::rescale::{latent_cholesky, rescale_items};

/// Model definition handed to [`Ba81Expectation::new`].
#[derive(Debug, Clone)]
pub struct Ba81Model {
    /// One row per item: `[model id, outcomes, dims, model-specific...]`.
    pub item_spec: Array2<f64>,
    /// One row per item, as wide as the largest parameter count.
    pub item_param: Array2<f64>,
    /// Parameters for the first E-step's likelihoods, in place of
    /// `item_param`. Later E-steps use the current parameters.
    pub estep_param: Option<Array2<f64>>,
    /// One-based ability per item dimension; identity when absent.
    pub design: Option<Array2<f64>>,
    pub data: ResponseData,
    pub quadrature: QuadratureRule,
    pub free: Vec<FreeParameter>,
    /// 1x1 algebra replacing the items' own priors; constant in the item
    /// parameters, so it never enters the gradient.
    pub custom_prior: Option<Array2<f64>>,
}

#[derive(Debug, Clone)]
pub struct LatentMoments {
    pub mean: Array1<f64>,
    pub cov: Array2<f64>,
}

#[derive(Debug, Clone)]
pub struct EstepOutcome {
    /// Marginal log-likelihood of the data under the E-step parameters.
    pub log_likelihood: f64,
    /// Free-parameter vector after rescaling, if rescaling ran.
    pub rescaled: Option<Vec<f64>>,
}

impl EstepOutcome {
    pub fn deviance(&self) -> f64 {
        -2.0 * self.log_likelihood
    }
}

pub struct Ba81Expectation {
    config: Ba81Config,
    items: ItemBank,
    design: Design,
    patterns: ResponsePatterns,
    grid: QuadratureGrid,
    params: Array2<f64>,
    estep_params: Array2<f64>,
    pending_estep_params: Option<Array2<f64>>,
    map: ParamMap,
    cache: LikelihoodCache,
    custom_prior: Option<Array2<f64>>,
    pattern_log_lik: Option<Vec<f64>>,
    latent: Option<LatentMoments>,
    evaluator: FitEvaluator,
    pool: Option<ThreadPool>,
}

fn in_pool<R: Send>(pool: &Option<ThreadPool>, f: impl FnOnce() -> R + Send) -> R {
    match pool {
        Some(pool) => pool.install(f),
        None => f(),
    }
}

impl Ba81Expectation {
    pub fn new(model: Ba81Model, config: Ba81Config) -> Result<Self> {
        Self::with_registry(model, config, ModelRegistry::global())
    }

    pub fn with_registry(
        model: Ba81Model,
        config: Ba81Config,
        registry: Arc<ModelRegistry>,
    ) -> Result<Self> {
        let items = ItemBank::new(model.item_spec.view(), &registry)?;

        if model.data.items() != items.len() {
            return Err(Ba81Error::ShapeMismatch {
                what: "data columns (items)",
                expected: items.len(),
                found: model.data.items(),
            });
        }
        if model.item_param.nrows() != items.len() {
            return Err(Ba81Error::ShapeMismatch {
                what: "item parameter rows",
                expected: items.len(),
                found: model.item_param.nrows(),
            });
        }
        if model.item_param.ncols() != items.max_param() {
            return Err(Ba81Error::ShapeMismatch {
                what: "item parameter columns",
                expected: items.max_param(),
                found: model.item_param.ncols(),
            });
        }

        if let Some(estep) = &model.estep_param {
            if estep.nrows() != model.item_param.nrows() {
                return Err(Ba81Error::ShapeMismatch {
                    what: "E-step parameter rows",
                    expected: model.item_param.nrows(),
                    found: estep.nrows(),
                });
            }
            if estep.ncols() != model.item_param.ncols() {
                return Err(Ba81Error::ShapeMismatch {
                    what: "E-step parameter columns",
                    expected: model.item_param.ncols(),
                    found: estep.ncols(),
                });
            }
        }

        let patterns = ResponsePatterns::from_data(&model.data)?;
        for (item, spec) in items.specs().iter().enumerate() {
            let observed = patterns.max_category(item).map_or(0, |c| c + 1);
            if observed > spec.outcomes() {
                return Err(Ba81Error::OutcomeOverflow {
                    column: item,
                    found: observed as i32,
                    outcomes: spec.outcomes(),
                });
            }
            if observed < spec.outcomes() {
                log::warn!(
                    "data for item {} has only {} outcomes, not {}",
                    item,
                    observed,
                    spec.outcomes()
                );
            }
        }

        let design = match model.design {
            Some(matrix) => Design::new(matrix, items.specs())?,
            None => Design::identity(items.specs()),
        };
        let grid = QuadratureGrid::new(model.quadrature, design.max_dims(), design.has_specific());
        let map = ParamMap::new(&model.free, items.num_param())?;

        let pool = config
            .threads
            .map(|n| ThreadPoolBuilder::new().num_threads(n).build())
            .transpose()
            .map_err(|e| Ba81Error::ThreadPool(e.to_string()))?;

        let mut params = model.item_param;
        for item in 0..items.len() {
            items
                .model(item)
                .prefit(items.spec(item), params.row_mut(item));
        }

        log::debug!(
            "ba81: {} items, {} patterns of {} rows, {} abilities ({} specific), {} free",
            items.len(),
            patterns.len(),
            patterns.rows(),
            design.max_abilities(),
            design.num_specific(),
            map.num_free()
        );

        Ok(Self {
            cache: LikelihoodCache::new(config.cache),
            estep_params: params.clone(),
            pending_estep_params: model.estep_param,
            config,
            items,
            design,
            patterns,
            grid,
            params,
            map,
            custom_prior: model.custom_prior,
            pattern_log_lik: None,
            latent: None,
            evaluator: FitEvaluator::new(),
            pool,
        })
    }

    /// Replace the quadrature rule; cached likelihoods are discarded.
    pub fn set_quadrature(&mut self, rule: QuadratureRule) {
        self.grid = QuadratureGrid::new(rule, self.design.max_dims(), self.design.has_specific());
        self.cache.invalidate();
        self.pattern_log_lik = None;
    }

    /// Push optimizer values into the item parameter matrix.
    pub fn set_free_values(&mut self, values: &[f64]) -> Result<()> {
        self.map.apply(values, &mut self.params)
    }

    pub fn free_values(&self) -> Vec<f64> {
        self.map.free_values(&self.params)
    }

    pub fn e_step(&mut self) -> EstepOutcome {
        match self.pending_estep_params.take() {
            Some(first) => self.estep_params.assign(&first),
            None => self.estep_params.assign(&self.params),
        }
        let ctx = LikelihoodContext {
            grid: &self.grid,
            design: &self.design,
            items: &self.items,
            patterns: &self.patterns,
            params: &self.estep_params,
        };
        let cache = &mut self.cache;
        let result = in_pool(&self.pool, || {
            cache.fill(&ctx);
            estep::run(&ctx, cache)
        });

        let log_likelihood = result.log_likelihood(self.patterns.multiplicity());
        log::debug!("E-step: marginal -2LL {:.6}", -2.0 * log_likelihood);

        let chol = latent_cholesky(&result.cov);
        if chol.is_none() {
            log::warn!("latent covariance is not positive definite; rescaling disabled");
        }
        let rescaled = match chol {
            Some(_) if self.config.rescale => Some(rescale_items(
                &self.items,
                &self.design,
                &self.map,
                &mut self.params,
                &result.mean,
                &result.cov,
            )),
            _ => None,
        };

        self.latent = Some(LatentMoments {
            mean: result.mean,
            cov: result.cov,
        });
        self.pattern_log_lik = Some(result.pattern_log_lik);

        EstepOutcome {
            log_likelihood,
            rescaled,
        }
    }

    pub fn fit(&mut self, request: FitRequest) -> Result<FitResult> {
        let pattern_log_lik = self.pattern_log_lik.as_deref().ok_or(Ba81Error::NoEstep)?;
        let input = FitInput {
            ctx: LikelihoodContext {
                grid: &self.grid,
                design: &self.design,
                items: &self.items,
                patterns: &self.patterns,
                params: &self.estep_params,
            },
            cache: &self.cache,
            pattern_log_lik,
            params: &self.params,
            map: &self.map,
            custom_prior: self.custom_prior.as_ref(),
        };
        let evaluator = &mut self.evaluator;
        in_pool(&self.pool, || evaluator.evaluate(&input, request))
    }

    /// Score every respondent, then run each item's post-fit hook.
    pub fn eap(&mut self) -> Result<EapScores> {
        let estimator = self.config.eap_estimator();
        let working_points = self.grid.rule().len();
        let scores = in_pool(&self.pool, || {
            estimator.estimate(
                &self.items,
                &self.design,
                &self.patterns,
                &self.params,
                working_points,
            )
        })?;
        for item in 0..self.items.len() {
            self.items
                .model(item)
                .postfit(self.items.spec(item), self.params.row_mut(item));
        }
        Ok(scores)
    }

    pub fn config(&self) -> &Ba81Config {
        &self.config
    }

    pub fn params(&self) -> &Array2<f64> {
        &self.params
    }

    pub fn design(&self) -> &Design {
        &self.design
    }

    pub fn patterns(&self) -> &ResponsePatterns {
        &self.patterns
    }

    pub fn items(&self) -> &ItemBank {
        &self.items
    }

    pub fn num_free(&self) -> usize {
        self.map.num_free()
    }

    pub fn pattern_log_lik(&self) -> Option<&[f64]> {
        self.pattern_log_lik.as_deref()
    }

    /// Population moments from the last E-step.
    pub fn latent(&self) -> Option<&LatentMoments> {
        self.latent.as_ref()
    }

    pub fn fit_count(&self) -> u64 {
        self.evaluator.fit_count()
    }

    pub fn gradient_count(&self) -> u64 {
        self.evaluator.gradient_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn model() -> Ba81Model {
        let n = f64::NAN;
        Ba81Model {
            item_spec: array![[0.0, 2.0, 1.0, 1.0, 1.0], [1.0, 3.0, 1.0, n, n]],
            item_param: array![[1.0, 0.0, 0.0], [1.2, 0.8, -0.8]],
            estep_param: None,
            design: None,
            data: ResponseData::new(array![[1, 1], [2, 3], [2, 2], [1, 2], [2, 3]]).unwrap(),
            quadrature: QuadratureRule::normal(11, 4.0).unwrap(),
            free: vec![
                FreeParameter::new(0, 0),
                FreeParameter::new(0, 1),
                FreeParameter::new(1, 0),
                FreeParameter::new(1, 1),
                FreeParameter::new(1, 2),
            ],
            custom_prior: None,
        }
    }

    #[test]
    fn fit_before_estep_is_an_error() {
        let mut ex = Ba81Expectation::new(model(), Ba81Config::default()).unwrap();
        assert!(matches!(ex.fit(FitRequest::fit()), Err(Ba81Error::NoEstep)));
        ex.e_step();
        assert!(ex.fit(FitRequest::fit()).is_ok());
        assert_eq!(ex.fit_count(), 1);
        assert_eq!(ex.gradient_count(), 0);
    }

    #[test]
    fn construction_validates_shapes_and_data() {
        let mut m = model();
        m.item_param = Array2::zeros((2, 4));
        assert!(matches!(
            Ba81Expectation::new(m, Ba81Config::default()),
            Err(Ba81Error::ShapeMismatch { expected: 3, found: 4, .. })
        ));

        let mut m = model();
        m.data = ResponseData::new(array![[3, 1]]).unwrap();
        assert!(matches!(
            Ba81Expectation::new(m, Ba81Config::default()),
            Err(Ba81Error::OutcomeOverflow { column: 0, found: 3, outcomes: 2 })
        ));

        let mut m = model();
        m.free.push(FreeParameter::new(0, 0));
        assert!(matches!(
            Ba81Expectation::new(m, Ba81Config::default()),
            Err(Ba81Error::DuplicateParam { item: 0, param: 0 })
        ));

        let registry = Arc::new(ModelRegistry::new(3, Vec::new()).unwrap());
        assert!(matches!(
            Ba81Expectation::with_registry(model(), Ba81Config::default(), registry),
            Err(Ba81Error::UnknownModel { item: 0, id: 0 })
        ));
    }

    #[test]
    fn rescaled_values_round_trip_through_free_vector() {
        let mut ex = Ba81Expectation::new(model(), Ba81Config::default()).unwrap();
        let outcome = ex.e_step();
        let rescaled = outcome.rescaled.clone().unwrap();
        assert_eq!(rescaled, ex.free_values());
        assert!(outcome.deviance() > 0.0);

        let latent = ex.latent().unwrap();
        assert_eq!(latent.cov.dim(), (1, 1));
        assert!(latent.cov[[0, 0]] > 0.0);

        let mut shifted = rescaled.clone();
        shifted[0] += 0.5;
        ex.set_free_values(&shifted).unwrap();
        assert_eq!(ex.params()[[0, 0]], shifted[0]);
        assert!(ex.set_free_values(&shifted[..2]).is_err());
    }

    #[test]
    fn dedicated_pool_gives_same_estep() {
        let config = Ba81Config {
            threads: Some(2),
            rescale: false,
            ..Ba81Config::default()
        };
        let mut a = Ba81Expectation::new(model(), config).unwrap();
        let mut b = Ba81Expectation::new(
            model(),
            Ba81Config {
                rescale: false,
                ..Ba81Config::default()
            },
        )
        .unwrap();
        let (la, lb) = (a.e_step().log_likelihood, b.e_step().log_likelihood);
        approx::assert_relative_eq!(la, lb, max_relative = 1e-12);
    }

    #[test]
    fn changing_quadrature_requires_new_estep() {
        let mut ex = Ba81Expectation::new(model(), Ba81Config::default()).unwrap();
        ex.e_step();
        ex.set_quadrature(QuadratureRule::normal(15, 4.0).unwrap());
        assert!(ex.pattern_log_lik().is_none());
        ex.e_step();
        assert_eq!(ex.pattern_log_lik().map(|p| p.len()), Some(ex.patterns().len()));
    }

    #[test]
    fn degenerate_latent_variance_skips_rescaling() {
        let mut m = model();
        m.quadrature = QuadratureRule::new(vec![0.0], vec![1.0]).unwrap();
        let before = m.item_param.clone();
        let mut ex = Ba81Expectation::new(m, Ba81Config::default()).unwrap();

        let outcome = ex.e_step();
        assert!(outcome.rescaled.is_none());
        assert!(outcome.log_likelihood.is_finite());
        assert_eq!(ex.params(), &before);

        let latent = ex.latent().unwrap();
        assert_eq!(latent.mean[0], 0.0);
        assert_eq!(latent.cov[[0, 0]], 0.0);
        assert!(ex.pattern_log_lik().is_some());
        assert!(ex.fit(FitRequest::fit()).is_ok());
    }

    #[test]
    fn first_estep_uses_supplied_parameters() {
        let config = Ba81Config {
            rescale: false,
            ..Ba81Config::default()
        };
        let mut shifted = model().item_param;
        shifted[[0, 0]] = 2.5;
        shifted[[1, 1]] = 1.4;

        let mut reference = model();
        reference.item_param = shifted.clone();
        let expected = Ba81Expectation::new(reference, config.clone())
            .unwrap()
            .e_step()
            .log_likelihood;
        let plain = Ba81Expectation::new(model(), config.clone())
            .unwrap()
            .e_step()
            .log_likelihood;

        let mut m = model();
        m.estep_param = Some(shifted);
        let mut ex = Ba81Expectation::new(m, config).unwrap();
        approx::assert_relative_eq!(ex.e_step().log_likelihood, expected, max_relative = 1e-12);
        assert_eq!(ex.params()[[0, 0]], 1.0);
        approx::assert_relative_eq!(ex.e_step().log_likelihood, plain, max_relative = 1e-12);
    }

    #[test]
    fn zero_eap_resolution_is_an_error() {
        let config = Ba81Config {
            eap_point_factor: 0,
            ..Ba81Config::default()
        };
        let mut ex = Ba81Expectation::new(model(), config).unwrap();
        assert!(matches!(ex.eap(), Err(Ba81Error::EmptyQuadrature)));
    }

    #[test]
    fn supplied_estep_parameters_must_match_shape() {
        let mut m = model();
        m.estep_param = Some(Array2::zeros((2, 2)));
        assert!(matches!(
            Ba81Expectation::new(m, Ba81Config::default()),
            Err(Ba81Error::ShapeMismatch { expected: 3, found: 2, .. })
        ));
    }
}
