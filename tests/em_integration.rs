mod common;

use ba81_rs::{FitRequest, QuadratureRule};
use common::{correlation, expectation, model_2pl, run_em, simulate_2pl};

const SLOPES: [f64; 10] = [1.5, 1.6, 1.7, 1.8, 1.9, 2.0, 2.1, 2.2, 2.3, 2.5];
const INTERCEPTS: [f64; 10] = [-1.5, -1.0, -0.7, -0.3, 0.0, 0.2, 0.5, 0.8, 1.1, 1.4];

fn rule() -> QuadratureRule {
    QuadratureRule::normal(21, 4.0).unwrap()
}

fn true_values() -> Vec<f64> {
    SLOPES
        .iter()
        .zip(&INTERCEPTS)
        .flat_map(|(&a, &b)| [a, b])
        .collect()
}

#[test]
fn em_recovers_2pl_parameters_and_scores() {
    let sim = simulate_2pl(500, &SLOPES, &INTERCEPTS, 11);
    let mut ex = expectation(model_2pl(sim.data, rule()), false);
    ex.set_free_values(&true_values()).unwrap();

    let trace = run_em(&mut ex, 1e-4, 1000);
    assert!(
        trace.gradient < 1e-4,
        "EM stopped after {} iterations with max |gradient| {}",
        trace.iterations,
        trace.gradient
    );
    for pair in trace.deviance.windows(2) {
        assert!(pair[1] <= pair[0] + 1e-8 * pair[0].abs(), "deviance rose {:?}", pair);
    }

    let params = ex.params();
    for item in 0..SLOPES.len() {
        assert!(
            (params[[item, 0]] - SLOPES[item]).abs() < 1.0,
            "slope {} estimated as {}",
            item,
            params[[item, 0]]
        );
        assert!(
            (params[[item, 1]] - INTERCEPTS[item]).abs() < 0.6,
            "intercept {} estimated as {}",
            item,
            params[[item, 1]]
        );
        assert_eq!(params[[item, 2]], 0.0);
    }

    let scores = ex.eap().unwrap();
    assert_eq!(scores.mean.dim(), (500, 1));
    assert!(scores.sd.iter().all(|&s| s > 0.0 && s < 2.5));
    let eap: Vec<f64> = scores.mean.column(0).to_vec();
    let r = correlation(&eap, &sim.theta);
    assert!(r > 0.9, "EAP correlation with true ability {}", r);
}

#[test]
fn converged_latent_moments_are_standard() {
    let sim = simulate_2pl(500, &SLOPES, &INTERCEPTS, 5);
    let mut ex = expectation(model_2pl(sim.data, rule()), false);
    run_em(&mut ex, 1e-4, 1000);
    ex.e_step();

    let latent = ex.latent().unwrap();
    assert!(latent.mean[0].abs() < 0.1, "mean {}", latent.mean[0]);
    assert!((latent.cov[[0, 0]] - 1.0).abs() < 0.1, "variance {}", latent.cov[[0, 0]]);
}

#[test]
fn rescaled_em_reaches_the_same_deviance() {
    let sim = simulate_2pl(500, &SLOPES, &INTERCEPTS, 23);

    let mut plain = expectation(model_2pl(sim.data.clone(), rule()), false);
    let plain_trace = run_em(&mut plain, 1e-4, 1000);

    let mut rescaled = expectation(model_2pl(sim.data, rule()), true);
    let trace = run_em(&mut rescaled, 0.0, 150);
    let outcome = rescaled.e_step();

    for pair in trace.deviance.windows(2) {
        assert!(pair[1] <= pair[0] + 1e-8 * pair[0].abs(), "deviance rose {:?}", pair);
    }
    let first = trace.deviance[0];
    let last = outcome.deviance();
    assert!(last <= trace.deviance.last().unwrap() + 1e-8 * last.abs());
    assert!(last < first);
    assert!(
        (last - plain_trace.deviance.last().unwrap()).abs() < 1.0,
        "rescaled {} vs plain {:?}",
        last,
        plain_trace.deviance.last()
    );
    assert!(outcome.rescaled.is_some());
}

#[test]
fn fit_counters_track_requests() {
    let sim = simulate_2pl(50, &SLOPES, &INTERCEPTS, 3);
    let mut ex = expectation(model_2pl(sim.data, rule()), false);
    ex.e_step();
    ex.fit(FitRequest::fit()).unwrap();
    ex.fit(FitRequest::gradient()).unwrap();
    ex.fit(FitRequest::all()).unwrap();
    assert_eq!(ex.fit_count(), 3);
    assert_eq!(ex.gradient_count(), 2);
}
