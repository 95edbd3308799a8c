//! Shape of the data-fit penalty as a function of the relative error
//! e = Notes/(ICAS + 1) - 1, probed through the public log-density with
//! the latent position held fixed and the reported count varied.

use agesplit::model::{
    CountryData, ICAS_EPSILON, ModelSettings, SplitPosterior, YearData, softmax_composition,
};
use agesplit::pattern::MissingnessPattern;
use agesplit::tables::PriorSpec;
use agesplit::{grid, penalty_weights};
use ndarray::Array1;

const INCIDENCE: f64 = 5000.0;

/// Negative log-density at z = 0 for a single-year pattern-6 country with
/// one reported cell (male 0-14) carrying `notes` cases. The prior and
/// smoother contributions are constant across calls, so differences
/// isolate the data term.
fn neg_logp_at(notes: f64, settings: ModelSettings) -> f64 {
    let cells: Vec<Vec<usize>> = grid(MissingnessPattern::P6)
        .iter()
        .map(|c| c.fine_indices())
        .collect();
    let male_child = cells
        .iter()
        .position(|c| c.contains(&10))
        .expect("male 0-14 cell");
    let mut observed = vec![None; cells.len()];
    observed[male_child] = Some(notes);
    let year = YearData {
        year: 2020,
        incidence: INCIDENCE,
        pattern: MissingnessPattern::P6,
        notes: observed,
        weights: penalty_weights(MissingnessPattern::P6),
        cells,
    };
    let country = CountryData {
        iso3: "TST".into(),
        years: vec![year],
        prior: PriorSpec::diffuse("TST"),
    };
    let target = SplitPosterior::new(&country, settings).expect("valid country");
    let z = Array1::zeros(target.dim());
    let (logp, _) = target.logp_and_grad_nd(&z);
    -logp
}

/// Implied cell incidence for the male 0-14 cell at z = 0: the latent is
/// the diffuse prior mean, so the split is uniform and the three-bin cell
/// holds 3/20 of the national total.
fn cell_icas() -> f64 {
    let p = softmax_composition(Array1::zeros(19).view());
    let mass: f64 = [10usize, 11, 12].iter().map(|&i| p[i]).sum();
    INCIDENCE * mass
}

fn notes_for(e: f64) -> f64 {
    (e + 1.0) * (cell_icas() + ICAS_EPSILON)
}

#[test]
fn penalty_is_strictly_increasing_and_convex_in_the_relative_error() {
    let settings = ModelSettings::default();
    let step = 0.05;
    let errors: Vec<f64> = (-10..=10).map(|i| i as f64 * step).collect();
    let costs: Vec<f64> = errors
        .iter()
        .map(|&e| neg_logp_at(notes_for(e), settings))
        .collect();

    for w in costs.windows(2) {
        assert!(w[1] > w[0], "penalty must increase with e: {} -> {}", w[0], w[1]);
    }
    for w in costs.windows(3) {
        let second_diff = w[2] - 2.0 * w[1] + w[0];
        assert!(second_diff > 0.0, "penalty must be convex: {second_diff}");
    }
}

#[test]
fn undershoot_grows_much_faster_than_overshoot_shrinks() {
    let settings = ModelSettings::default();
    let at = |e: f64| neg_logp_at(notes_for(e), settings);
    let base = at(0.0);
    let undershoot = at(0.3) - base;
    let overshoot = base - at(-0.3);
    assert!(
        undershoot > 5.0 * overshoot,
        "undershoot {undershoot} vs overshoot relief {overshoot}"
    );
}

#[test]
fn penalty_differences_match_the_weighted_exponential() {
    let settings = ModelSettings::default();
    let weight = 3.0; // three fine bins merged into the 0-14 cell
    let pen = |e: f64| weight * (e / settings.ustol).exp();
    for (e1, e2) in [(-0.2, 0.0), (0.0, 0.1), (0.1, 0.3)] {
        let measured = neg_logp_at(notes_for(e2), settings) - neg_logp_at(notes_for(e1), settings);
        let expected = pen(e2) - pen(e1);
        approx::assert_relative_eq!(measured, expected, max_relative = 1e-6, epsilon = 1e-9);
    }
}
