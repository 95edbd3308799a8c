//! Joint per-country log-density for the latent composition model.
//!
//! For one country with years t = 1..T the unknown is a T×19 matrix of
//! logit-scale latent values Y (category 0 is the softmax reference,
//! fixed at zero). Three terms make up the log-density:
//!
//! - a cross-sectional Gaussian prior Y[t] ~ N(prior.mean, prior.sd),
//!   independent per year;
//! - an asymmetric data-fit penalty −Σ_k w_k·exp(e_k/ustol) per year with
//!   a reported breakdown, where e_k = Notes_k/(ICAS_k + 1) − 1 on the
//!   year's coarse grid — explosive when the implied split undershoots
//!   notified counts, gentle on overshoot;
//! - a quadratic random-walk smoother −Σ_j (Y[t,j] − Y[t−1,j])²/tstol
//!   linking consecutive years.
//!
//! # Sampling coordinates
//!
//! The sampler works in prior-standardized coordinates z with
//! Y[t] = mean + sd ⊙ z[t], so the prior is unit-normal and the target
//! needs no mass-matrix rescaling for the prior-dominated directions.
//! Gradients are computed analytically and chained through the diagonal
//! transform. Shared per-country data lives behind `Arc` so cloning the
//! target for additional chains stays cheap.

use crate::aggregation::{grid, observed, penalty_weights};
use crate::categories::{N_CATEGORIES, N_LATENT};
use crate::pattern::MissingnessPattern;
use crate::tables::PriorSpec;
use general_mcmc::generic_hmc::HamiltonianTarget;
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Stabilizer added to the implied cell incidence before division.
pub const ICAS_EPSILON: f64 = 1.0;

fn default_ustol() -> f64 {
    0.1
}

fn default_tstol() -> f64 {
    0.25
}

/// Tuning constants of the joint density.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Undershoot-penalty steepness; smaller is harsher.
    #[serde(default = "default_ustol")]
    pub ustol: f64,
    /// Random-walk tolerance; smaller enforces smoother year-to-year
    /// composition.
    #[serde(default = "default_tstol")]
    pub tstol: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            ustol: default_ustol(),
            tstol: default_tstol(),
        }
    }
}

/// One year's assembled inputs on its own coarse grid.
#[derive(Debug, Clone)]
pub struct YearData {
    pub year: i32,
    /// National all-age/sex incidence, absolute cases.
    pub incidence: f64,
    pub pattern: MissingnessPattern,
    /// Observed counts in grid order; `None` cells carry no data term.
    pub notes: Vec<Option<f64>>,
    /// Penalty weights aligned with `notes`.
    pub weights: Array1<f64>,
    /// Fine index sets per coarse cell, aligned with `notes`.
    pub cells: Vec<Vec<usize>>,
}

impl YearData {
    /// Assemble one year from its classified record. The grid, weights
    /// and observed counts all come from the same pattern table, so the
    /// three vectors are aligned by construction.
    pub fn new(
        year: i32,
        incidence: f64,
        pattern: MissingnessPattern,
        record: Option<&crate::tables::NotificationRecord>,
    ) -> Self {
        let notes = match record {
            Some(rec) if pattern.has_data() => observed(rec, pattern),
            _ => Vec::new(),
        };
        let (weights, cells) = if notes.is_empty() {
            (Array1::zeros(0), Vec::new())
        } else {
            (
                penalty_weights(pattern),
                grid(pattern).iter().map(|c| c.fine_indices()).collect(),
            )
        };
        Self {
            year,
            incidence,
            pattern,
            notes,
            weights,
            cells,
        }
    }
}

/// Everything one country's inference run binds: years in ascending
/// order, their data, and the carried-over prior.
#[derive(Debug, Clone)]
pub struct CountryData {
    pub iso3: String,
    pub years: Vec<YearData>,
    pub prior: PriorSpec,
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("{iso3}: no years to model")]
    EmptySeries { iso3: String },
    #[error("{iso3}: non-finite or non-positive incidence in year {year}")]
    BadIncidence { iso3: String, year: i32 },
    #[error("{iso3}: prior has {got} coordinates, expected {expected}")]
    BadPrior {
        iso3: String,
        got: usize,
        expected: usize,
    },
}

/// Softmax composition with the reference category fixed at zero:
/// P = softmax(concat(0, y)) for a 19-vector y. Always sums to 1.
pub fn softmax_composition(y: ArrayView1<'_, f64>) -> Array1<f64> {
    debug_assert_eq!(y.len(), N_LATENT);
    let max = y.iter().copied().fold(0.0f64, f64::max);
    let mut p = Array1::zeros(N_CATEGORIES);
    p[0] = (-max).exp();
    for j in 0..N_LATENT {
        p[j + 1] = (y[j] - max).exp();
    }
    let total = p.sum();
    p / total
}

/// exp(x) with a linear continuation above the cap so extreme undershoot
/// keeps a finite value and a non-vanishing gradient. Returns
/// (value, derivative).
#[inline]
fn exp_bounded(x: f64) -> (f64, f64) {
    const CAP: f64 = 50.0;
    if x <= CAP {
        let v = x.exp();
        (v, v)
    } else {
        let v = CAP.exp();
        (v * (1.0 + (x - CAP)), v)
    }
}

/// Shared read-only per-country inputs for the sampling target.
#[derive(Clone)]
struct SharedData {
    years: Arc<Vec<YearData>>,
    prior_mean: Arc<Array1<f64>>,
    prior_sd: Arc<Array1<f64>>,
}

/// The per-country posterior target in prior-standardized coordinates.
#[derive(Clone)]
pub struct SplitPosterior {
    data: SharedData,
    settings: ModelSettings,
    n_years: usize,
}

impl SplitPosterior {
    pub fn new(country: &CountryData, settings: ModelSettings) -> Result<Self, ModelError> {
        if country.years.is_empty() {
            return Err(ModelError::EmptySeries {
                iso3: country.iso3.clone(),
            });
        }
        for yd in &country.years {
            if !yd.incidence.is_finite() || yd.incidence <= 0.0 {
                return Err(ModelError::BadIncidence {
                    iso3: country.iso3.clone(),
                    year: yd.year,
                });
            }
        }
        if country.prior.mean.len() != N_LATENT || country.prior.sd.len() != N_LATENT {
            return Err(ModelError::BadPrior {
                iso3: country.iso3.clone(),
                got: country.prior.mean.len().min(country.prior.sd.len()),
                expected: N_LATENT,
            });
        }
        Ok(Self {
            n_years: country.years.len(),
            data: SharedData {
                years: Arc::new(country.years.clone()),
                prior_mean: Arc::new(country.prior.mean.clone()),
                prior_sd: Arc::new(country.prior.sd.clone()),
            },
            settings,
        })
    }

    pub fn n_years(&self) -> usize {
        self.n_years
    }

    /// Flattened sampling dimension: 19 latent coordinates per year.
    pub fn dim(&self) -> usize {
        self.n_years * N_LATENT
    }

    /// Map one year's standardized coordinates to the latent scale.
    fn latent_year(&self, z: &ArrayView1<'_, f64>, t: usize) -> Array1<f64> {
        let zt = z.slice(ndarray::s![t * N_LATENT..(t + 1) * N_LATENT]);
        &*self.data.prior_mean + &(&*self.data.prior_sd * &zt)
    }

    /// Latent matrix Y [T, 19] for a flattened position.
    pub fn latent(&self, z: ArrayView1<'_, f64>) -> Array2<f64> {
        let mut y = Array2::zeros((self.n_years, N_LATENT));
        for t in 0..self.n_years {
            y.row_mut(t).assign(&self.latent_year(&z, t));
        }
        y
    }

    /// Log-density and analytical gradient in standardized coordinates.
    ///
    /// The data-term gradient chains through the softmax Jacobian:
    /// dP_i/dY_j = P_i (δ_{i,j+1} − P_{j+1}), so for cell sums
    /// A_k = inc·Σ_{i∈cell_k} P_i the derivative collapses to
    /// inc·P_{j+1}·(g_{cell(j+1)} − Σ_k g_k S_k) with g_k the per-cell
    /// density derivative and S_k the cell's probability mass.
    pub fn logp_and_grad_nd(&self, z: &Array1<f64>) -> (f64, Array1<f64>) {
        let t_count = self.n_years;
        let dim = self.dim();
        debug_assert_eq!(z.len(), dim);

        let mut logp = 0.0;
        let mut grad_z = Array1::<f64>::zeros(dim);
        let mut grad_y = Array2::<f64>::zeros((t_count, N_LATENT));

        // Prior: unit-normal in standardized coordinates.
        for (i, &zi) in z.iter().enumerate() {
            logp -= 0.5 * zi * zi;
            grad_z[i] -= zi;
        }

        let y = self.latent(z.view());

        // Data-fit penalty per year with a usable breakdown.
        for (t, yd) in self.data.years.iter().enumerate() {
            if yd.notes.is_empty() {
                continue;
            }
            let p = softmax_composition(y.row(t));
            let ustol = self.settings.ustol;
            let n_cells = yd.cells.len();

            // Per-cell density derivative wrt the cell's absolute
            // incidence, and the probability mass per cell.
            let mut cell_grad = vec![0.0f64; n_cells];
            let mut cell_mass = vec![0.0f64; n_cells];
            for k in 0..n_cells {
                let mass: f64 = yd.cells[k].iter().map(|&i| p[i]).sum();
                cell_mass[k] = mass;
                let Some(notes_k) = yd.notes[k] else {
                    continue;
                };
                let a_k = yd.incidence * mass;
                let e_k = notes_k / (a_k + ICAS_EPSILON) - 1.0;
                let (val, dval) = exp_bounded(e_k / ustol);
                logp -= yd.weights[k] * val;
                // d logp / dA_k
                cell_grad[k] = yd.weights[k] * dval * notes_k
                    / (ustol * (a_k + ICAS_EPSILON) * (a_k + ICAS_EPSILON));
            }

            let dot: f64 = (0..n_cells).map(|k| cell_grad[k] * cell_mass[k]).sum();

            // Which cell each fine category belongs to (cells partition
            // the fine grid for every data-bearing pattern).
            let mut owner = [usize::MAX; N_CATEGORIES];
            for (k, cell) in yd.cells.iter().enumerate() {
                for &i in cell {
                    owner[i] = k;
                }
            }

            for j in 0..N_LATENT {
                let fine = j + 1;
                let g_own = if owner[fine] == usize::MAX {
                    0.0
                } else {
                    cell_grad[owner[fine]]
                };
                grad_y[[t, j]] += yd.incidence * p[fine] * (g_own - dot);
            }
        }

        // Temporal random-walk smoother.
        let tstol = self.settings.tstol;
        for t in 1..t_count {
            for j in 0..N_LATENT {
                let d = y[[t, j]] - y[[t - 1, j]];
                logp -= d * d / tstol;
                grad_y[[t, j]] -= 2.0 * d / tstol;
                grad_y[[t - 1, j]] += 2.0 * d / tstol;
            }
        }

        // Chain rule through Y = mean + sd ⊙ z.
        for t in 0..t_count {
            for j in 0..N_LATENT {
                grad_z[t * N_LATENT + j] += self.data.prior_sd[j] * grad_y[[t, j]];
            }
        }

        (logp, grad_z)
    }
}

impl HamiltonianTarget<Array1<f64>> for SplitPosterior {
    fn logp_and_grad(&self, position: &Array1<f64>, grad: &mut Array1<f64>) -> f64 {
        let (logp, grad_z) = self.logp_and_grad_nd(position);
        grad.assign(&grad_z);
        logp
    }
}
