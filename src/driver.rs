//! Country selection and the parallel inference run.
//!
//! A country is individually modeled only when its notifications are
//! plentiful enough to identify a composition (recent total above a fixed
//! floor), its incidence estimate is not itself notification-derived
//! (adjustment or inventory methods), and it is not explicitly excluded.
//! Everything else is handed to the reconciliation layer's fallback path.
//!
//! Per-country runs are embarrassingly parallel: each binds one country's
//! multi-year arrays and shares no mutable state, so they execute on a
//! rayon pool with results collected only after every task completes.
//! Silent gaps are converted into typed warnings instead of being
//! swallowed.

use crate::model::{CountryData, ModelError, ModelSettings, SplitPosterior, YearData};
use crate::pattern::classify;
use crate::sampler::{CountryPosterior, SamplerConfig, run_country_sampler};
use crate::tables::{
    CountryMeta, EstimationMethod, IncidenceEstimate, NotificationRecord, PriorSpec,
};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Non-fatal findings surfaced by the run instead of silent
/// incompleteness.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RunWarning {
    #[error("{iso3}: sampler did not converge (rhat={rhat:.3}, ess={ess:.0})")]
    NotConverged { iso3: String, rhat: f64, ess: f64 },
    #[error("{iso3}: only {n_years} year(s) observed; prior may dominate")]
    ShortSeries { iso3: String, n_years: usize },
    #[error("{iso3}: notifications present but no incidence estimate")]
    MissingIncidence { iso3: String },
    #[error("{iso3}: no country metadata; excluded from regional fallback")]
    MissingMeta { iso3: String },
    #[error("{iso3}: no carried-over prior; using diffuse prior")]
    MissingPrior { iso3: String },
    #[error("{iso3}: skipped ({reason})")]
    Skipped { iso3: String, reason: String },
    #[error("{iso3}: no regional pattern for region {region}; year left unfilled")]
    NoRegionalPattern { iso3: String, region: String },
    #[error("{iso3}: pandemic pediatric share replaced for year {year}")]
    PandemicAdjusted { iso3: String, year: i32 },
}

fn default_notification_floor() -> f64 {
    1000.0
}

/// Who gets an individual model run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EligibilityPolicy {
    /// Minimum total notified cases in the most recent reported year.
    #[serde(default = "default_notification_floor")]
    pub notification_floor: f64,
    /// Countries excluded regardless of the other criteria.
    #[serde(default)]
    pub excluded: Vec<String>,
}

impl Default for EligibilityPolicy {
    fn default() -> Self {
        Self {
            notification_floor: default_notification_floor(),
            excluded: Vec::new(),
        }
    }
}

/// Immutable input snapshot for one run.
#[derive(Debug, Clone, Default)]
pub struct InputTables {
    pub incidence: Vec<IncidenceEstimate>,
    pub notifications: Vec<NotificationRecord>,
    pub priors: Vec<PriorSpec>,
    pub meta: Vec<CountryMeta>,
}

impl InputTables {
    pub fn incidence_for(&self, iso3: &str) -> Vec<&IncidenceEstimate> {
        let mut rows: Vec<&IncidenceEstimate> =
            self.incidence.iter().filter(|r| r.iso3 == iso3).collect();
        rows.sort_by_key(|r| r.year);
        rows
    }

    pub fn notification_for(&self, iso3: &str, year: i32) -> Option<&NotificationRecord> {
        self.notifications
            .iter()
            .find(|r| r.iso3 == iso3 && r.year == year)
    }

    pub fn prior_for(&self, iso3: &str) -> Option<&PriorSpec> {
        self.priors.iter().find(|p| p.iso3 == iso3)
    }

    /// Distinct countries with an incidence series, in stable order.
    pub fn countries(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self.incidence.iter().map(|r| r.iso3.as_str()).collect();
        set.into_iter().map(str::to_string).collect()
    }
}

/// Latest-year total notified cases for a country, 0 when nothing was
/// reported.
fn recent_notified(tables: &InputTables, iso3: &str) -> f64 {
    tables
        .notifications
        .iter()
        .filter(|r| r.iso3 == iso3)
        .max_by_key(|r| r.year)
        .map(NotificationRecord::total)
        .unwrap_or(0.0)
}

fn latest_method(tables: &InputTables, iso3: &str) -> Option<EstimationMethod> {
    tables
        .incidence
        .iter()
        .filter(|r| r.iso3 == iso3)
        .max_by_key(|r| r.year)
        .map(|r| r.method)
}

/// Apply the eligibility policy to every country with an incidence series.
pub fn select_modeled(tables: &InputTables, policy: &EligibilityPolicy) -> Vec<String> {
    tables
        .countries()
        .into_iter()
        .filter(|iso3| {
            if policy.excluded.iter().any(|e| e == iso3) {
                return false;
            }
            match latest_method(tables, iso3) {
                Some(EstimationMethod::Standard) => {}
                Some(EstimationMethod::Adjustment) | Some(EstimationMethod::Inventory) | None => {
                    return false;
                }
            }
            recent_notified(tables, iso3) > policy.notification_floor
        })
        .collect()
}

/// Check for countries present in one table but absent from another.
pub fn schema_mismatch_warnings(tables: &InputTables) -> Vec<RunWarning> {
    let with_incidence: BTreeSet<&str> =
        tables.incidence.iter().map(|r| r.iso3.as_str()).collect();
    let with_meta: BTreeSet<&str> = tables.meta.iter().map(|r| r.iso3.as_str()).collect();
    let with_notes: BTreeSet<&str> = tables
        .notifications
        .iter()
        .map(|r| r.iso3.as_str())
        .collect();

    let mut warnings = Vec::new();
    for iso3 in with_notes.difference(&with_incidence) {
        warnings.push(RunWarning::MissingIncidence {
            iso3: (*iso3).to_string(),
        });
    }
    for iso3 in with_incidence.difference(&with_meta) {
        warnings.push(RunWarning::MissingMeta {
            iso3: (*iso3).to_string(),
        });
    }
    warnings
}

/// Build one country's multi-year model inputs.
pub fn assemble_country(
    tables: &InputTables,
    iso3: &str,
) -> Result<(CountryData, Vec<RunWarning>), ModelError> {
    let mut warnings = Vec::new();
    let estimates = tables.incidence_for(iso3);
    if estimates.is_empty() {
        return Err(ModelError::EmptySeries {
            iso3: iso3.to_string(),
        });
    }

    let years: Vec<YearData> = estimates
        .iter()
        .map(|est| {
            let record = tables.notification_for(iso3, est.year);
            let pattern = record.map(classify).unwrap_or(crate::pattern::MissingnessPattern::P1);
            YearData::new(est.year, est.point, pattern, record)
        })
        .collect();

    let prior = match tables.prior_for(iso3) {
        Some(spec) => spec.clone(),
        None => {
            warnings.push(RunWarning::MissingPrior {
                iso3: iso3.to_string(),
            });
            PriorSpec::diffuse(iso3)
        }
    };

    let observed_years = years.iter().filter(|y| y.pattern.has_data()).count();
    if observed_years < 3 {
        warnings.push(RunWarning::ShortSeries {
            iso3: iso3.to_string(),
            n_years: observed_years,
        });
    }

    Ok((
        CountryData {
            iso3: iso3.to_string(),
            years,
            prior,
        },
        warnings,
    ))
}

/// Run every eligible country on the worker pool and collect posteriors
/// plus all warnings. No cross-country state: a stalled chain delays only
/// its own task.
pub fn run_modeled(
    tables: &InputTables,
    model: ModelSettings,
    sampler: &SamplerConfig,
    policy: &EligibilityPolicy,
) -> (Vec<CountryPosterior>, Vec<RunWarning>) {
    let selected = select_modeled(tables, policy);
    log::info!(
        "modeling {} of {} countries individually",
        selected.len(),
        tables.countries().len()
    );

    let results: Vec<(Option<CountryPosterior>, Vec<RunWarning>)> = selected
        .into_par_iter()
        .map(|iso3| run_one(tables, &iso3, model, sampler))
        .collect();

    let mut posteriors = Vec::new();
    let mut warnings = schema_mismatch_warnings(tables);
    for (posterior, mut country_warnings) in results {
        if let Some(p) = posterior {
            posteriors.push(p);
        }
        warnings.append(&mut country_warnings);
    }
    for warning in &warnings {
        log::warn!("{warning}");
    }
    (posteriors, warnings)
}

/// Full run configuration, JSON round-trippable so a run's store records
/// exactly what produced it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub eligibility: EligibilityPolicy,
    #[serde(default)]
    pub reconcile: crate::reconcile::ReconcileConfig,
}

/// Everything one run produces.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Country rows plus region/global roll-ups.
    pub rows: Vec<crate::tables::PosteriorSplitRow>,
    pub posteriors: Vec<CountryPosterior>,
    pub warnings: Vec<RunWarning>,
}

/// Model the eligible countries, reconcile everything, and return the
/// final table with all warnings.
pub fn run_pipeline(tables: &InputTables, config: &RunConfig) -> RunOutput {
    let (posteriors, mut warnings) =
        run_modeled(tables, config.model, &config.sampler, &config.eligibility);
    let (rows, mut recon_warnings) =
        crate::reconcile::reconcile(tables, &posteriors, &config.reconcile);
    warnings.append(&mut recon_warnings);
    RunOutput {
        rows,
        posteriors,
        warnings,
    }
}

fn run_one(
    tables: &InputTables,
    iso3: &str,
    model: ModelSettings,
    sampler: &SamplerConfig,
) -> (Option<CountryPosterior>, Vec<RunWarning>) {
    let (country, mut warnings) = match assemble_country(tables, iso3) {
        Ok(ok) => ok,
        Err(err) => {
            return (
                None,
                vec![RunWarning::Skipped {
                    iso3: iso3.to_string(),
                    reason: err.to_string(),
                }],
            );
        }
    };
    let years: Vec<i32> = country.years.iter().map(|y| y.year).collect();
    let target = match SplitPosterior::new(&country, model) {
        Ok(t) => t,
        Err(err) => {
            warnings.push(RunWarning::Skipped {
                iso3: iso3.to_string(),
                reason: err.to_string(),
            });
            return (None, warnings);
        }
    };
    let posterior = run_country_sampler(iso3, years, target, sampler);
    if !posterior.converged {
        warnings.push(RunWarning::NotConverged {
            iso3: iso3.to_string(),
            rhat: posterior.rhat,
            ess: posterior.ess,
        });
    }
    (Some(posterior), warnings)
}
