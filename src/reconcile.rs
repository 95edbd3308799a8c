//! Fallback and reconciliation: merge modeled posteriors with
//! non-modeled countries into the complete output table.
//!
//! Non-modeled country-years with a usable breakdown are normalized
//! directly ("data"); missing years are filled by next-observed then
//! previous-observed carry within the country; remaining gaps take the
//! regional average pattern ("model"). Explicit override rules correct
//! known data-entry anomalies before any of this runs. The final closure
//! step rescales every country-year so category incidence sums exactly to
//! the authoritative national total — the model alone does not guarantee
//! this, the rescale does — and standard errors combine national and
//! compositional fractional uncertainty in quadrature.

use crate::aggregation::grid;
use crate::categories::{AgeBand, N_CATEGORIES, Sex, all_categories};
use crate::driver::{InputTables, RunWarning};
use crate::pattern::classify;
use crate::sampler::CountryPosterior;
use crate::tables::{BandGroup, CountryType, IncidenceEstimate, NotificationRecord, PosteriorSplitRow};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Swap two age-band columns (both sexes) for one country in specific
/// years. Corrects records where adjacent bands were entered transposed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapBandsRule {
    pub iso3: String,
    pub years: Vec<i32>,
    pub band_a: AgeBand,
    pub band_b: AgeBand,
}

fn default_drop_threshold() -> f64 {
    0.10
}

/// Replace the pediatric share in pandemic years with the mean of the
/// adjacent non-pandemic years, for countries whose measured
/// pandemic-period drop exceeds the threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PandemicCorrection {
    pub years: Vec<i32>,
    #[serde(default = "default_drop_threshold")]
    pub drop_threshold: f64,
}

/// Override rules are configuration, not code: the numeric policy behind
/// each correction lives in the run config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default)]
    pub swaps: Vec<SwapBandsRule>,
    #[serde(default)]
    pub pandemic: Option<PandemicCorrection>,
}

/// Regional average age/sex pattern, incidence-weighted over modeled
/// countries.
struct RegionalPattern {
    by_year: HashMap<i32, Array1<f64>>,
    overall: Option<Array1<f64>>,
}

impl RegionalPattern {
    fn for_year(&self, year: i32) -> Option<&Array1<f64>> {
        self.by_year.get(&year).or(self.overall.as_ref())
    }
}

fn build_regional_patterns(
    tables: &InputTables,
    posteriors: &[CountryPosterior],
) -> HashMap<String, RegionalPattern> {
    let region_of: HashMap<&str, &str> = tables
        .meta
        .iter()
        .map(|m| (m.iso3.as_str(), m.region.as_str()))
        .collect();

    // Accumulate incidence-weighted splits per region-year.
    let mut acc: HashMap<(String, i32), (Array1<f64>, f64)> = HashMap::new();
    let mut acc_all: HashMap<String, (Array1<f64>, f64)> = HashMap::new();
    for posterior in posteriors {
        let Some(region) = region_of.get(posterior.iso3.as_str()) else {
            continue;
        };
        for (t, &year) in posterior.years.iter().enumerate() {
            let weight = tables
                .incidence_for(&posterior.iso3)
                .iter()
                .find(|e| e.year == year)
                .map(|e| e.point)
                .unwrap_or(0.0);
            if weight <= 0.0 {
                continue;
            }
            let p = posterior.p_mean.row(t).to_owned() * weight;
            let entry = acc
                .entry((region.to_string(), year))
                .or_insert_with(|| (Array1::zeros(N_CATEGORIES), 0.0));
            entry.0 += &p;
            entry.1 += weight;
            let entry_all = acc_all
                .entry(region.to_string())
                .or_insert_with(|| (Array1::zeros(N_CATEGORIES), 0.0));
            entry_all.0 += &p;
            entry_all.1 += weight;
        }
    }

    let mut patterns: HashMap<String, RegionalPattern> = HashMap::new();
    for (region, (sum, weight)) in acc_all {
        let overall = if weight > 0.0 { Some(sum / weight) } else { None };
        patterns.insert(
            region,
            RegionalPattern {
                by_year: HashMap::new(),
                overall,
            },
        );
    }
    for ((region, year), (sum, weight)) in acc {
        if weight <= 0.0 {
            continue;
        }
        if let Some(pattern) = patterns.get_mut(&region) {
            pattern.by_year.insert(year, sum / weight);
        }
    }
    patterns
}

/// Apply swap overrides to a copy of the notification table.
pub fn apply_swaps(
    notifications: &[NotificationRecord],
    rules: &[SwapBandsRule],
) -> Vec<NotificationRecord> {
    let mut out = notifications.to_vec();
    for rule in rules {
        for rec in out
            .iter_mut()
            .filter(|r| r.iso3 == rule.iso3 && rule.years.contains(&r.year))
        {
            for sex in Sex::ALL {
                let a = rec.value(sex, BandGroup::Single(rule.band_a));
                let b = rec.value(sex, BandGroup::Single(rule.band_b));
                rec.set_value(sex, BandGroup::Single(rule.band_a), b);
                rec.set_value(sex, BandGroup::Single(rule.band_b), a);
            }
        }
    }
    out
}

/// Expand one coarse observation to a normalized fine split, allocating
/// each coarse cell across its fine bins proportionally to the regional
/// pattern (uniform within the cell when no pattern exists). Unreported
/// cells are imputed from the regional mass ratio against the reported
/// cells. Returns `None` when nothing can be expanded.
fn expand_observation(
    record: &NotificationRecord,
    regional: Option<&Array1<f64>>,
) -> Option<Array1<f64>> {
    let pattern = classify(record);
    if !pattern.has_data() {
        return None;
    }
    let cells = grid(pattern);
    let observed = crate::aggregation::observed(record, pattern);

    let observed_total: f64 = observed.iter().flatten().sum();
    if observed_total <= 0.0 {
        return None;
    }
    // Regional mass covered by the reported cells, for imputing the rest.
    let (mut reported_mass, mut missing_any) = (0.0f64, false);
    if let Some(reg) = regional {
        for (cell, obs) in cells.iter().zip(&observed) {
            let mass: f64 = cell.fine_indices().iter().map(|&i| reg[i]).sum();
            if obs.is_some() {
                reported_mass += mass;
            } else {
                missing_any = true;
            }
        }
    } else if observed.iter().any(Option::is_none) {
        // No basis for imputing the unreported cells.
        missing_any = true;
        reported_mass = 0.0;
    }

    let mut fine = Array1::<f64>::zeros(N_CATEGORIES);
    for (cell, obs) in cells.iter().zip(&observed) {
        let indices = cell.fine_indices();
        let cell_value = match obs {
            Some(v) => *v,
            None => {
                let reg = regional?;
                if !missing_any || reported_mass <= 0.0 {
                    return None;
                }
                let mass: f64 = indices.iter().map(|&i| reg[i]).sum();
                observed_total * mass / reported_mass
            }
        };
        // Distribute within the cell by the regional shape when known.
        let weights: Vec<f64> = match regional {
            Some(reg) => {
                let cell_mass: f64 = indices.iter().map(|&i| reg[i]).sum();
                if cell_mass > 0.0 {
                    indices.iter().map(|&i| reg[i] / cell_mass).collect()
                } else {
                    vec![1.0 / indices.len() as f64; indices.len()]
                }
            }
            None => vec![1.0 / indices.len() as f64; indices.len()],
        };
        for (&i, w) in indices.iter().zip(&weights) {
            fine[i] = cell_value * w;
        }
    }
    let total = fine.sum();
    if total > 0.0 { Some(fine / total) } else { None }
}

/// One country's assembled split series before closure.
struct SplitSeries {
    iso3: String,
    years: Vec<i32>,
    p: Vec<Option<Array1<f64>>>,
    p_sd: Vec<Option<Array1<f64>>>,
    countrytype: Vec<Option<CountryType>>,
}

/// Fill missing years by next-observed carry, then previous-observed
/// carry. Provenance travels with the copied value.
fn carry_fill(series: &mut SplitSeries) {
    let n = series.years.len();
    // NOCB: walk backwards propagating the next observed value.
    let mut next: Option<usize> = None;
    for t in (0..n).rev() {
        if series.p[t].is_some() {
            next = Some(t);
        } else if let Some(src) = next {
            series.p[t] = series.p[src].clone();
            series.p_sd[t] = series.p_sd[src].clone();
            series.countrytype[t] = series.countrytype[src];
        }
    }
    // LOCF for anything still open at the end of the series.
    let mut prev: Option<usize> = None;
    for t in 0..n {
        if series.p[t].is_some() {
            prev = Some(t);
        } else if let Some(src) = prev {
            series.p[t] = series.p[src].clone();
            series.p_sd[t] = series.p_sd[src].clone();
            series.countrytype[t] = series.countrytype[src];
        }
    }
}

fn child_share(p: &Array1<f64>) -> f64 {
    all_categories()
        .iter()
        .filter(|c| c.band.is_child())
        .map(|c| p[c.index()])
        .sum()
}

/// Rescale pandemic-year pediatric shares back to the adjacent-year
/// baseline when the measured drop exceeds the threshold.
fn apply_pandemic_correction(
    series: &mut SplitSeries,
    correction: &PandemicCorrection,
    warnings: &mut Vec<RunWarning>,
) {
    let pandemic_min = correction.years.iter().copied().min();
    let pandemic_max = correction.years.iter().copied().max();
    let (Some(lo), Some(hi)) = (pandemic_min, pandemic_max) else {
        return;
    };

    let share_at = |series: &SplitSeries, year: i32| -> Option<f64> {
        let idx = series.years.iter().position(|&y| y == year)?;
        series.p[idx].as_ref().map(child_share)
    };

    let baseline_years = [lo - 1, hi + 1];
    let baseline: Vec<f64> = baseline_years
        .iter()
        .filter_map(|&y| share_at(series, y))
        .collect();
    if baseline.is_empty() {
        return;
    }
    let baseline = baseline.iter().sum::<f64>() / baseline.len() as f64;
    if baseline <= 0.0 {
        return;
    }

    let pandemic_shares: Vec<f64> = correction
        .years
        .iter()
        .filter_map(|&y| share_at(series, y))
        .collect();
    if pandemic_shares.is_empty() {
        return;
    }
    let pandemic_mean = pandemic_shares.iter().sum::<f64>() / pandemic_shares.len() as f64;
    let drop = (baseline - pandemic_mean) / baseline;
    if drop <= correction.drop_threshold {
        return;
    }

    for &year in &correction.years {
        let Some(idx) = series.years.iter().position(|&y| y == year) else {
            continue;
        };
        let Some(p) = series.p[idx].as_mut() else {
            continue;
        };
        let current = child_share(p);
        if current <= 0.0 || current >= 1.0 || baseline >= 1.0 {
            continue;
        }
        let child_scale = baseline / current;
        let adult_scale = (1.0 - baseline) / (1.0 - current);
        for cat in all_categories() {
            let i = cat.index();
            p[i] *= if cat.band.is_child() { child_scale } else { adult_scale };
        }
        warnings.push(RunWarning::PandemicAdjusted {
            iso3: series.iso3.clone(),
            year,
        });
    }
}

/// Closure correction: rescale category incidence so each area-year sums
/// exactly to its national total, renormalizing p alongside. Running it
/// on its own output changes nothing.
pub fn close_splits(rows: &mut [PosteriorSplitRow], incidence: &[IncidenceEstimate]) {
    let totals: HashMap<(&str, i32), f64> = incidence
        .iter()
        .map(|e| ((e.iso3.as_str(), e.year), e.point))
        .collect();

    let mut groups: BTreeMap<(String, i32), Vec<usize>> = BTreeMap::new();
    for (idx, row) in rows.iter().enumerate() {
        groups
            .entry((row.area.clone(), row.year))
            .or_default()
            .push(idx);
    }
    for ((area, year), indices) in groups {
        let Some(&target) = totals.get(&(area.as_str(), year)) else {
            continue;
        };
        let current: f64 = indices.iter().map(|&i| rows[i].incidence).sum();
        if current <= 0.0 {
            continue;
        }
        let scale = target / current;
        for &i in &indices {
            rows[i].incidence *= scale;
            rows[i].se *= scale;
            rows[i].p = rows[i].incidence / target;
        }
    }
}

/// Merge modeled posteriors with the fallback path and emit the final
/// country-level table plus region/global roll-ups.
pub fn reconcile(
    tables: &InputTables,
    posteriors: &[CountryPosterior],
    config: &ReconcileConfig,
) -> (Vec<PosteriorSplitRow>, Vec<RunWarning>) {
    let mut warnings = Vec::new();
    let notifications = apply_swaps(&tables.notifications, &config.swaps);
    let regional = build_regional_patterns(tables, posteriors);
    let region_of: HashMap<&str, &str> = tables
        .meta
        .iter()
        .map(|m| (m.iso3.as_str(), m.region.as_str()))
        .collect();
    let modeled: HashMap<&str, &CountryPosterior> =
        posteriors.iter().map(|p| (p.iso3.as_str(), p)).collect();

    let mut all_series: Vec<SplitSeries> = Vec::new();
    for iso3 in tables.countries() {
        let estimates = tables.incidence_for(&iso3);
        let years: Vec<i32> = estimates.iter().map(|e| e.year).collect();
        let mut series = SplitSeries {
            iso3: iso3.clone(),
            years: years.clone(),
            p: vec![None; years.len()],
            p_sd: vec![None; years.len()],
            countrytype: vec![None; years.len()],
        };

        if let Some(posterior) = modeled.get(iso3.as_str()) {
            for (t, &year) in posterior.years.iter().enumerate() {
                if let Some(idx) = years.iter().position(|&y| y == year) {
                    series.p[idx] = Some(posterior.p_mean.row(t).to_owned());
                    series.p_sd[idx] = Some(posterior.p_sd.row(t).to_owned());
                    series.countrytype[idx] = Some(CountryType::Est);
                }
            }
        } else {
            let region_pattern = region_of
                .get(iso3.as_str())
                .and_then(|r| regional.get(*r));
            for (idx, &year) in years.iter().enumerate() {
                let record = notifications
                    .iter()
                    .find(|r| r.iso3 == iso3 && r.year == year);
                let Some(record) = record else { continue };
                let reg_split = region_pattern.and_then(|rp| rp.for_year(year));
                if let Some(p) = expand_observation(record, reg_split) {
                    series.p[idx] = Some(p);
                    series.countrytype[idx] = Some(CountryType::Data);
                }
            }
            carry_fill(&mut series);
            // Regional fallback for countries with no usable year at all
            // or gaps the carries could not reach.
            for (idx, &year) in years.iter().enumerate() {
                if series.p[idx].is_some() {
                    continue;
                }
                match region_pattern.and_then(|rp| rp.for_year(year)) {
                    Some(reg) => {
                        series.p[idx] = Some(reg.clone());
                        series.countrytype[idx] = Some(CountryType::Model);
                    }
                    None => {
                        warnings.push(RunWarning::NoRegionalPattern {
                            iso3: iso3.clone(),
                            region: region_of
                                .get(iso3.as_str())
                                .unwrap_or(&"unknown")
                                .to_string(),
                        });
                    }
                }
            }
        }

        if let Some(correction) = &config.pandemic {
            apply_pandemic_correction(&mut series, correction, &mut warnings);
        }
        all_series.push(series);
    }

    // Emit country rows with RSS standard errors.
    let cats = all_categories();
    let mut rows: Vec<PosteriorSplitRow> = Vec::new();
    for series in &all_series {
        let estimates = tables.incidence_for(&series.iso3);
        for (idx, &year) in series.years.iter().enumerate() {
            let (Some(p), Some(countrytype)) = (&series.p[idx], series.countrytype[idx]) else {
                continue;
            };
            let Some(est) = estimates.iter().find(|e| e.year == year) else {
                continue;
            };
            let national_frac = if est.point > 0.0 { est.sd() / est.point } else { 0.0 };
            for cat in cats {
                let k = cat.index();
                let incidence = est.point * p[k];
                let comp_frac = match &series.p_sd[idx] {
                    Some(sd) if p[k] > 0.0 => sd[k] / p[k],
                    _ => 0.0,
                };
                let se = incidence * (national_frac * national_frac + comp_frac * comp_frac).sqrt();
                rows.push(PosteriorSplitRow {
                    area: series.iso3.clone(),
                    year,
                    category: cat.label(),
                    p: p[k],
                    incidence,
                    se,
                    countrytype,
                });
            }
        }
    }

    close_splits(&mut rows, &tables.incidence);

    let mut rollup_rows = rollups(&rows, tables);
    rows.append(&mut rollup_rows);
    (rows, warnings)
}

/// Region and global roll-ups with the same row shape as country output.
pub fn rollups(rows: &[PosteriorSplitRow], tables: &InputTables) -> Vec<PosteriorSplitRow> {
    let region_of: HashMap<&str, &str> = tables
        .meta
        .iter()
        .map(|m| (m.iso3.as_str(), m.region.as_str()))
        .collect();

    // (area, year, category) -> (incidence sum, se squared sum)
    let mut acc: BTreeMap<(String, i32, String), (f64, f64)> = BTreeMap::new();
    for row in rows {
        let Some(region) = region_of.get(row.area.as_str()) else {
            continue;
        };
        for area in [region.to_string(), "global".to_string()] {
            let entry = acc
                .entry((area, row.year, row.category.clone()))
                .or_insert((0.0, 0.0));
            entry.0 += row.incidence;
            entry.1 += row.se * row.se;
        }
    }

    // Area-year totals for the share column.
    let mut totals: HashMap<(String, i32), f64> = HashMap::new();
    for ((area, year, _), (incidence, _)) in &acc {
        *totals.entry((area.clone(), *year)).or_insert(0.0) += incidence;
    }

    acc.into_iter()
        .map(|((area, year, category), (incidence, se_sq))| {
            let total = totals.get(&(area.clone(), year)).copied().unwrap_or(0.0);
            PosteriorSplitRow {
                p: if total > 0.0 { incidence / total } else { 0.0 },
                area,
                year,
                category,
                incidence,
                se: se_sq.sqrt(),
                countrytype: CountryType::Agg,
            }
        })
        .collect()
}
