//! Row types for the engine's tabular inputs and outputs.
//!
//! These are immutable snapshots produced once per reporting cycle by the
//! surrounding pipeline; the engine never mutates an input table. Column
//! names mirror the upstream notification table (suffix `f04`, `m2534`,
//! ...; aggregate columns `f014`, `m1524`, ... for countries that report
//! at coarser granularity).

use crate::categories::{AgeBand, AgeSexCategory, N_LATENT, Sex};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// How the national incidence estimate was produced. Countries whose
/// estimate is itself derived from notifications (adjustment) or from an
/// inventory study are not individually modeled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimationMethod {
    Standard,
    Adjustment,
    Inventory,
}

/// National, all-age/sex incidence estimate for one country-year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidenceEstimate {
    pub iso3: String,
    pub year: i32,
    /// Point estimate, absolute cases.
    pub point: f64,
    pub lo: f64,
    pub hi: f64,
    pub method: EstimationMethod,
}

impl IncidenceEstimate {
    /// Standard deviation implied by the 95% interval under normality.
    pub fn sd(&self) -> f64 {
        ((self.hi - self.lo) / 3.92).max(0.0)
    }
}

/// One coarse age grouping a country may report a sex's count under.
///
/// `Single` covers the 10 fine bands; the rest are the aggregate columns
/// the upstream table carries for countries reporting merged bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BandGroup {
    Single(AgeBand),
    C0_14,
    C5_14,
    C15_24,
    C15_64,
    C15plus,
}

impl BandGroup {
    /// Fine bands summed into this group.
    pub fn fine_bands(self) -> &'static [AgeBand] {
        match self {
            BandGroup::Single(band) => match band {
                AgeBand::A0_4 => &[AgeBand::A0_4],
                AgeBand::A5_9 => &[AgeBand::A5_9],
                AgeBand::A10_14 => &[AgeBand::A10_14],
                AgeBand::A15_19 => &[AgeBand::A15_19],
                AgeBand::A20_24 => &[AgeBand::A20_24],
                AgeBand::A25_34 => &[AgeBand::A25_34],
                AgeBand::A35_44 => &[AgeBand::A35_44],
                AgeBand::A45_54 => &[AgeBand::A45_54],
                AgeBand::A55_64 => &[AgeBand::A55_64],
                AgeBand::A65plus => &[AgeBand::A65plus],
            },
            BandGroup::C0_14 => &[AgeBand::A0_4, AgeBand::A5_9, AgeBand::A10_14],
            BandGroup::C5_14 => &[AgeBand::A5_9, AgeBand::A10_14],
            BandGroup::C15_24 => &[AgeBand::A15_19, AgeBand::A20_24],
            BandGroup::C15_64 => &[
                AgeBand::A15_19,
                AgeBand::A20_24,
                AgeBand::A25_34,
                AgeBand::A35_44,
                AgeBand::A45_54,
                AgeBand::A55_64,
            ],
            BandGroup::C15plus => &[
                AgeBand::A15_19,
                AgeBand::A20_24,
                AgeBand::A25_34,
                AgeBand::A35_44,
                AgeBand::A45_54,
                AgeBand::A55_64,
                AgeBand::A65plus,
            ],
        }
    }
}

/// One country-year of notified cases, partially populated.
///
/// Fine fields hold counts reported at the full 20-cell granularity;
/// aggregate fields hold counts for countries reporting merged bands. A
/// field is `None` when the country did not report at that granularity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub iso3: String,
    pub year: i32,
    // Fine grid, female then male.
    pub f04: Option<f64>,
    pub f59: Option<f64>,
    pub f1014: Option<f64>,
    pub f1519: Option<f64>,
    pub f2024: Option<f64>,
    pub f2534: Option<f64>,
    pub f3544: Option<f64>,
    pub f4554: Option<f64>,
    pub f5564: Option<f64>,
    pub f65: Option<f64>,
    pub m04: Option<f64>,
    pub m59: Option<f64>,
    pub m1014: Option<f64>,
    pub m1519: Option<f64>,
    pub m2024: Option<f64>,
    pub m2534: Option<f64>,
    pub m3544: Option<f64>,
    pub m4554: Option<f64>,
    pub m5564: Option<f64>,
    pub m65: Option<f64>,
    // Aggregate columns for coarser reporters.
    pub f014: Option<f64>,
    pub f514: Option<f64>,
    pub f1524: Option<f64>,
    pub f1564: Option<f64>,
    pub f15plus: Option<f64>,
    pub m014: Option<f64>,
    pub m514: Option<f64>,
    pub m1524: Option<f64>,
    pub m1564: Option<f64>,
    pub m15plus: Option<f64>,
}

impl NotificationRecord {
    /// Count reported for one fine cell, if present.
    pub fn fine(&self, cat: AgeSexCategory) -> Option<f64> {
        self.value(cat.sex, BandGroup::Single(cat.band))
    }

    /// Count reported for a sex under a band group, if present.
    pub fn value(&self, sex: Sex, group: BandGroup) -> Option<f64> {
        match (sex, group) {
            (Sex::Female, BandGroup::Single(AgeBand::A0_4)) => self.f04,
            (Sex::Female, BandGroup::Single(AgeBand::A5_9)) => self.f59,
            (Sex::Female, BandGroup::Single(AgeBand::A10_14)) => self.f1014,
            (Sex::Female, BandGroup::Single(AgeBand::A15_19)) => self.f1519,
            (Sex::Female, BandGroup::Single(AgeBand::A20_24)) => self.f2024,
            (Sex::Female, BandGroup::Single(AgeBand::A25_34)) => self.f2534,
            (Sex::Female, BandGroup::Single(AgeBand::A35_44)) => self.f3544,
            (Sex::Female, BandGroup::Single(AgeBand::A45_54)) => self.f4554,
            (Sex::Female, BandGroup::Single(AgeBand::A55_64)) => self.f5564,
            (Sex::Female, BandGroup::Single(AgeBand::A65plus)) => self.f65,
            (Sex::Female, BandGroup::C0_14) => self.f014,
            (Sex::Female, BandGroup::C5_14) => self.f514,
            (Sex::Female, BandGroup::C15_24) => self.f1524,
            (Sex::Female, BandGroup::C15_64) => self.f1564,
            (Sex::Female, BandGroup::C15plus) => self.f15plus,
            (Sex::Male, BandGroup::Single(AgeBand::A0_4)) => self.m04,
            (Sex::Male, BandGroup::Single(AgeBand::A5_9)) => self.m59,
            (Sex::Male, BandGroup::Single(AgeBand::A10_14)) => self.m1014,
            (Sex::Male, BandGroup::Single(AgeBand::A15_19)) => self.m1519,
            (Sex::Male, BandGroup::Single(AgeBand::A20_24)) => self.m2024,
            (Sex::Male, BandGroup::Single(AgeBand::A25_34)) => self.m2534,
            (Sex::Male, BandGroup::Single(AgeBand::A35_44)) => self.m3544,
            (Sex::Male, BandGroup::Single(AgeBand::A45_54)) => self.m4554,
            (Sex::Male, BandGroup::Single(AgeBand::A55_64)) => self.m5564,
            (Sex::Male, BandGroup::Single(AgeBand::A65plus)) => self.m65,
            (Sex::Male, BandGroup::C0_14) => self.m014,
            (Sex::Male, BandGroup::C5_14) => self.m514,
            (Sex::Male, BandGroup::C15_24) => self.m1524,
            (Sex::Male, BandGroup::C15_64) => self.m1564,
            (Sex::Male, BandGroup::C15plus) => self.m15plus,
        }
    }

    pub fn set_value(&mut self, sex: Sex, group: BandGroup, v: Option<f64>) {
        let slot = match (sex, group) {
            (Sex::Female, BandGroup::Single(AgeBand::A0_4)) => &mut self.f04,
            (Sex::Female, BandGroup::Single(AgeBand::A5_9)) => &mut self.f59,
            (Sex::Female, BandGroup::Single(AgeBand::A10_14)) => &mut self.f1014,
            (Sex::Female, BandGroup::Single(AgeBand::A15_19)) => &mut self.f1519,
            (Sex::Female, BandGroup::Single(AgeBand::A20_24)) => &mut self.f2024,
            (Sex::Female, BandGroup::Single(AgeBand::A25_34)) => &mut self.f2534,
            (Sex::Female, BandGroup::Single(AgeBand::A35_44)) => &mut self.f3544,
            (Sex::Female, BandGroup::Single(AgeBand::A45_54)) => &mut self.f4554,
            (Sex::Female, BandGroup::Single(AgeBand::A55_64)) => &mut self.f5564,
            (Sex::Female, BandGroup::Single(AgeBand::A65plus)) => &mut self.f65,
            (Sex::Female, BandGroup::C0_14) => &mut self.f014,
            (Sex::Female, BandGroup::C5_14) => &mut self.f514,
            (Sex::Female, BandGroup::C15_24) => &mut self.f1524,
            (Sex::Female, BandGroup::C15_64) => &mut self.f1564,
            (Sex::Female, BandGroup::C15plus) => &mut self.f15plus,
            (Sex::Male, BandGroup::Single(AgeBand::A0_4)) => &mut self.m04,
            (Sex::Male, BandGroup::Single(AgeBand::A5_9)) => &mut self.m59,
            (Sex::Male, BandGroup::Single(AgeBand::A10_14)) => &mut self.m1014,
            (Sex::Male, BandGroup::Single(AgeBand::A15_19)) => &mut self.m1519,
            (Sex::Male, BandGroup::Single(AgeBand::A20_24)) => &mut self.m2024,
            (Sex::Male, BandGroup::Single(AgeBand::A25_34)) => &mut self.m2534,
            (Sex::Male, BandGroup::Single(AgeBand::A35_44)) => &mut self.m3544,
            (Sex::Male, BandGroup::Single(AgeBand::A45_54)) => &mut self.m4554,
            (Sex::Male, BandGroup::Single(AgeBand::A55_64)) => &mut self.m5564,
            (Sex::Male, BandGroup::Single(AgeBand::A65plus)) => &mut self.m65,
            (Sex::Male, BandGroup::C0_14) => &mut self.m014,
            (Sex::Male, BandGroup::C5_14) => &mut self.m514,
            (Sex::Male, BandGroup::C15_24) => &mut self.m1524,
            (Sex::Male, BandGroup::C15_64) => &mut self.m1564,
            (Sex::Male, BandGroup::C15plus) => &mut self.m15plus,
        };
        *slot = v;
    }

    /// Total notified cases across whatever granularity was reported.
    ///
    /// Prefers the fine grid, falls back to the coarsest non-overlapping
    /// cover; returns 0.0 when nothing usable was reported.
    pub fn total(&self) -> f64 {
        let mut total = 0.0;
        for sex in Sex::ALL {
            let child = self
                .value(sex, BandGroup::C0_14)
                .or_else(|| {
                    let a = self.value(sex, BandGroup::Single(AgeBand::A0_4))?;
                    let rest = self.value(sex, BandGroup::C5_14).or_else(|| {
                        let b = self.value(sex, BandGroup::Single(AgeBand::A5_9))?;
                        let c = self.value(sex, BandGroup::Single(AgeBand::A10_14))?;
                        Some(b + c)
                    })?;
                    Some(a + rest)
                })
                .unwrap_or(0.0);
            let adult = self
                .value(sex, BandGroup::C15plus)
                .or_else(|| {
                    let base = self.value(sex, BandGroup::C15_64).or_else(|| {
                        let young = self.value(sex, BandGroup::C15_24).or_else(|| {
                            let a = self.value(sex, BandGroup::Single(AgeBand::A15_19))?;
                            let b = self.value(sex, BandGroup::Single(AgeBand::A20_24))?;
                            Some(a + b)
                        })?;
                        let mut acc = young;
                        for band in [
                            AgeBand::A25_34,
                            AgeBand::A35_44,
                            AgeBand::A45_54,
                            AgeBand::A55_64,
                        ] {
                            acc += self.value(sex, BandGroup::Single(band))?;
                        }
                        Some(acc)
                    })?;
                    Some(base + self.value(sex, BandGroup::Single(AgeBand::A65plus)).unwrap_or(0.0))
                })
                .unwrap_or(0.0);
            total += child + adult;
        }
        total
    }
}

/// Informative prior on the latent composition for one country, carried
/// over from the previous production cycle. Long-format table upstream:
/// one row per latent coordinate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorRow {
    pub iso3: String,
    /// Latent coordinate, 1..=19 (category index minus the reference).
    pub coord: usize,
    pub mean: f64,
    pub sd: f64,
}

/// Assembled 19-dimensional prior for one country.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorSpec {
    pub iso3: String,
    pub mean: Array1<f64>,
    pub sd: Array1<f64>,
}

impl PriorSpec {
    /// Weakly informative default used when a country has no carried-over
    /// prior: centered on a uniform split with wide dispersion.
    pub fn diffuse(iso3: &str) -> Self {
        Self {
            iso3: iso3.to_string(),
            mean: Array1::zeros(N_LATENT),
            sd: Array1::from_elem(N_LATENT, 2.0),
        }
    }

    /// Collect long-format rows into per-country specs. Rows with a
    /// coordinate outside 1..=19 are dropped.
    pub fn from_rows(rows: &[PriorRow]) -> Vec<PriorSpec> {
        let mut specs: Vec<PriorSpec> = Vec::new();
        for row in rows {
            if row.coord == 0 || row.coord > N_LATENT {
                continue;
            }
            let spec = match specs.iter_mut().find(|s| s.iso3 == row.iso3) {
                Some(existing) => existing,
                None => {
                    specs.push(PriorSpec::diffuse(&row.iso3));
                    specs.last_mut().expect("just pushed")
                }
            };
            spec.mean[row.coord - 1] = row.mean;
            spec.sd[row.coord - 1] = row.sd.max(1e-6);
        }
        specs
    }
}

/// Country metadata needed by the fallback layer and roll-ups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryMeta {
    pub iso3: String,
    /// WHO region code, e.g. "AFR", "SEA".
    pub region: String,
}

/// Provenance of one country-year's split in the final output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountryType {
    /// Individually modeled via the posterior.
    Est,
    /// Directly normalized from a usable notification breakdown.
    Data,
    /// Regional-average fallback.
    Model,
    /// Region or global roll-up of country rows.
    Agg,
}

/// One cell of the engine's durable output: a country-year-category share
/// with its absolute incidence and standard error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorSplitRow {
    /// Country iso3, region code for regional roll-ups, or "global".
    pub area: String,
    pub year: i32,
    /// Category label, e.g. "f04".
    pub category: String,
    /// Fractional share; sums to 1 over the 20 categories of an area-year.
    pub p: f64,
    /// Absolute incidence; sums to the national/areal total.
    pub incidence: f64,
    pub se: f64,
    pub countrytype: CountryType,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categories::all_categories;

    #[test]
    fn value_covers_every_fine_cell() {
        let mut rec = NotificationRecord {
            iso3: "AAA".into(),
            year: 2023,
            ..Default::default()
        };
        for (i, cat) in all_categories().into_iter().enumerate() {
            rec.set_value(cat.sex, BandGroup::Single(cat.band), Some(i as f64));
        }
        for (i, cat) in all_categories().into_iter().enumerate() {
            assert_eq!(rec.fine(cat), Some(i as f64));
        }
    }

    #[test]
    fn total_prefers_fine_then_aggregates() {
        let mut fine = NotificationRecord {
            iso3: "AAA".into(),
            year: 2023,
            ..Default::default()
        };
        for cat in all_categories() {
            fine.set_value(cat.sex, BandGroup::Single(cat.band), Some(10.0));
        }
        assert!((fine.total() - 200.0).abs() < 1e-9);

        let coarse = NotificationRecord {
            iso3: "BBB".into(),
            year: 2023,
            f014: Some(30.0),
            m014: Some(40.0),
            f15plus: Some(100.0),
            m15plus: Some(130.0),
            ..Default::default()
        };
        assert!((coarse.total() - 300.0).abs() < 1e-9);
    }

    #[test]
    fn prior_rows_assemble_per_country() {
        let rows = vec![
            PriorRow {
                iso3: "AAA".into(),
                coord: 1,
                mean: 0.5,
                sd: 0.3,
            },
            PriorRow {
                iso3: "AAA".into(),
                coord: 19,
                mean: -0.2,
                sd: 0.4,
            },
            PriorRow {
                iso3: "BBB".into(),
                coord: 2,
                mean: 1.0,
                sd: 0.1,
            },
        ];
        let specs = PriorSpec::from_rows(&rows);
        assert_eq!(specs.len(), 2);
        let aaa = specs.iter().find(|s| s.iso3 == "AAA").expect("AAA");
        assert!((aaa.mean[0] - 0.5).abs() < 1e-12);
        assert!((aaa.mean[18] + 0.2).abs() < 1e-12);
        assert!((aaa.sd[5] - 2.0).abs() < 1e-12, "untouched coords keep diffuse sd");
    }

    #[test]
    fn incidence_sd_from_interval() {
        let est = IncidenceEstimate {
            iso3: "AAA".into(),
            year: 2023,
            point: 1000.0,
            lo: 800.0,
            hi: 1192.0,
            method: EstimationMethod::Standard,
        };
        assert!((est.sd() - 100.0).abs() < 1e-9);
    }
}
