//! End-to-end recovery check for the full pipeline: a country reporting
//! the complete fine grid, with every notified case in two categories and
//! notifications summing exactly to the national estimate, must get that
//! split back once the undershoot penalty is tightened.

use agesplit::categories::{AgeBand, AgeSexCategory, N_LATENT, Sex, all_categories};
use agesplit::driver::{InputTables, RunConfig, run_pipeline};
use agesplit::model::ModelSettings;
use agesplit::sampler::SamplerConfig;
use agesplit::tables::{
    BandGroup, CountryMeta, CountryType, EstimationMethod, IncidenceEstimate, NotificationRecord,
    PriorSpec,
};
use ndarray::Array1;

const INCIDENCE: f64 = 10_000.0;
const FEMALE_SHARE: f64 = 0.6;
const MALE_SHARE: f64 = 0.4;
const YEARS: [i32; 5] = [2018, 2019, 2020, 2021, 2022];

fn two_category_record(iso3: &str, year: i32) -> NotificationRecord {
    let mut rec = NotificationRecord {
        iso3: iso3.into(),
        year,
        ..Default::default()
    };
    // Every fine cell reported, so the record classifies at the full
    // grid; all cases sit in the two 25-34 cells.
    for cat in all_categories() {
        rec.set_value(cat.sex, BandGroup::Single(cat.band), Some(0.0));
    }
    rec.f2534 = Some(INCIDENCE * FEMALE_SHARE);
    rec.m2534 = Some(INCIDENCE * MALE_SHARE);
    rec
}

fn synthetic_tables() -> InputTables {
    let incidence = YEARS
        .iter()
        .map(|&year| IncidenceEstimate {
            iso3: "SYN".into(),
            year,
            point: INCIDENCE,
            lo: INCIDENCE * 0.9,
            hi: INCIDENCE * 1.1,
            method: EstimationMethod::Standard,
        })
        .collect();
    let notifications = YEARS
        .iter()
        .map(|&year| two_category_record("SYN", year))
        .collect();

    // Carried-over prior leaning toward the adult 25-34 bands, as a
    // previous cycle's estimate would.
    let female_coord = AgeSexCategory::new(Sex::Female, AgeBand::A25_34).index() - 1;
    let male_coord = AgeSexCategory::new(Sex::Male, AgeBand::A25_34).index() - 1;
    let mut mean = Array1::zeros(N_LATENT);
    mean[female_coord] = 3.0;
    mean[male_coord] = 2.6;
    let prior = PriorSpec {
        iso3: "SYN".into(),
        mean,
        sd: Array1::from_elem(N_LATENT, 0.5),
    };

    InputTables {
        incidence,
        notifications,
        priors: vec![prior],
        meta: vec![CountryMeta {
            iso3: "SYN".into(),
            region: "SEA".into(),
        }],
    }
}

#[test]
fn tight_penalty_recovers_the_generating_split() {
    let tables = synthetic_tables();
    let config = RunConfig {
        model: ModelSettings {
            ustol: 0.005,
            tstol: 0.25,
        },
        sampler: SamplerConfig {
            n_samples: 400,
            n_warmup: 600,
            n_chains: 2,
            target_accept: 0.8,
            seed: 7,
        },
        ..Default::default()
    };

    let output = run_pipeline(&tables, &config);
    assert_eq!(output.posteriors.len(), 1, "one modeled country");
    let posterior = &output.posteriors[0];
    assert_eq!(posterior.iso3, "SYN");
    assert_eq!(posterior.years, YEARS.to_vec());

    let female_idx = AgeSexCategory::new(Sex::Female, AgeBand::A25_34).index();
    let male_idx = AgeSexCategory::new(Sex::Male, AgeBand::A25_34).index();
    for (t, &year) in YEARS.iter().enumerate() {
        let row_sum: f64 = posterior.p_mean.row(t).sum();
        assert!(
            (row_sum - 1.0).abs() < 1e-6,
            "year {year}: shares sum to {row_sum}"
        );
        let f = posterior.p_mean[[t, female_idx]];
        let m = posterior.p_mean[[t, male_idx]];
        assert!(
            (f - FEMALE_SHARE).abs() < 0.01,
            "year {year}: female 25-34 share {f}, expected {FEMALE_SHARE}"
        );
        assert!(
            (m - MALE_SHARE).abs() < 0.01,
            "year {year}: male 25-34 share {m}, expected {MALE_SHARE}"
        );
    }
}

#[test]
fn closed_output_rows_match_the_national_total() {
    let tables = synthetic_tables();
    let config = RunConfig {
        model: ModelSettings {
            ustol: 0.005,
            tstol: 0.25,
        },
        sampler: SamplerConfig {
            n_samples: 300,
            n_warmup: 500,
            n_chains: 2,
            target_accept: 0.8,
            seed: 19,
        },
        ..Default::default()
    };
    let output = run_pipeline(&tables, &config);

    for &year in &YEARS {
        let rows: Vec<_> = output
            .rows
            .iter()
            .filter(|r| r.area == "SYN" && r.year == year)
            .collect();
        assert_eq!(rows.len(), 20, "year {year}: one row per category");
        assert!(rows.iter().all(|r| r.countrytype == CountryType::Est));
        let total: f64 = rows.iter().map(|r| r.incidence).sum();
        assert!(
            (total - INCIDENCE).abs() < 1e-6,
            "year {year}: closed total {total}"
        );
        let female = rows
            .iter()
            .find(|r| r.category == "f2534")
            .expect("f2534 row");
        assert!(
            (female.incidence - INCIDENCE * FEMALE_SHARE).abs() < INCIDENCE * 0.01,
            "year {year}: female 25-34 incidence {}",
            female.incidence
        );
        assert!(female.se > 0.0);
    }
}
