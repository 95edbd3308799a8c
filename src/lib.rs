#![deny(dead_code)]
#![deny(unused_imports)]

pub mod aggregation;
pub mod categories;
pub mod driver;
pub mod model;
pub mod pattern;
pub mod reconcile;
pub mod sampler;
pub mod store;
pub mod tables;

pub use aggregation::{CoarseCell, grid, observed, penalty_weights, project};
pub use categories::{AgeBand, AgeSexCategory, N_CATEGORIES, N_LATENT, Sex, all_categories};
pub use driver::{
    EligibilityPolicy, InputTables, RunConfig, RunOutput, RunWarning, assemble_country,
    run_modeled, run_pipeline, schema_mismatch_warnings, select_modeled,
};
pub use model::{
    CountryData, ICAS_EPSILON, ModelError, ModelSettings, SplitPosterior, YearData,
    softmax_composition,
};
pub use pattern::{MissingnessPattern, classify};
pub use reconcile::{
    PandemicCorrection, ReconcileConfig, SwapBandsRule, apply_swaps, close_splits, reconcile,
    rollups,
};
pub use sampler::{CountryPosterior, SamplerConfig, run_country_sampler};
pub use tables::{
    BandGroup, CountryMeta, CountryType, EstimationMethod, IncidenceEstimate, NotificationRecord,
    PosteriorSplitRow, PriorRow, PriorSpec,
};
pub use store::{ArtifactKey, ArtifactStore, StoreError};
