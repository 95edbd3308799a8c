//! Typed age/sex category grid.
//!
//! The engine's finest reporting granularity is 20 sex × age-band cells.
//! Upstream tables encode these as string column suffixes ("f04", "m2534",
//! ...); everything past the table boundary works with the typed
//! [`AgeSexCategory`] and its fixed canonical index so that no string
//! parsing leaks into the model.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of fine age/sex categories.
pub const N_CATEGORIES: usize = 20;

/// Number of free latent coordinates (one category is the softmax reference).
pub const N_LATENT: usize = N_CATEGORIES - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sex {
    Female,
    Male,
}

impl Sex {
    pub const ALL: [Sex; 2] = [Sex::Female, Sex::Male];

    fn prefix(self) -> &'static str {
        match self {
            Sex::Female => "f",
            Sex::Male => "m",
        }
    }
}

/// Five-year bands for children and young adults, decades for older adults.
/// This is the finest granularity any country reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AgeBand {
    A0_4,
    A5_9,
    A10_14,
    A15_19,
    A20_24,
    A25_34,
    A35_44,
    A45_54,
    A55_64,
    A65plus,
}

impl AgeBand {
    pub const ALL: [AgeBand; 10] = [
        AgeBand::A0_4,
        AgeBand::A5_9,
        AgeBand::A10_14,
        AgeBand::A15_19,
        AgeBand::A20_24,
        AgeBand::A25_34,
        AgeBand::A35_44,
        AgeBand::A45_54,
        AgeBand::A55_64,
        AgeBand::A65plus,
    ];

    fn suffix(self) -> &'static str {
        match self {
            AgeBand::A0_4 => "04",
            AgeBand::A5_9 => "59",
            AgeBand::A10_14 => "1014",
            AgeBand::A15_19 => "1519",
            AgeBand::A20_24 => "2024",
            AgeBand::A25_34 => "2534",
            AgeBand::A35_44 => "3544",
            AgeBand::A45_54 => "4554",
            AgeBand::A55_64 => "5564",
            AgeBand::A65plus => "65",
        }
    }

    /// Position within [`AgeBand::ALL`].
    pub fn index(self) -> usize {
        match self {
            AgeBand::A0_4 => 0,
            AgeBand::A5_9 => 1,
            AgeBand::A10_14 => 2,
            AgeBand::A15_19 => 3,
            AgeBand::A20_24 => 4,
            AgeBand::A25_34 => 5,
            AgeBand::A35_44 => 6,
            AgeBand::A45_54 => 7,
            AgeBand::A55_64 => 8,
            AgeBand::A65plus => 9,
        }
    }

    /// Bands that make up the 0-14 pediatric aggregate.
    pub fn is_child(self) -> bool {
        matches!(self, AgeBand::A0_4 | AgeBand::A5_9 | AgeBand::A10_14)
    }
}

/// One fine cell of the reporting grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgeSexCategory {
    pub sex: Sex,
    pub band: AgeBand,
}

impl AgeSexCategory {
    pub const fn new(sex: Sex, band: AgeBand) -> Self {
        Self { sex, band }
    }

    /// Canonical index in 0..20: female bands first, then male bands, each
    /// in ascending age order. Index 0 (female 0-4) is the softmax
    /// reference category.
    pub fn index(self) -> usize {
        let sex_offset = match self.sex {
            Sex::Female => 0,
            Sex::Male => AgeBand::ALL.len(),
        };
        sex_offset + self.band.index()
    }

    pub fn from_index(idx: usize) -> Option<Self> {
        if idx >= N_CATEGORIES {
            return None;
        }
        let sex = if idx < AgeBand::ALL.len() {
            Sex::Female
        } else {
            Sex::Male
        };
        let band = AgeBand::ALL[idx % AgeBand::ALL.len()];
        Some(Self { sex, band })
    }

    /// Upstream column suffix, e.g. "f04" or "m2534".
    pub fn label(self) -> String {
        format!("{}{}", self.sex.prefix(), self.band.suffix())
    }

    pub fn from_label(label: &str) -> Option<Self> {
        all_categories().into_iter().find(|c| c.label() == label)
    }
}

impl fmt::Display for AgeSexCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// All 20 categories in canonical index order.
pub fn all_categories() -> [AgeSexCategory; N_CATEGORIES] {
    let mut out = [AgeSexCategory::new(Sex::Female, AgeBand::A0_4); N_CATEGORIES];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = AgeSexCategory::from_index(i).unwrap_or(AgeSexCategory::new(Sex::Female, AgeBand::A0_4));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_index_round_trips() {
        for i in 0..N_CATEGORIES {
            let cat = AgeSexCategory::from_index(i).expect("in range");
            assert_eq!(cat.index(), i);
        }
        assert_eq!(AgeSexCategory::from_index(N_CATEGORIES), None);
    }

    #[test]
    fn labels_are_unique_and_parse_back() {
        let cats = all_categories();
        for cat in cats {
            let parsed = AgeSexCategory::from_label(&cat.label()).expect("label parses");
            assert_eq!(parsed, cat);
        }
        let mut labels: Vec<String> = cats.iter().map(|c| c.label()).collect();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), N_CATEGORIES);
    }

    #[test]
    fn reference_category_is_female_youngest() {
        let reference = AgeSexCategory::from_index(0).expect("index 0");
        assert_eq!(reference.sex, Sex::Female);
        assert_eq!(reference.band, AgeBand::A0_4);
    }
}
