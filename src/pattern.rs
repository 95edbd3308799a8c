//! Missingness-pattern classification.
//!
//! Each country-year's notification record is reported at one of six
//! granularities. Classification is a pure function of which fields are
//! present: six disjoint NA-signatures evaluated from most detailed
//! (pattern 3, the full 20-cell grid) to least (pattern 6, only the two
//! 0-14 aggregates). A record matching no signature is pattern 1 and
//! contributes no data term to the model.

use crate::categories::{AgeBand, Sex};
use crate::tables::{BandGroup, NotificationRecord};
use serde::{Deserialize, Serialize};

/// Granularity level of one country-year's reported breakdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MissingnessPattern {
    /// No usable breakdown.
    P1,
    /// 16 cells: 0-4 fine, 5-14 and 15-24 merged, adult decades fine.
    P2,
    /// Full 20-cell grid.
    P3,
    /// 14 cells: 0-14 merged, 15-24 merged, adult decades fine.
    P4,
    /// 6 cells: 0-14, 15-64, 65+ per sex.
    P5,
    /// 4 cells: 0-14 and the 15+ remainder per sex.
    P6,
}

impl MissingnessPattern {
    pub const ALL: [MissingnessPattern; 6] = [
        MissingnessPattern::P1,
        MissingnessPattern::P2,
        MissingnessPattern::P3,
        MissingnessPattern::P4,
        MissingnessPattern::P5,
        MissingnessPattern::P6,
    ];

    pub fn code(self) -> u8 {
        match self {
            MissingnessPattern::P1 => 1,
            MissingnessPattern::P2 => 2,
            MissingnessPattern::P3 => 3,
            MissingnessPattern::P4 => 4,
            MissingnessPattern::P5 => 5,
            MissingnessPattern::P6 => 6,
        }
    }

    /// Whether this pattern contributes a data term.
    pub fn has_data(self) -> bool {
        self != MissingnessPattern::P1
    }
}

/// Per-sex field signature: every `required` group present and every
/// `absent` group missing, for both sexes.
struct Signature {
    pattern: MissingnessPattern,
    required: &'static [BandGroup],
    absent: &'static [BandGroup],
}

const FINE_GRID: [BandGroup; 10] = [
    BandGroup::Single(AgeBand::A0_4),
    BandGroup::Single(AgeBand::A5_9),
    BandGroup::Single(AgeBand::A10_14),
    BandGroup::Single(AgeBand::A15_19),
    BandGroup::Single(AgeBand::A20_24),
    BandGroup::Single(AgeBand::A25_34),
    BandGroup::Single(AgeBand::A35_44),
    BandGroup::Single(AgeBand::A45_54),
    BandGroup::Single(AgeBand::A55_64),
    BandGroup::Single(AgeBand::A65plus),
];

/// Signatures ordered most-detailed-first. Later signatures require the
/// finer fields to be absent, so a record matches at most one entry even
/// without relying on evaluation order.
const SIGNATURES: [Signature; 5] = [
    Signature {
        pattern: MissingnessPattern::P3,
        required: &FINE_GRID,
        absent: &[],
    },
    Signature {
        pattern: MissingnessPattern::P2,
        required: &[
            BandGroup::Single(AgeBand::A0_4),
            BandGroup::C5_14,
            BandGroup::C15_24,
            BandGroup::Single(AgeBand::A25_34),
            BandGroup::Single(AgeBand::A35_44),
            BandGroup::Single(AgeBand::A45_54),
            BandGroup::Single(AgeBand::A55_64),
            BandGroup::Single(AgeBand::A65plus),
        ],
        absent: &[
            BandGroup::Single(AgeBand::A5_9),
            BandGroup::Single(AgeBand::A10_14),
            BandGroup::Single(AgeBand::A15_19),
            BandGroup::Single(AgeBand::A20_24),
        ],
    },
    Signature {
        pattern: MissingnessPattern::P4,
        required: &[
            BandGroup::C0_14,
            BandGroup::C15_24,
            BandGroup::Single(AgeBand::A25_34),
            BandGroup::Single(AgeBand::A35_44),
            BandGroup::Single(AgeBand::A45_54),
            BandGroup::Single(AgeBand::A55_64),
            BandGroup::Single(AgeBand::A65plus),
        ],
        absent: &[
            BandGroup::Single(AgeBand::A0_4),
            BandGroup::C5_14,
            BandGroup::Single(AgeBand::A15_19),
            BandGroup::Single(AgeBand::A20_24),
        ],
    },
    Signature {
        pattern: MissingnessPattern::P5,
        required: &[
            BandGroup::C0_14,
            BandGroup::C15_64,
            BandGroup::Single(AgeBand::A65plus),
        ],
        absent: &[
            BandGroup::Single(AgeBand::A15_19),
            BandGroup::Single(AgeBand::A20_24),
            BandGroup::C15_24,
            BandGroup::Single(AgeBand::A25_34),
            BandGroup::Single(AgeBand::A35_44),
            BandGroup::Single(AgeBand::A45_54),
            BandGroup::Single(AgeBand::A55_64),
        ],
    },
    Signature {
        pattern: MissingnessPattern::P6,
        required: &[BandGroup::C0_14],
        absent: &[
            BandGroup::Single(AgeBand::A15_19),
            BandGroup::Single(AgeBand::A20_24),
            BandGroup::C15_24,
            BandGroup::Single(AgeBand::A25_34),
            BandGroup::Single(AgeBand::A35_44),
            BandGroup::Single(AgeBand::A45_54),
            BandGroup::Single(AgeBand::A55_64),
            BandGroup::C15_64,
            BandGroup::Single(AgeBand::A65plus),
        ],
    },
];

fn matches(record: &NotificationRecord, sig: &Signature) -> bool {
    for sex in Sex::ALL {
        for group in sig.required {
            if record.value(sex, *group).is_none() {
                return false;
            }
        }
        for group in sig.absent {
            if record.value(sex, *group).is_some() {
                return false;
            }
        }
    }
    true
}

/// Classify one country-year's record. Total: every record maps to
/// exactly one pattern.
pub fn classify(record: &NotificationRecord) -> MissingnessPattern {
    SIGNATURES
        .iter()
        .find(|sig| matches(record, sig))
        .map(|sig| sig.pattern)
        .unwrap_or(MissingnessPattern::P1)
}
