//! Deterministic projections from the 20-cell fine grid to each pattern's
//! coarse reporting grid.
//!
//! One generic routine parameterized by a per-pattern cell table replaces
//! the per-pattern special cases: the same table projects both the
//! model-implied fine split and the observed counts, so the two sides of
//! the data-fit term are always on the same grid. Each cell also carries
//! a penalty weight equal to the number of fine bins merged into it;
//! merged cells hold larger absolute counts with lower relative noise, and
//! the weight keeps their per-cell penalty contributions comparably
//! scaled.

use crate::categories::{AgeSexCategory, N_CATEGORIES, Sex};
use crate::pattern::MissingnessPattern;
use crate::tables::{BandGroup, NotificationRecord};
use ndarray::{Array1, ArrayView1};

/// One coarse reporting cell: a sex and the band group summed into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoarseCell {
    pub sex: Sex,
    pub group: BandGroup,
}

impl CoarseCell {
    const fn new(sex: Sex, group: BandGroup) -> Self {
        Self { sex, group }
    }

    /// Canonical fine indices summed into this cell.
    pub fn fine_indices(&self) -> Vec<usize> {
        self.group
            .fine_bands()
            .iter()
            .map(|band| AgeSexCategory::new(self.sex, *band).index())
            .collect()
    }

    /// Number of fine bins merged into this cell.
    pub fn width(&self) -> usize {
        self.group.fine_bands().len()
    }
}

macro_rules! per_sex {
    ($($group:expr),+ $(,)?) => {
        &[
            $(CoarseCell::new(Sex::Female, $group),)+
            $(CoarseCell::new(Sex::Male, $group),)+
        ]
    };
}

use crate::categories::AgeBand::*;

const GRID_P3: &[CoarseCell] = per_sex![
    BandGroup::Single(A0_4),
    BandGroup::Single(A5_9),
    BandGroup::Single(A10_14),
    BandGroup::Single(A15_19),
    BandGroup::Single(A20_24),
    BandGroup::Single(A25_34),
    BandGroup::Single(A35_44),
    BandGroup::Single(A45_54),
    BandGroup::Single(A55_64),
    BandGroup::Single(A65plus),
];

const GRID_P2: &[CoarseCell] = per_sex![
    BandGroup::Single(A0_4),
    BandGroup::C5_14,
    BandGroup::C15_24,
    BandGroup::Single(A25_34),
    BandGroup::Single(A35_44),
    BandGroup::Single(A45_54),
    BandGroup::Single(A55_64),
    BandGroup::Single(A65plus),
];

const GRID_P4: &[CoarseCell] = per_sex![
    BandGroup::C0_14,
    BandGroup::C15_24,
    BandGroup::Single(A25_34),
    BandGroup::Single(A35_44),
    BandGroup::Single(A45_54),
    BandGroup::Single(A55_64),
    BandGroup::Single(A65plus),
];

const GRID_P5: &[CoarseCell] = per_sex![
    BandGroup::C0_14,
    BandGroup::C15_64,
    BandGroup::Single(A65plus),
];

const GRID_P6: &[CoarseCell] = per_sex![BandGroup::C0_14, BandGroup::C15plus];

/// The coarse grid a pattern reports under. Pattern 1 has no grid.
pub fn grid(pattern: MissingnessPattern) -> &'static [CoarseCell] {
    match pattern {
        MissingnessPattern::P1 => &[],
        MissingnessPattern::P2 => GRID_P2,
        MissingnessPattern::P3 => GRID_P3,
        MissingnessPattern::P4 => GRID_P4,
        MissingnessPattern::P5 => GRID_P5,
        MissingnessPattern::P6 => GRID_P6,
    }
}

/// Sum a fine 20-vector onto a pattern's coarse grid.
///
/// Works for probability vectors and absolute splits alike; the
/// projection is linear, so coarse sums always equal the corresponding
/// fine marginal sums.
pub fn project(fine: ArrayView1<'_, f64>, pattern: MissingnessPattern) -> Array1<f64> {
    debug_assert_eq!(fine.len(), N_CATEGORIES);
    let cells = grid(pattern);
    let mut out = Array1::zeros(cells.len());
    for (k, cell) in cells.iter().enumerate() {
        out[k] = cell.fine_indices().iter().map(|&i| fine[i]).sum();
    }
    out
}

/// Observed counts on a pattern's grid, in grid order. A cell the country
/// did not report (e.g. the 15+ remainder under pattern 6) stays `None`
/// and contributes nothing to the data term.
pub fn observed(record: &NotificationRecord, pattern: MissingnessPattern) -> Vec<Option<f64>> {
    grid(pattern)
        .iter()
        .map(|cell| record.value(cell.sex, cell.group))
        .collect()
}

/// Penalty weight per coarse cell: the number of fine bins merged.
pub fn penalty_weights(pattern: MissingnessPattern) -> Array1<f64> {
    Array1::from_iter(grid(pattern).iter().map(|cell| cell.width() as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    #[test]
    fn grid_sizes_match_pattern_granularity() {
        assert_eq!(grid(MissingnessPattern::P1).len(), 0);
        assert_eq!(grid(MissingnessPattern::P2).len(), 16);
        assert_eq!(grid(MissingnessPattern::P3).len(), 20);
        assert_eq!(grid(MissingnessPattern::P4).len(), 14);
        assert_eq!(grid(MissingnessPattern::P5).len(), 6);
        assert_eq!(grid(MissingnessPattern::P6).len(), 4);
    }

    #[test]
    fn every_grid_partitions_the_fine_cells() {
        for pattern in [
            MissingnessPattern::P2,
            MissingnessPattern::P3,
            MissingnessPattern::P4,
            MissingnessPattern::P5,
            MissingnessPattern::P6,
        ] {
            let mut seen = vec![0usize; N_CATEGORIES];
            for cell in grid(pattern) {
                for idx in cell.fine_indices() {
                    seen[idx] += 1;
                }
            }
            assert!(
                seen.iter().all(|&c| c == 1),
                "pattern {:?} does not partition the fine grid: {:?}",
                pattern,
                seen
            );
        }
    }

    #[test]
    fn projection_preserves_total() {
        let fine = Array1::from_iter((0..N_CATEGORIES).map(|i| (i + 1) as f64));
        let total: f64 = fine.sum();
        for pattern in [
            MissingnessPattern::P2,
            MissingnessPattern::P4,
            MissingnessPattern::P5,
            MissingnessPattern::P6,
        ] {
            let coarse = project(fine.view(), pattern);
            assert!(
                (coarse.sum() - total).abs() < 1e-12,
                "pattern {:?} loses mass",
                pattern
            );
        }
    }

    #[test]
    fn weights_count_merged_bins() {
        let w = penalty_weights(MissingnessPattern::P5);
        assert_eq!(w.len(), 6);
        // Per sex: 0-14 merges 3 bins, 15-64 merges 6, 65+ is a single bin.
        assert_eq!(w[0], 3.0);
        assert_eq!(w[1], 6.0);
        assert_eq!(w[2], 1.0);
    }

    #[test]
    fn pattern_three_grid_is_identity() {
        let fine = Array1::from_iter((0..N_CATEGORIES).map(|i| i as f64 * 0.7));
        let coarse = project(fine.view(), MissingnessPattern::P3);
        assert_eq!(coarse.len(), N_CATEGORIES);
        for cell in grid(MissingnessPattern::P3) {
            assert_eq!(cell.width(), 1);
        }
        assert!((coarse.sum() - fine.sum()).abs() < 1e-12);
    }
}
