// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! Edits confined to a sub-range of a base sequence.

use crate::error::AlgebraError;
use crate::mutation::Mutations;
use crate::range::SeqRange;
use crate::scoring::AlignmentScoring;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Edits of `sequence1` restricted to `range`.
///
/// The edits are stored with absolute positions in `sequence1` and are filtered
/// to the range on construction: insertions at `range.upper` always belong to the
/// range, insertions at `range.lower` only when `include_first_inserts` is set.
/// The built sequence is the slice `sequence1[range]` with the edits applied.
///
/// [`difference_with`](Self::difference_with) produces a value whose base is the
/// built sequence of `self` and whose range covers all of it; such a value is
/// what [`combine_with`](Self::combine_with) accepts.
#[derive(Clone)]
pub struct MutationsWithRange {
    sequence1: Arc<[u8]>,
    mutations: Mutations,
    range: SeqRange,
    include_first_inserts: bool,
    built: OnceLock<Arc<[u8]>>,
}

impl MutationsWithRange {
    pub fn new(
        sequence1: Arc<[u8]>,
        mutations: &Mutations,
        range: SeqRange,
        include_first_inserts: bool,
    ) -> Self {
        MutationsWithRange {
            mutations: mutations.extract_absolute_mutations(range, include_first_inserts),
            sequence1,
            range,
            include_first_inserts,
            built: OnceLock::new(),
        }
    }

    /// Edits over the whole of `sequence1`, leading insertions included.
    pub fn over_whole(sequence1: Arc<[u8]>, mutations: &Mutations) -> Self {
        let range = SeqRange::new(0, sequence1.len());
        Self::new(sequence1, mutations, range, true)
    }

    pub fn sequence1(&self) -> &Arc<[u8]> {
        &self.sequence1
    }

    pub fn mutations(&self) -> &Mutations {
        &self.mutations
    }

    pub fn range(&self) -> SeqRange {
        self.range
    }

    pub fn include_first_inserts(&self) -> bool {
        self.include_first_inserts
    }

    /// Edits shifted so that position 0 is `range.lower`.
    pub fn local_mutations(&self) -> Mutations {
        self.mutations.move_by(-(self.range.lower as isize))
    }

    pub fn build_sequence(&self) -> &[u8] {
        self.built_arc()
    }

    fn built_arc(&self) -> &Arc<[u8]> {
        self.built.get_or_init(|| {
            let base = &self.sequence1[self.range.as_range()];
            self.local_mutations().mutate(base).into()
        })
    }

    /// Length of the built sequence minus the length of the range.
    pub fn length_delta(&self) -> isize {
        self.mutations.length_delta()
    }

    /// Score of the built sequence aligned to `sequence1[range]`.
    pub fn score(&self, scoring: &AlignmentScoring) -> i32 {
        let base = &self.sequence1[self.range.as_range()];
        scoring.calculate_score(base, &self.local_mutations())
    }

    /// Best achievable score over the range.
    pub fn max_score(&self, scoring: &AlignmentScoring) -> i32 {
        scoring.max_score(self.range.len())
    }

    fn check_same_layout(&self, other: &MutationsWithRange) -> Result<(), AlgebraError> {
        if self.range != other.range {
            return Err(AlgebraError::RangeMismatch {
                left: self.range,
                right: other.range,
            });
        }
        if self.include_first_inserts != other.include_first_inserts {
            return Err(AlgebraError::FlagMismatch);
        }
        if self.sequence1 != other.sequence1 {
            return Err(AlgebraError::BaseMismatch {
                left: self.sequence1.len(),
                right: other.sequence1.len(),
            });
        }
        Ok(())
    }

    /// Edits that lead from the built sequence of `self` to the built sequence of
    /// `other`. Both must share base, range and flag.
    pub fn difference_with(&self, other: &MutationsWithRange) -> Result<MutationsWithRange, AlgebraError> {
        self.check_same_layout(other)?;
        let between = self
            .local_mutations()
            .invert()
            .combine_with(&other.local_mutations());
        Ok(MutationsWithRange::over_whole(self.built_arc().clone(), &between))
    }

    /// Apply a difference produced from this value.
    pub fn combine_with(&self, difference: &MutationsWithRange) -> Result<MutationsWithRange, AlgebraError> {
        let built = self.built_arc();
        let expected = SeqRange::new(0, built.len());
        if difference.range != expected {
            return Err(AlgebraError::RangeMismatch {
                left: expected,
                right: difference.range,
            });
        }
        if difference.sequence1 != *built {
            return Err(AlgebraError::BaseMismatch {
                left: built.len(),
                right: difference.sequence1.len(),
            });
        }
        let combined = self
            .local_mutations()
            .combine_with(&difference.mutations)
            .move_by(self.range.lower as isize);
        Ok(MutationsWithRange::new(
            self.sequence1.clone(),
            &combined,
            self.range,
            self.include_first_inserts,
        ))
    }

    /// Edits present in both values. Both must share base, range and flag.
    pub fn intersection(&self, other: &MutationsWithRange) -> Result<MutationsWithRange, AlgebraError> {
        self.check_same_layout(other)?;
        Ok(self.with_mutations(self.mutations.intersection(&other.mutations)))
    }

    /// Same base, range and flag with other edits.
    pub fn with_mutations(&self, mutations: Mutations) -> MutationsWithRange {
        MutationsWithRange::new(
            self.sequence1.clone(),
            &mutations,
            self.range,
            self.include_first_inserts,
        )
    }
}

impl PartialEq for MutationsWithRange {
    fn eq(&self, other: &Self) -> bool {
        self.range == other.range
            && self.include_first_inserts == other.include_first_inserts
            && self.mutations == other.mutations
            && self.sequence1 == other.sequence1
    }
}

impl Eq for MutationsWithRange {}

impl fmt::Debug for MutationsWithRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationsWithRange")
            .field("range", &self.range)
            .field("mutations", &self.mutations.to_string())
            .field("include_first_inserts", &self.include_first_inserts)
            .field("sequence1_len", &self.sequence1.len())
            .finish()
    }
}
