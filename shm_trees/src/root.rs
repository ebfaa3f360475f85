// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

use crate::clone::{GeneType, VJBase};
use crate::description::MutationsDescription;
use crate::germline::outside_flags;
use serde::{Deserialize, Serialize};
use shm_mutations::{AlgebraError, Mutations, MutationsWithRange, SeqRange};
use std::sync::Arc;

/// Germline layout shared by every node of one tree.
///
/// V and J parts are ranges of the germline sequences; the junction is the
/// reconstructed sequence between them, wildcards where the clones disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootInfo {
    pub vj_base: VJBase,
    pub v_sequence: Arc<[u8]>,
    /// Common V ranges outside of CDR3.
    pub v_ranges: Vec<SeqRange>,
    pub v_range_in_cdr3: SeqRange,
    pub reconstructed_ndn: Arc<[u8]>,
    pub j_range_in_cdr3: SeqRange,
    pub j_sequence: Arc<[u8]>,
    /// Common J ranges outside of CDR3.
    pub j_ranges: Vec<SeqRange>,
}

impl RootInfo {
    /// Lay out edits, absolute in the germlines and the junction, over the parts
    /// of this root.
    pub fn describe(
        &self,
        v_outside: &[Mutations],
        v_in_cdr3: &Mutations,
        ndn: &Mutations,
        j_in_cdr3: &Mutations,
        j_outside: &[Mutations],
    ) -> Result<MutationsDescription, AlgebraError> {
        Ok(MutationsDescription {
            v_outside: outside_parts(&self.v_sequence, &self.v_ranges, v_outside, GeneType::Variable)?,
            v_in_cdr3: MutationsWithRange::new(self.v_sequence.clone(), v_in_cdr3, self.v_range_in_cdr3, false),
            ndn: MutationsWithRange::over_whole(self.reconstructed_ndn.clone(), ndn),
            j_in_cdr3: MutationsWithRange::new(self.j_sequence.clone(), j_in_cdr3, self.j_range_in_cdr3, true),
            j_outside: outside_parts(&self.j_sequence, &self.j_ranges, j_outside, GeneType::Joining)?,
        })
    }

    /// The root itself: no edits at all.
    pub fn empty_description(&self) -> MutationsDescription {
        let empty = |sequence: &Arc<[u8]>, ranges: &[SeqRange], gene_type| -> Vec<MutationsWithRange> {
            ranges
                .iter()
                .zip(outside_flags(ranges, gene_type))
                .map(|(&range, flag)| MutationsWithRange::new(sequence.clone(), &Mutations::empty(), range, flag))
                .collect()
        };
        MutationsDescription {
            v_outside: empty(&self.v_sequence, &self.v_ranges, GeneType::Variable),
            v_in_cdr3: MutationsWithRange::new(
                self.v_sequence.clone(),
                &Mutations::empty(),
                self.v_range_in_cdr3,
                false,
            ),
            ndn: MutationsWithRange::over_whole(self.reconstructed_ndn.clone(), &Mutations::empty()),
            j_in_cdr3: MutationsWithRange::new(self.j_sequence.clone(), &Mutations::empty(), self.j_range_in_cdr3, true),
            j_outside: empty(&self.j_sequence, &self.j_ranges, GeneType::Joining),
        }
    }

    /// Germline CDR3 of the root with the junction in between.
    pub fn cdr3(&self) -> Vec<u8> {
        let mut cdr3 = self.v_sequence[self.v_range_in_cdr3.as_range()].to_vec();
        cdr3.extend_from_slice(&self.reconstructed_ndn);
        cdr3.extend_from_slice(&self.j_sequence[self.j_range_in_cdr3.as_range()]);
        cdr3
    }

    /// Bounds of the junction in a CDR3 of `cdr3_len` letters whose V and J
    /// parts changed length by the given deltas. The lower bound exceeds the
    /// upper one when the parts overlap.
    pub fn ndn_range_in_cdr3(&self, cdr3_len: usize, v_delta: isize, j_delta: isize) -> (isize, isize) {
        (
            self.v_range_in_cdr3.len() as isize + v_delta,
            cdr3_len as isize - self.j_range_in_cdr3.len() as isize - j_delta,
        )
    }
}

fn outside_parts(
    sequence: &Arc<[u8]>,
    ranges: &[SeqRange],
    mutations: &[Mutations],
    gene_type: GeneType,
) -> Result<Vec<MutationsWithRange>, AlgebraError> {
    if ranges.len() != mutations.len() {
        return Err(AlgebraError::LayoutMismatch(format!(
            "{} ranges and {} edit sets of {:?} outside of CDR3",
            ranges.len(),
            mutations.len(),
            gene_type
        )));
    }
    Ok(ranges
        .iter()
        .zip(outside_flags(ranges, gene_type))
        .zip(mutations)
        .map(|((&range, flag), m)| MutationsWithRange::new(sequence.clone(), m, range, flag))
        .collect())
}
