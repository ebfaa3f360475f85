// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! Five part view of a sequence relative to a root: V outside of CDR3, V in
//! CDR3, the junction, J in CDR3 and J outside of CDR3.

use crate::params::ScoringSet;
use shm_mutations::ndn::{concrete_ndn_child, find_ndn_common_ancestor};
use shm_mutations::{AlgebraError, AlignmentScoring, MutationsWithRange};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationsDescription {
    pub v_outside: Vec<MutationsWithRange>,
    pub v_in_cdr3: MutationsWithRange,
    pub ndn: MutationsWithRange,
    pub j_in_cdr3: MutationsWithRange,
    pub j_outside: Vec<MutationsWithRange>,
}

type PartOp<'a> = &'a dyn Fn(&MutationsWithRange, &MutationsWithRange) -> Result<MutationsWithRange, AlgebraError>;

fn zip_parts(
    first: &[MutationsWithRange],
    second: &[MutationsWithRange],
    what: &str,
    op: PartOp<'_>,
) -> Result<Vec<MutationsWithRange>, AlgebraError> {
    if first.len() != second.len() {
        return Err(AlgebraError::LayoutMismatch(format!(
            "{} {what} parts vs {}",
            first.len(),
            second.len()
        )));
    }
    first.iter().zip(second).map(|(a, b)| op(a, b)).collect()
}

impl MutationsDescription {
    fn zip_with(&self, other: &MutationsDescription, op: PartOp<'_>) -> Result<MutationsDescription, AlgebraError> {
        Ok(MutationsDescription {
            v_outside: zip_parts(&self.v_outside, &other.v_outside, "V", op)?,
            v_in_cdr3: op(&self.v_in_cdr3, &other.v_in_cdr3)?,
            ndn: op(&self.ndn, &other.ndn)?,
            j_in_cdr3: op(&self.j_in_cdr3, &other.j_in_cdr3)?,
            j_outside: zip_parts(&self.j_outside, &other.j_outside, "J", op)?,
        })
    }

    /// Edits leading from this state to `other`, part by part. The parts of the
    /// result are based on the built parts of `self`.
    pub fn difference_with(&self, other: &MutationsDescription) -> Result<MutationsDescription, AlgebraError> {
        self.zip_with(other, &MutationsWithRange::difference_with)
    }

    /// Apply a difference computed from this state.
    pub fn combine_with(&self, difference: &MutationsDescription) -> Result<MutationsDescription, AlgebraError> {
        self.zip_with(difference, &MutationsWithRange::combine_with)
    }

    /// Edits shared by both descriptions. Junction parts keep the most likely
    /// common ancestor of the two junctions instead of a plain intersection.
    pub fn common_mutations(&self, other: &MutationsDescription) -> Result<MutationsDescription, AlgebraError> {
        let mut common = self.zip_with(other, &MutationsWithRange::intersection)?;
        common.ndn = self
            .ndn
            .with_mutations(find_ndn_common_ancestor(self.ndn.mutations(), other.ndn.mutations()));
        Ok(common)
    }

    /// Resolve junction wildcards that the parent already fixed.
    pub fn with_concrete_ndn(&self, parent: &MutationsDescription) -> MutationsDescription {
        MutationsDescription {
            ndn: self
                .ndn
                .with_mutations(concrete_ndn_child(parent.ndn.mutations(), self.ndn.mutations())),
            ..self.clone()
        }
    }

    pub fn v_parts(&self) -> impl Iterator<Item = &MutationsWithRange> {
        self.v_outside.iter().chain(std::iter::once(&self.v_in_cdr3))
    }

    pub fn j_parts(&self) -> impl Iterator<Item = &MutationsWithRange> {
        std::iter::once(&self.j_in_cdr3).chain(&self.j_outside)
    }

    pub fn vj_mutations_count(&self) -> usize {
        self.v_parts().chain(self.j_parts()).map(|p| p.mutations().len()).sum()
    }

    pub fn mutations_count(&self) -> usize {
        self.vj_mutations_count() + self.ndn.mutations().len()
    }

    pub fn ndn_sequence(&self) -> &[u8] {
        self.ndn.build_sequence()
    }

    pub fn build_cdr3(&self) -> Vec<u8> {
        let mut cdr3 = self.v_in_cdr3.build_sequence().to_vec();
        cdr3.extend_from_slice(self.ndn.build_sequence());
        cdr3.extend_from_slice(self.j_in_cdr3.build_sequence());
        cdr3
    }

    /// Alignment score of every part against its base, V and J with the gene
    /// scoring and the junction with the junction scoring.
    pub fn score(&self, scoring: &ScoringSet) -> i32 {
        let v: i32 = self.v_parts().map(|p| p.score(&scoring.v)).sum();
        let j: i32 = self.j_parts().map(|p| p.score(&scoring.j)).sum();
        v + self.ndn.score(&scoring.ndn) + j
    }
}

/// Penalty of a difference: score lost against a perfect match, summed over
/// parts, with the lengths of the parts.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct Penalty {
    pub v: f64,
    pub v_len: usize,
    pub ndn: f64,
    pub ndn_len: usize,
    pub j: f64,
    pub j_len: usize,
}

impl Penalty {
    pub(crate) fn of(difference: &MutationsDescription, scoring: &ScoringSet) -> Penalty {
        let lost = |p: &MutationsWithRange, s: &AlignmentScoring| f64::from(p.max_score(s) - p.score(s));
        Penalty {
            v: difference.v_parts().map(|p| lost(p, &scoring.v)).sum(),
            v_len: difference.v_parts().map(|p| p.range().len()).sum(),
            ndn: lost(&difference.ndn, &scoring.ndn),
            ndn_len: difference.ndn.range().len(),
            j: difference.j_parts().map(|p| lost(p, &scoring.j)).sum(),
            j_len: difference.j_parts().map(|p| p.range().len()).sum(),
        }
    }

    /// Junction penalties weighted by `ndn_multiplier`, normalized by the total
    /// length. Zero for an empty difference.
    pub(crate) fn normalized(&self, ndn_multiplier: f64) -> f64 {
        let len = self.v_len + self.ndn_len + self.j_len;
        if len == 0 {
            return 0.0;
        }
        (self.ndn * ndn_multiplier + self.v + self.j) / len as f64
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use shm_mutations::{Mutations, SeqRange};
    use std::sync::Arc;

    fn m(s: &str) -> Mutations {
        s.parse().unwrap()
    }

    pub(crate) fn description(v: &str, ndn: &str, j: &str) -> MutationsDescription {
        let v_seq: Arc<[u8]> = b"ACGTACGTACGTAAA".to_vec().into();
        let j_seq: Arc<[u8]> = b"TTTGGGCCCAAATTT".to_vec().into();
        let ndn_seq: Arc<[u8]> = b"NNNN".to_vec().into();
        let v = m(v);
        let j = m(j);
        MutationsDescription {
            v_outside: vec![MutationsWithRange::new(v_seq.clone(), &v, SeqRange::new(0, 12), true)],
            v_in_cdr3: MutationsWithRange::new(v_seq, &v, SeqRange::new(12, 15), false),
            ndn: MutationsWithRange::over_whole(ndn_seq, &m(ndn)),
            j_in_cdr3: MutationsWithRange::new(j_seq.clone(), &j, SeqRange::new(0, 3), true),
            j_outside: vec![MutationsWithRange::new(j_seq, &j, SeqRange::new(3, 15), false)],
        }
    }

    #[test]
    fn test_difference_then_combine() {
        let parent = description("SC1G", "SN0A", "");
        let child = description("SC1GSA4TSA13C", "SN0ASN2C", "SG5A");
        let diff = parent.difference_with(&child).unwrap();
        assert_eq!(diff.vj_mutations_count(), 3);
        assert_eq!(diff.ndn.mutations().len(), 1);
        let rebuilt = parent.combine_with(&diff).unwrap();
        assert_eq!(rebuilt, child);
        assert_eq!(rebuilt.build_cdr3(), child.build_cdr3());
    }

    #[test]
    fn test_common_mutations_resolve_junction() {
        let first = description("SA4TSA8C", "SN0ASN1C", "");
        let second = description("SA4T", "SN0ASN1G", "");
        let common = first.common_mutations(&second).unwrap();
        assert_eq!(common.v_outside[0].mutations(), &m("SA4T"));
        // C and G at position 1 combine into S
        assert_eq!(common.ndn.mutations(), &m("SN0ASN1S"));
    }

    #[test]
    fn test_layout_mismatch_is_an_error() {
        let first = description("", "", "");
        let mut second = description("", "", "");
        second.v_outside.clear();
        assert!(matches!(
            first.difference_with(&second),
            Err(AlgebraError::LayoutMismatch(_))
        ));
    }

    #[test]
    fn test_penalty_of_empty_difference_is_zero() {
        let scoring = ScoringSet::default();
        let d = description("", "", "");
        let diff = d.difference_with(&d).unwrap();
        let penalty = Penalty::of(&diff, &scoring);
        assert_eq!(penalty.normalized(2.0), 0.0);
        assert_eq!(penalty.v_len, 15);
    }
}
