// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! Global pairwise alignment expressed as edits of the first sequence.

use crate::mutation::{Mutation, Mutations};
use crate::range::SeqRange;
use crate::scoring::AlignmentScoring;
use bio::alignment::pairwise::Aligner;
use bio::alignment::AlignmentOperation;

/// Edits turning the first sequence into the second, with the alignment score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alignment {
    pub mutations: Mutations,
    pub score: i32,
}

/// Align `seq1` against `seq2` end to end.
pub fn align_global(scoring: &AlignmentScoring, seq1: &[u8], seq2: &[u8]) -> Alignment {
    align_global_range(
        scoring,
        seq1,
        SeqRange::new(0, seq1.len()),
        seq2,
        SeqRange::new(0, seq2.len()),
    )
}

/// Align `seq1[range1]` against `seq2[range2]` end to end. Edit positions are
/// absolute in `seq1`.
pub fn align_global_range(
    scoring: &AlignmentScoring,
    seq1: &[u8],
    range1: SeqRange,
    seq2: &[u8],
    range2: SeqRange,
) -> Alignment {
    let x = &seq1[range1.as_range()];
    let y = &seq2[range2.as_range()];
    let offset = range1.lower;

    if x.is_empty() || y.is_empty() {
        let mutations: Mutations = if x.is_empty() {
            y.iter()
                .map(|&to| Mutation::Insertion { position: offset, to })
                .collect()
        } else {
            x.iter()
                .enumerate()
                .map(|(i, &from)| Mutation::Deletion { position: offset + i, from })
                .collect()
        };
        let gap = x.len() + y.len();
        let score = if gap == 0 {
            0
        } else {
            scoring.gap_open() + (gap as i32 - 1) * scoring.gap_extend()
        };
        return Alignment { mutations, score };
    }

    // bio scores a gap of length k as open + k * extend
    let score_fn = |a: u8, b: u8| scoring.score(a, b);
    let mut aligner = Aligner::with_capacity(
        x.len(),
        y.len(),
        scoring.gap_open() - scoring.gap_extend(),
        scoring.gap_extend(),
        &score_fn,
    );
    let alignment = aligner.global(x, y);

    let (mut i, mut j) = (0, 0);
    let mut mutations = Vec::new();
    for op in &alignment.operations {
        match *op {
            AlignmentOperation::Match => {
                i += 1;
                j += 1;
            }
            AlignmentOperation::Subst => {
                mutations.push(Mutation::Substitution {
                    position: offset + i,
                    from: x[i],
                    to: y[j],
                });
                i += 1;
                j += 1;
            }
            AlignmentOperation::Ins => {
                mutations.push(Mutation::Deletion { position: offset + i, from: x[i] });
                i += 1;
            }
            AlignmentOperation::Del => {
                mutations.push(Mutation::Insertion { position: offset + i, to: y[j] });
                j += 1;
            }
            AlignmentOperation::Xclip(n) => i += n,
            AlignmentOperation::Yclip(n) => j += n,
        }
    }
    Alignment {
        mutations: Mutations::new(mutations),
        score: alignment.score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_identical() {
        let scoring = AlignmentScoring::blast_linear();
        let a = align_global(&scoring, b"ACGTACGT", b"ACGTACGT");
        assert!(a.mutations.is_empty());
        assert_eq!(a.score, 40);
    }

    #[test]
    fn test_substitution_and_gaps() {
        let scoring = AlignmentScoring::blast_linear();
        let a = align_global(&scoring, b"ACGTACGTAA", b"ACGAACGTAA");
        assert_eq!(a.mutations.to_string(), "ST3A");
        assert_eq!(a.mutations.mutate(b"ACGTACGTAA"), b"ACGAACGTAA".to_vec());

        let a = align_global(&scoring, b"ACGTTTACGT", b"ACGTTACGT");
        assert_eq!(a.mutations.len(), 1);
        assert!(a.mutations.iter().all(|m| m.is_deletion()));
        assert_eq!(a.mutations.mutate(b"ACGTTTACGT"), b"ACGTTACGT".to_vec());
    }

    #[test]
    fn test_empty_operands() {
        let scoring = AlignmentScoring::ndn_default();
        let a = align_global(&scoring, b"", b"AC");
        assert_eq!(a.mutations.to_string(), "I0AI0C");
        assert_eq!(a.score, -11);
        let a = align_global(&scoring, b"AC", b"");
        assert_eq!(a.mutations.to_string(), "DA0DC1");
        assert_eq!(a.score, -11);
    }

    #[test]
    fn test_range_offsets() {
        let scoring = AlignmentScoring::blast_linear();
        let a = align_global_range(&scoring, b"TTTTACGT", SeqRange::new(4, 8), b"ACCT", SeqRange::new(0, 4));
        assert_eq!(a.mutations.to_string(), "SG6C");
    }

    #[test]
    fn test_wildcard_placeholder() {
        let ndn = AlignmentScoring::ndn_default();
        let a = align_global(&ndn, b"NNNN", b"ACGT");
        assert_eq!(a.mutations.len(), 4);
        assert!(a.mutations.iter().all(|m| m.is_substitution()));
        assert_eq!(a.score, 4);
    }
}
