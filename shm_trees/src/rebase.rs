// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! Re-expressing clones and tree nodes relative to a root.

use crate::clone::{CloneWrapper, VJBase};
use crate::description::MutationsDescription;
use crate::germline::MutationsFromGermline;
use crate::params::ScoringSet;
use crate::root::RootInfo;
use shm_mutations::{align_global, align_global_range, AlgebraError, Mutations, MutationsWithRange, SeqRange};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RebaseError {
    #[error("V and J parts in CDR3 intersect in {0}")]
    Overlap(VJBase),

    #[error("rebased CDR3 is not equal to the original one in {0}")]
    Cdr3Mismatch(VJBase),

    #[error(transparent)]
    Algebra(#[from] AlgebraError),
}

/// A clone described from the root of a tree.
#[derive(Debug, Clone)]
pub struct RebasedClone {
    pub mutations: MutationsDescription,
    pub from_germline: Arc<MutationsFromGermline>,
}

impl RebasedClone {
    pub fn clone_wrapper(&self) -> &Arc<CloneWrapper> {
        &self.from_germline.clone
    }
}

#[derive(Debug, Clone)]
pub struct ClonesRebase {
    scoring: Arc<ScoringSet>,
}

impl ClonesRebase {
    pub fn new(scoring: Arc<ScoringSet>) -> Self {
        ClonesRebase { scoring }
    }

    /// Describe a clone from `root`.
    ///
    /// V and J parts in CDR3 reuse the clone's own alignment when it covers the
    /// root range, and are aligned anew against the CDR3 otherwise. The junction
    /// is aligned against the root junction.
    pub fn rebase_clone(
        &self,
        root: &RootInfo,
        from_germline: &Arc<MutationsFromGermline>,
    ) -> Result<RebasedClone, RebaseError> {
        let cdr3 = &from_germline.cdr3;
        let root_v = root.v_range_in_cdr3;
        let root_j = root.j_range_in_cdr3;
        let realign_v = || {
            align_global_range(
                &self.scoring.v,
                &root.v_sequence,
                root_v,
                cdr3,
                SeqRange::new(0, root_v.len().min(cdr3.len())),
            )
            .mutations
        };
        let realign_j = || {
            align_global_range(
                &self.scoring.j,
                &root.j_sequence,
                root_j,
                cdr3,
                SeqRange::new(cdr3.len().saturating_sub(root_j.len()), cdr3.len()),
            )
            .mutations
        };

        let mut v = if root_v.len() > from_germline.v_own_range.len() {
            realign_v()
        } else {
            from_germline.v_own_in_cdr3.extract_absolute_mutations(root_v, false)
        };
        let mut j = if root_j.len() > from_germline.j_own_range.len() {
            realign_j()
        } else {
            from_germline.j_own_in_cdr3.extract_absolute_mutations(root_j, true)
        };

        let mut ndn_range = root.ndn_range_in_cdr3(cdr3.len(), v.length_delta(), j.length_delta());
        // insertions in V or J may leave no room for the junction
        if ndn_range.0 > ndn_range.1 {
            if v.length_delta() > 0 {
                v = realign_v();
            }
            if j.length_delta() > 0 {
                j = realign_j();
            }
            ndn_range = root.ndn_range_in_cdr3(cdr3.len(), v.length_delta(), j.length_delta());
        }
        let (lower, upper) = ndn_range;
        if lower > upper || lower < 0 || upper > cdr3.len() as isize {
            return Err(RebaseError::Overlap(root.vj_base.clone()));
        }
        let ndn = align_global(
            &self.scoring.ndn,
            &root.reconstructed_ndn,
            &cdr3[lower as usize..upper as usize],
        )
        .mutations;

        let mutations = root.describe(&from_germline.v_outside, &v, &ndn, &j, &from_germline.j_outside)?;
        if mutations.build_cdr3() != cdr3[..] {
            return Err(RebaseError::Cdr3Mismatch(root.vj_base.clone()));
        }
        Ok(RebasedClone {
            mutations,
            from_germline: from_germline.clone(),
        })
    }

    /// Describe a node given from `original` relative to `rebase_to`.
    ///
    /// Edits of the V and J parts both roots share are kept. The letters left
    /// between them are split in proportion to the remaining V range, the new
    /// junction and the remaining J range and each share is aligned to its part.
    pub fn rebase_mutations(
        &self,
        node: &MutationsDescription,
        original: &RootInfo,
        rebase_to: &RootInfo,
    ) -> Result<MutationsDescription, RebaseError> {
        let orig_v = original.v_range_in_cdr3;
        let orig_j = original.j_range_in_cdr3;
        let to_v = rebase_to.v_range_in_cdr3;
        let to_j = rebase_to.j_range_in_cdr3;
        let node_v = node.v_in_cdr3.mutations();
        let node_j = node.j_in_cdr3.mutations();

        let common_v = SeqRange::new(orig_v.lower, orig_v.upper.min(to_v.upper));
        let common_j = SeqRange::new(orig_j.lower.max(to_j.lower), to_j.upper);
        let v_left = SeqRange::new(common_v.upper, orig_v.upper.max(common_v.upper));
        let j_left = SeqRange::new(orig_j.lower.min(common_j.lower), common_j.lower);

        let mut to_align = built(&original.v_sequence, node_v, v_left, false);
        to_align.extend_from_slice(node.ndn.build_sequence());
        to_align.extend(built(&original.j_sequence, node_j, j_left, true));

        let v_to_align = SeqRange::new(common_v.upper, to_v.upper);
        let j_to_align = SeqRange::new(to_j.lower, common_j.lower);
        let denominator = v_to_align.len() + rebase_to.reconstructed_ndn.len() + j_to_align.len();
        let part = if denominator == 0 {
            0.0
        } else {
            to_align.len() as f64 / denominator as f64
        };
        let v_upper = ((v_to_align.len() as f64 * part).floor() as usize).min(to_align.len());
        let j_lower = ((to_align.len() as f64 - j_to_align.len() as f64 * part).floor().max(0.0) as usize)
            .clamp(v_upper, to_align.len());
        let v_part = SeqRange::new(0, v_upper);
        let j_part = SeqRange::new(j_lower, to_align.len());
        let ndn_part = SeqRange::new(v_upper, j_lower);

        let v_add = align_global_range(&self.scoring.v, &rebase_to.v_sequence, v_to_align, &to_align, v_part);
        let j_add = align_global_range(&self.scoring.j, &rebase_to.j_sequence, j_to_align, &to_align, j_part);
        let ndn = align_global_range(
            &self.scoring.ndn,
            &rebase_to.reconstructed_ndn,
            SeqRange::new(0, rebase_to.reconstructed_ndn.len()),
            &to_align,
            ndn_part,
        );

        let v = node_v
            .extract_absolute_mutations(common_v, false)
            .concat(&v_add.mutations);
        // with nothing aligned before it the J part keeps its leading insertions
        let j = j_add
            .mutations
            .concat(&node_j.extract_absolute_mutations(common_j, j_to_align.is_empty()));
        let outside = |parts: &[MutationsWithRange]| -> Vec<Mutations> {
            parts.iter().map(|p| p.mutations().clone()).collect()
        };
        let result = rebase_to.describe(
            &outside(&node.v_outside),
            &v,
            &ndn.mutations,
            &j,
            &outside(&node.j_outside),
        )?;
        if result.build_cdr3() != node.build_cdr3() {
            return Err(RebaseError::Cdr3Mismatch(rebase_to.vj_base.clone()));
        }
        Ok(result)
    }
}

fn built(sequence: &Arc<[u8]>, mutations: &Mutations, range: SeqRange, include_first_inserts: bool) -> Vec<u8> {
    MutationsWithRange::new(sequence.clone(), mutations, range, include_first_inserts)
        .build_sequence()
        .to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, JUNCTION};
    use pretty_assertions::assert_eq;

    fn rebase() -> ClonesRebase {
        ClonesRebase::new(Arc::new(ScoringSet::default()))
    }

    #[test]
    fn test_rebase_clone_keeps_cdr3() {
        let group = fixtures::group(&[("ST4G", JUNCTION, "")]);
        let clone = group.from_germline(0);
        let root = group.root_of(&[0]);
        let rebased = rebase().rebase_clone(&root, &clone).unwrap();
        assert_eq!(rebased.mutations.build_cdr3(), clone.cdr3.to_vec());
        assert_eq!(rebased.mutations.ndn_sequence(), JUNCTION.as_bytes());
        assert_eq!(rebased.mutations.v_outside[0].mutations().to_string(), "ST4G");
    }

    #[test]
    fn test_rebase_onto_same_root_is_identity() {
        let group = fixtures::group(&[("ST4GSC28A", JUNCTION, "SG13T")]);
        let clone = group.from_germline(0);
        let root = group.root_of(&[0]);
        let rebase = rebase();
        let rebased = rebase.rebase_clone(&root, &clone).unwrap();
        let again = rebase.rebase_mutations(&rebased.mutations, &root, &root).unwrap();
        assert_eq!(again, rebased.mutations);
        let twice = rebase.rebase_clone(&root, &clone).unwrap();
        assert_eq!(twice.mutations, rebased.mutations);
    }

    #[test]
    fn test_rebase_onto_shorter_v_part() {
        let group = fixtures::group(&[("SC28A", JUNCTION, "")]);
        let clone = group.from_germline(0);
        let root = group.root_of(&[0]);
        let rebase = rebase();
        let rebased = rebase.rebase_clone(&root, &clone).unwrap();
        let shorter = RootInfo {
            v_range_in_cdr3: SeqRange::new(24, 27),
            reconstructed_ndn: b"NNNNNNNNNNNNNNNNNNNNN".to_vec().into(),
            ..root.clone()
        };
        let moved = rebase.rebase_mutations(&rebased.mutations, &root, &shorter).unwrap();
        assert_eq!(moved.build_cdr3(), clone.cdr3.to_vec());
        assert_eq!(moved.v_in_cdr3.range(), SeqRange::new(24, 27));
        assert_eq!(moved.ndn.range().len(), 21);
    }

    #[test]
    fn test_overlapping_parts() {
        let group = fixtures::group(&[("", JUNCTION, "")]);
        let clone = group.from_germline(0);
        let root = RootInfo {
            v_range_in_cdr3: SeqRange::new(14, 30),
            j_range_in_cdr3: SeqRange::new(0, 16),
            ..group.root_of(&[0])
        };
        assert!(matches!(
            rebase().rebase_clone(&root, &clone),
            Err(RebaseError::Overlap(_))
        ));
    }
}
