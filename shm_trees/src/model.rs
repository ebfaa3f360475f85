// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! Node states of lineage trees and the distance between them.

use crate::builder::AncestorModel;
use crate::description::{MutationsDescription, Penalty};
use crate::params::{ScoringSet, ShmTreeParameters};
use crate::rebase::RebasedClone;
use anyhow::Result;
use shm_mutations::MutationsWithRange;
use std::sync::Arc;

/// A reconstructed node: its edits from the root of the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticNode {
    pub from_root: MutationsDescription,
}

/// Distances between descriptions over one root.
///
/// An edge costs the score lost against a perfect match per letter, the
/// junction weighted by `ndn_score_multiplier`, plus a fixed penalty for every
/// edit that undoes an edit the parent made from the root.
#[derive(Debug, Clone)]
pub struct ShmModel {
    scoring: Arc<ScoringSet>,
    ndn_score_multiplier: f64,
    penalty_for_reversed_mutations: f64,
}

impl ShmModel {
    pub fn new(params: &ShmTreeParameters, scoring: Arc<ScoringSet>) -> Self {
        ShmModel {
            scoring,
            ndn_score_multiplier: params.ndn_score_multiplier,
            penalty_for_reversed_mutations: params.penalty_for_reversed_mutations,
        }
    }

    pub fn scoring(&self) -> &Arc<ScoringSet> {
        &self.scoring
    }

    /// Distance without the penalty for reversed edits.
    pub fn plain_distance(&self, difference: &MutationsDescription) -> f64 {
        Penalty::of(difference, &self.scoring).normalized(self.ndn_score_multiplier)
    }
}

/// Edits of `parent` undone by `difference`. The difference is based on the
/// built part, so its positions are shifted to the germline first.
fn reversed_count(parent: &MutationsWithRange, difference: &MutationsWithRange) -> usize {
    let reverting = difference
        .mutations()
        .move_by(parent.range().lower as isize)
        .invert();
    parent.mutations().intersection_count(&reverting)
}

fn reversed_mutations_count(parent: &MutationsDescription, difference: &MutationsDescription) -> usize {
    parent
        .v_parts()
        .zip(difference.v_parts())
        .chain(parent.j_parts().zip(difference.j_parts()))
        .map(|(p, d)| reversed_count(p, d))
        .sum()
}

impl AncestorModel for ShmModel {
    type Observed = RebasedClone;
    type Ancestor = SyntheticNode;
    type Mutations = MutationsDescription;

    fn distance(&self, from: &SyntheticNode, mutations: &MutationsDescription) -> Result<f64> {
        let reversed = reversed_mutations_count(&from.from_root, mutations);
        Ok(self.plain_distance(mutations) + self.penalty_for_reversed_mutations * reversed as f64)
    }

    fn mutations_between(&self, first: &SyntheticNode, second: &SyntheticNode) -> Result<MutationsDescription> {
        Ok(first.from_root.difference_with(&second.from_root)?)
    }

    fn mutate(&self, parent: &SyntheticNode, mutations: &MutationsDescription) -> Result<SyntheticNode> {
        Ok(SyntheticNode {
            from_root: parent.from_root.combine_with(mutations)?,
        })
    }

    fn as_ancestor(&self, observed: &RebasedClone) -> SyntheticNode {
        SyntheticNode {
            from_root: observed.mutations.clone(),
        }
    }

    fn find_common_mutations(
        &self,
        first: &MutationsDescription,
        second: &MutationsDescription,
    ) -> Result<MutationsDescription> {
        Ok(first.common_mutations(second)?)
    }

    fn postprocess_descendant(&self, parent: &SyntheticNode, child: &SyntheticNode) -> Result<SyntheticNode> {
        Ok(SyntheticNode {
            from_root: child.from_root.with_concrete_ndn(&parent.from_root),
        })
    }
}
