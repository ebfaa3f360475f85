// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! Tunable parameters of the tree search, read from TOML.

use anyhow::{ensure, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use shm_clustering::ClusteringAlgorithm;
use shm_mutations::AlignmentScoring;
use std::fmt;
use std::path::Path;

/// Stages of the search, in the order they may be run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildShmTreeStep {
    /// Cluster strongly mutated clones and build a tree per cluster.
    BuildingInitialTrees,
    /// Add mutated clones where they widen a tree the least.
    AttachClonesByDistanceChange,
    CombineTrees,
    /// Add lightly mutated clones by junction similarity.
    AttachClonesByNDN,
}

impl fmt::Display for BuildShmTreeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Scoring of the V gene, the J gene and the junction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScoringSet {
    pub v: AlignmentScoring,
    pub j: AlignmentScoring,
    pub ndn: AlignmentScoring,
}

impl Default for ScoringSet {
    fn default() -> Self {
        ScoringSet {
            v: AlignmentScoring::germline_default(),
            j: AlignmentScoring::germline_default(),
            ndn: AlignmentScoring::ndn_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShmTreeParameters {
    /// Skip clones with an out of frame CDR3 or a stop codon in it.
    pub productive_only: bool,
    /// Number of least mutated clones of a cluster voting on the root CDR3 ranges.
    pub top_to_vote_on_ndn_size: usize,
    /// Added to the distance for every edit that undoes an edit of the parent.
    pub penalty_for_reversed_mutations: f64,
    /// Maximal ratio of the added distance to the distance from the root for a
    /// clone attached by distance change.
    pub threshold_for_free_clones: f64,
    /// Maximal junction distance to the most recent common ancestor for a clone
    /// attached by junction similarity.
    pub threshold_for_combine_by_ndn: f64,
    pub threshold_for_combine_trees: f64,
    /// Trees with fewer clones are not written out.
    pub hide_trees_less_than_size: usize,
    /// Minimal count of shared V and J edits for two clones to be clustered
    /// together; clones with fewer edits from germline are left for the
    /// junction step.
    pub common_mutations_count_for_clustering: usize,
    pub max_ndn_distance_for_clustering: f64,
    /// Maximal junction distance from a free clone to its parent when the clone
    /// is attached by distance change.
    pub max_ndn_distance_for_free_clones: f64,
    /// Breadth of the search for the insertion point of a new clone.
    pub count_of_nodes_to_probe: usize,
    /// Weight of junction penalties relative to V and J penalties.
    pub ndn_score_multiplier: f64,
    pub min_portion_of_clones_for_common_alignment_ranges: f64,
    /// Trees whose root junction is not longer than this are flagged public.
    pub ndn_size_limit_for_public_clones: usize,
    pub clustering_algorithm: ClusteringAlgorithm,
    pub steps: Vec<BuildShmTreeStep>,
    pub scoring: ScoringSet,
}

impl Default for ShmTreeParameters {
    fn default() -> Self {
        ShmTreeParameters {
            productive_only: true,
            top_to_vote_on_ndn_size: 5,
            penalty_for_reversed_mutations: 12.0,
            threshold_for_free_clones: 0.2,
            threshold_for_combine_by_ndn: 1.5,
            threshold_for_combine_trees: 1.0,
            hide_trees_less_than_size: 1,
            common_mutations_count_for_clustering: 5,
            max_ndn_distance_for_clustering: 1.5,
            max_ndn_distance_for_free_clones: 1.0,
            count_of_nodes_to_probe: 25,
            ndn_score_multiplier: 2.0,
            min_portion_of_clones_for_common_alignment_ranges: 0.8,
            ndn_size_limit_for_public_clones: 5,
            clustering_algorithm: ClusteringAlgorithm::BronKerbosch,
            steps: vec![
                BuildShmTreeStep::BuildingInitialTrees,
                BuildShmTreeStep::AttachClonesByDistanceChange,
                BuildShmTreeStep::CombineTrees,
                BuildShmTreeStep::AttachClonesByNDN,
            ],
            scoring: ScoringSet::default(),
        }
    }
}

macro_rules! warn_non_default {
    ($params:expr, $defaults:expr, $($field:ident),+ $(,)?) => {
        $(
            if $defaults.$field != $params.$field {
                warn!("using non-default {} = {:?}", stringify!($field), $params.$field);
            }
        )+
    };
}

impl ShmTreeParameters {
    /// Read parameters from a TOML file; missing fields take their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| path.display().to_string())?;
        let params: ShmTreeParameters = toml::from_str(&s).with_context(|| path.display().to_string())?;
        params.validate().with_context(|| path.display().to_string())?;
        params.warn_non_default();
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.steps.is_empty(), "no steps to run");
        ensure!(
            self.steps[0] == BuildShmTreeStep::BuildingInitialTrees,
            "steps must start with {}, got {}",
            BuildShmTreeStep::BuildingInitialTrees,
            self.steps[0]
        );
        ensure!(
            !self.steps[1..].contains(&BuildShmTreeStep::BuildingInitialTrees),
            "{} may only be the first step",
            BuildShmTreeStep::BuildingInitialTrees
        );
        for (name, value) in [
            ("max_ndn_distance_for_clustering", self.max_ndn_distance_for_clustering),
            ("max_ndn_distance_for_free_clones", self.max_ndn_distance_for_free_clones),
        ] {
            ensure!(value.is_finite() && value >= 0.0, "{name} must be a non-negative number, got {value}");
        }
        ensure!(self.count_of_nodes_to_probe > 0, "count_of_nodes_to_probe must be positive");
        ensure!(self.top_to_vote_on_ndn_size > 0, "top_to_vote_on_ndn_size must be positive");
        ensure!(
            self.min_portion_of_clones_for_common_alignment_ranges >= 0.5
                && self.min_portion_of_clones_for_common_alignment_ranges <= 1.0,
            "min_portion_of_clones_for_common_alignment_ranges must be within [0.5, 1], got {}",
            self.min_portion_of_clones_for_common_alignment_ranges
        );
        Ok(())
    }

    fn warn_non_default(&self) {
        let defaults = ShmTreeParameters::default();
        warn_non_default!(
            self,
            defaults,
            productive_only,
            top_to_vote_on_ndn_size,
            penalty_for_reversed_mutations,
            threshold_for_free_clones,
            threshold_for_combine_by_ndn,
            threshold_for_combine_trees,
            hide_trees_less_than_size,
            common_mutations_count_for_clustering,
            max_ndn_distance_for_clustering,
            max_ndn_distance_for_free_clones,
            count_of_nodes_to_probe,
            ndn_score_multiplier,
            min_portion_of_clones_for_common_alignment_ranges,
            ndn_size_limit_for_public_clones,
            clustering_algorithm,
            steps,
            scoring,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let params = ShmTreeParameters::default();
        params.validate().unwrap();
        assert_eq!(params.scoring.v.config().mismatch, -9);
        assert_eq!(params.scoring.ndn.config().wildcard_multiplier, 4);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
count_of_nodes_to_probe = 10
steps = ["BuildingInitialTrees", "CombineTrees"]

[scoring.ndn]
match_score = 5
mismatch = -4
gap_open = -10
gap_extend = -1
"#
        )
        .unwrap();
        let params = ShmTreeParameters::from_toml_file(file.path()).unwrap();
        assert_eq!(params.count_of_nodes_to_probe, 10);
        assert_eq!(
            params.steps,
            vec![BuildShmTreeStep::BuildingInitialTrees, BuildShmTreeStep::CombineTrees]
        );
        assert_eq!(params.threshold_for_free_clones, 0.2);
        assert_eq!(params.scoring.ndn.config().wildcard_multiplier, 1);
        assert_eq!(params.scoring.v, AlignmentScoring::germline_default());
    }

    #[test]
    fn test_invalid_parameters() {
        let mut params = ShmTreeParameters {
            steps: vec![],
            ..ShmTreeParameters::default()
        };
        assert!(params.validate().is_err());
        params.steps = vec![BuildShmTreeStep::CombineTrees];
        assert!(params.validate().is_err());
        params.steps = vec![BuildShmTreeStep::BuildingInitialTrees];
        params.count_of_nodes_to_probe = 0;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_ndn_thresholds_are_separate() {
        let params: ShmTreeParameters = toml::from_str("max_ndn_distance_for_free_clones = 0.25").unwrap();
        params.validate().unwrap();
        assert_eq!(params.max_ndn_distance_for_free_clones, 0.25);
        assert_eq!(params.max_ndn_distance_for_clustering, 1.5);
        let negative = ShmTreeParameters {
            max_ndn_distance_for_free_clones: -1.0,
            ..ShmTreeParameters::default()
        };
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        assert!(toml::from_str::<ShmTreeParameters>("no_such_field = 1").is_err());
    }
}
