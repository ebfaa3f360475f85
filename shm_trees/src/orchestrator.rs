// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! Runs the steps over every [`VJBase`] and keeps each clone in one tree.
//!
//! Groups are processed in parallel. Between steps only snapshots are kept;
//! trees are rebuilt from them at the start of the next step.

use crate::clone::{CloneWrapper, CloneWrapperId, GeneLibrary, VJBase};
use crate::debug::{DebugRow, DebugWriter};
use crate::meta::{make_decision, DecisionInfo, Snapshot, TreeId, TreeIdGenerator};
use crate::params::{BuildShmTreeStep, ScoringSet, ShmTreeParameters};
use crate::processor::{GroupProcessor, StepResult};
use crate::report::BuildShmTreeReport;
use crate::result::ShmTree;
use anyhow::{ensure, Context, Result};
use log::{debug, info};
use rayon::prelude::*;
use shm_mutations::Mutations;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

/// Trees that survived every step, with counts of what happened.
#[derive(Debug)]
pub struct BuildResult {
    pub trees: Vec<ShmTree>,
    pub report: BuildShmTreeReport,
}

/// Clones a step placed under more than one [`VJBase`], to drop from every
/// group but the chosen one.
#[derive(Debug, Default)]
pub(crate) struct Conflicts {
    pub losers: HashMap<VJBase, HashSet<CloneWrapperId>>,
    pub reassigned: usize,
}

/// Pick one group for every clone placed under several.
pub(crate) fn resolve_conflicts<'r>(results: impl IntoIterator<Item = (&'r VJBase, &'r StepResult)>) -> Result<Conflicts> {
    let mut by_clone: BTreeMap<&CloneWrapperId, BTreeMap<VJBase, DecisionInfo>> = BTreeMap::new();
    for (vj_base, result) in results {
        for (clone, decision) in &result.decisions {
            by_clone
                .entry(clone)
                .or_default()
                .insert(vj_base.clone(), decision.clone());
        }
    }

    let mut conflicts = Conflicts::default();
    for (clone, candidates) in by_clone {
        if candidates.len() < 2 {
            continue;
        }
        let chosen = make_decision(&candidates).with_context(|| format!("can't choose a tree for clone {clone}"))?;
        debug!("clone {clone} stays in {chosen}");
        for vj_base in candidates.into_keys().filter(|b| *b != chosen) {
            conflicts.losers.entry(vj_base).or_default().insert(clone.clone());
        }
        conflicts.reassigned += 1;
    }
    Ok(conflicts)
}

pub struct ShmTreeBuilderOrchestrator<'a> {
    params: &'a ShmTreeParameters,
    scoring: Arc<ScoringSet>,
    library: &'a GeneLibrary,
    related_alleles: HashMap<String, Vec<Mutations>>,
    groups: BTreeMap<VJBase, Vec<Arc<CloneWrapper>>>,
    ids: TreeIdGenerator,
    debug_dir: Option<PathBuf>,
}

impl<'a> ShmTreeBuilderOrchestrator<'a> {
    pub fn new(
        params: &'a ShmTreeParameters,
        library: &'a GeneLibrary,
        groups: BTreeMap<VJBase, Vec<Arc<CloneWrapper>>>,
    ) -> Self {
        ShmTreeBuilderOrchestrator {
            params,
            scoring: Arc::new(params.scoring.clone()),
            library,
            related_alleles: library.related_allele_mutations(),
            groups,
            ids: TreeIdGenerator::default(),
            debug_dir: None,
        }
    }

    /// Write debug rows of every step into `dir`.
    pub fn with_debug_dir(mut self, dir: PathBuf) -> Self {
        self.debug_dir = Some(dir);
        self
    }

    fn processor(&self, vj_base: &VJBase) -> Result<GroupProcessor<'_>> {
        let clones = self
            .groups
            .get(vj_base)
            .with_context(|| format!("no clones for {vj_base}"))?;
        GroupProcessor::new(
            self.params,
            self.scoring.clone(),
            self.library,
            vj_base,
            clones.clone(),
            &self.related_alleles,
            &self.ids,
        )
    }

    fn initial_report(&self) -> BuildShmTreeReport {
        let clones: HashSet<&CloneWrapperId> = self.groups.values().flatten().map(|c| &c.id).collect();
        BuildShmTreeReport {
            input_clones: clones.len(),
            groups: self.groups.len(),
            ..Default::default()
        }
    }

    fn write_debug(&self, name: &str, rows: &[DebugRow]) -> Result<()> {
        let Some(dir) = &self.debug_dir else {
            return Ok(());
        };
        let mut writer = DebugWriter::create(&dir.join(name))?;
        writer.write_rows(rows)?;
        writer.finish()?;
        Ok(())
    }

    fn initial_trees(&self, vj_base: &VJBase) -> Result<StepResult> {
        self.processor(vj_base)?.build_initial_trees()
    }

    /// Restore the trees of a group, then apply `step`. Also returns the debug
    /// rows of the restored trees.
    fn next_step(
        &self,
        step: BuildShmTreeStep,
        vj_base: &VJBase,
        snapshots: &[Snapshot],
        in_trees: &HashSet<CloneWrapperId>,
    ) -> Result<(Vec<DebugRow>, StepResult)> {
        let processor = self.processor(vj_base)?;
        let trees = snapshots
            .iter()
            .map(|s| processor.restore(s))
            .collect::<Result<Vec<_>>>()?;
        let rows = processor.debug_rows(&trees);
        Ok((rows, processor.apply_step(step, trees, in_trees)?))
    }

    /// Run the configured steps and materialize the trees that are left.
    pub fn build_trees(&self) -> Result<BuildResult> {
        ensure!(
            self.params.steps.first() == Some(&BuildShmTreeStep::BuildingInitialTrees),
            "the first step must be {}",
            BuildShmTreeStep::BuildingInitialTrees
        );
        let mut report = self.initial_report();
        let mut snapshots: BTreeMap<VJBase, Vec<Snapshot>> = BTreeMap::new();
        let mut previous: Option<(usize, BuildShmTreeStep)> = None;

        for (index, &step) in self.params.steps.iter().enumerate() {
            let before: BTreeMap<TreeId, usize> = snapshots
                .values()
                .flatten()
                .map(|s| (s.tree_id.clone(), s.clones_count()))
                .collect();

            let results: Vec<(VJBase, Vec<DebugRow>, StepResult)> = if previous.is_none() {
                self.groups
                    .par_iter()
                    .map(|(vj_base, _)| -> Result<_> {
                        let result = self
                            .initial_trees(vj_base)
                            .with_context(|| format!("can't apply step {step} on {vj_base}"))?;
                        Ok((vj_base.clone(), Vec::new(), result))
                    })
                    .collect::<Result<_>>()?
            } else {
                let in_trees: HashSet<CloneWrapperId> = snapshots
                    .values()
                    .flatten()
                    .flat_map(|s| s.history.iter().cloned())
                    .collect();
                snapshots
                    .par_iter()
                    .map(|(vj_base, group)| -> Result<_> {
                        let (rows, result) = self
                            .next_step(step, vj_base, group, &in_trees)
                            .with_context(|| format!("can't apply step {step} on {vj_base}"))?;
                        Ok((vj_base.clone(), rows, result))
                    })
                    .collect::<Result<_>>()?
            };

            if let Some((previous_index, previous_step)) = previous {
                let rows: Vec<DebugRow> = results.iter().flat_map(|(_, rows, _)| rows.iter().cloned()).collect();
                self.write_debug(&after_decisions(previous_index, previous_step), &rows)?;
            }
            let rows: Vec<DebugRow> = results
                .iter()
                .flat_map(|(_, _, r)| r.debug_rows.iter().cloned())
                .collect();
            self.write_debug(&format!("{index:02}_{step}_before_decisions.csv"), &rows)?;

            let conflicts = resolve_conflicts(results.iter().map(|(b, _, r)| (b, r)))
                .with_context(|| format!("can't resolve decisions of step {step}"))?;
            let no_losers = HashSet::new();
            let mut combined = 0;
            snapshots.clear();
            for (vj_base, _, result) in results {
                combined += result.combined_trees;
                let losers = conflicts.losers.get(&vj_base).unwrap_or(&no_losers);
                let kept: Vec<Snapshot> = result
                    .snapshots
                    .iter()
                    .map(|s| s.exclude_clones(losers))
                    .filter(|s| s.clones_count() > 1)
                    .collect();
                if !kept.is_empty() {
                    snapshots.insert(vj_base, kept);
                }
            }

            let after: Vec<&Snapshot> = snapshots.values().flatten().collect();
            report.add_step(step, &before, &after, conflicts.reassigned, combined);
            info!(
                "{step}: {} trees with {} clones in {} groups, {} clones reassigned",
                after.len(),
                BuildShmTreeReport::distinct_clones(&after),
                snapshots.len(),
                conflicts.reassigned
            );
            previous = Some((index, step));
        }

        let restored: Vec<(Vec<DebugRow>, Vec<ShmTree>)> = snapshots
            .par_iter()
            .map(|(vj_base, group)| {
                self.materialize(vj_base, group)
                    .with_context(|| format!("can't restore trees of {vj_base}"))
            })
            .collect::<Result<_>>()?;
        if let Some((index, step)) = previous {
            let rows: Vec<DebugRow> = restored.iter().flat_map(|(rows, _)| rows.iter().cloned()).collect();
            self.write_debug(&after_decisions(index, step), &rows)?;
        }
        let trees = restored.into_iter().flat_map(|(_, trees)| trees).collect();
        Ok(self.finish(trees, report))
    }

    fn materialize(&self, vj_base: &VJBase, snapshots: &[Snapshot]) -> Result<(Vec<DebugRow>, Vec<ShmTree>)> {
        let processor = self.processor(vj_base)?;
        let trees = snapshots
            .iter()
            .map(|s| processor.restore(s))
            .collect::<Result<Vec<_>>>()?;
        let rows = processor.debug_rows(&trees);
        Ok((rows, trees.iter().map(ShmTree::from_builder).collect()))
    }

    /// One tree per group over all of its clones, skipping the search.
    pub fn build_single_trees(&self) -> Result<BuildResult> {
        let trees: Vec<Option<ShmTree>> = self
            .groups
            .par_iter()
            .map(|(vj_base, _)| -> Result<_> {
                let tree = self
                    .processor(vj_base)
                    .and_then(|p| p.build_tree_from_all_clones())
                    .with_context(|| format!("can't build a tree of all clones of {vj_base}"))?;
                Ok(tree.as_ref().map(ShmTree::from_builder))
            })
            .collect::<Result<_>>()?;
        info!("{} trees of all clones", trees.iter().flatten().count());
        Ok(self.finish(trees.into_iter().flatten().collect(), self.initial_report()))
    }

    fn finish(&self, trees: Vec<ShmTree>, mut report: BuildShmTreeReport) -> BuildResult {
        let trees: Vec<ShmTree> = trees
            .into_iter()
            .filter(|t| t.clones_count() >= self.params.hide_trees_less_than_size)
            .collect();
        report.trees_written = trees.len();
        report.clones_in_written_trees = trees.iter().map(ShmTree::clones_count).sum();
        BuildResult { trees, report }
    }
}

fn after_decisions(index: usize, step: BuildShmTreeStep) -> String {
    format!("{index:02}_{step}_after_decisions.csv")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clone::{group_by_vj_base, wrap_clones, CloneFilter, DatasetClone};
    use crate::fixtures::{self, JUNCTION};
    use pretty_assertions::assert_eq;

    const SHARED_0: &str = "SG0ASC2TSA6CSG8AST10ASC16TSA22G";
    const SHARED_1: &str = "SG0ASC2TSA6CSG8AST11CSC16TSA22G";
    const SHARED_2: &str = "SG0ASC2TSA6CSG8ASG12TSC16TSA22G";

    fn groups(clones: &[(&str, &str, &str)]) -> BTreeMap<VJBase, Vec<Arc<CloneWrapper>>> {
        let records = clones
            .iter()
            .enumerate()
            .map(|(i, (v, ndn, j))| DatasetClone {
                dataset: 0,
                record: fixtures::record(i as u32, v, ndn, j),
            })
            .collect();
        group_by_vj_base(wrap_clones(records, &fixtures::library(), &CloneFilter::default()).unwrap())
    }

    fn vj_base(v_gene: &str) -> VJBase {
        VJBase {
            v_gene: v_gene.to_string(),
            j_gene: "J1*01".to_string(),
            cdr3_length: 30,
        }
    }

    fn clone_id(clone: u32) -> CloneWrapperId {
        CloneWrapperId(vec![crate::clone::CloneId { dataset: 0, clone }])
    }

    fn zero_step(common_mutations_count: usize) -> DecisionInfo {
        DecisionInfo::ZeroStep {
            common_mutations_count,
            v_score: 100.0,
            j_score: 50.0,
        }
    }

    #[test]
    fn test_clone_stays_where_it_has_fewer_mutations() -> Result<()> {
        let a = vj_base("V1*01");
        let b = vj_base("V2*01");
        let c = clone_id(7);
        let tree_id = |vj_base: &VJBase| TreeId {
            vj_base: vj_base.clone(),
            number: 1,
        };
        let snapshot = |vj_base: &VJBase| Snapshot {
            history: vec![clone_id(1), c.clone(), clone_id(2)],
            root_info: Arc::new(crate::root::tests::root()),
            tree_id: tree_id(vj_base),
        };
        let in_a = StepResult {
            decisions: vec![(c.clone(), zero_step(3)), (clone_id(1), zero_step(6))],
            snapshots: vec![snapshot(&a)],
            ..Default::default()
        };
        let in_b = StepResult {
            decisions: vec![(c.clone(), zero_step(5))],
            snapshots: vec![snapshot(&b)],
            ..Default::default()
        };

        let conflicts = resolve_conflicts([(&a, &in_a), (&b, &in_b)])?;
        assert_eq!(conflicts.reassigned, 1);
        assert!(!conflicts.losers.contains_key(&a));
        assert_eq!(conflicts.losers[&b], HashSet::from([c.clone()]));

        let purged = in_b.snapshots[0].exclude_clones(&conflicts.losers[&b]);
        assert_eq!(purged.history, vec![clone_id(1), clone_id(2)]);
        Ok(())
    }

    #[test]
    fn test_mixed_decisions_are_an_error() {
        let a = vj_base("V1*01");
        let b = vj_base("V2*01");
        let in_a = StepResult {
            decisions: vec![(clone_id(1), zero_step(3))],
            ..Default::default()
        };
        let in_b = StepResult {
            decisions: vec![(clone_id(1), DecisionInfo::Metric { metric: 0.1 })],
            ..Default::default()
        };
        assert!(resolve_conflicts([(&a, &in_a), (&b, &in_b)]).is_err());
    }

    #[test]
    fn test_all_steps() -> Result<()> {
        let params = ShmTreeParameters::default();
        let library = fixtures::library();
        let groups = groups(&[
            (SHARED_0, JUNCTION, ""),
            (SHARED_1, JUNCTION, ""),
            (SHARED_2, JUNCTION, ""),
            ("", JUNCTION, ""),
        ]);
        let dir = tempfile::tempdir()?;
        let result = ShmTreeBuilderOrchestrator::new(&params, &library, groups)
            .with_debug_dir(dir.path().to_path_buf())
            .build_trees()?;

        assert_eq!(result.trees.len(), 1);
        assert!(result.trees[0].clones_count() >= 3);
        assert_eq!(result.trees[0].tree_id.number, 1);
        assert_eq!(result.report.input_clones, 4);
        assert_eq!(result.report.steps.len(), 4);
        assert_eq!(result.report.steps[0].trees_created, 1);
        assert_eq!(result.report.steps[0].clones_added, 3);
        assert_eq!(result.report.trees_written, 1);

        let mut files: Vec<String> = std::fs::read_dir(dir.path())?
            .map(|e| -> Result<String> { Ok(e?.file_name().to_string_lossy().into_owned()) })
            .collect::<Result<_>>()?;
        files.sort();
        assert_eq!(files.len(), 8);
        assert_eq!(files[0], "00_BuildingInitialTrees_after_decisions.csv");
        assert_eq!(files[7], "03_AttachClonesByNDN_before_decisions.csv");
        Ok(())
    }

    #[test]
    fn test_nothing_mutated_gives_no_trees() -> Result<()> {
        let params = ShmTreeParameters::default();
        let library = fixtures::library();
        let groups = groups(&[("", JUNCTION, ""), ("ST4G", JUNCTION, "")]);
        let result = ShmTreeBuilderOrchestrator::new(&params, &library, groups).build_trees()?;
        assert!(result.trees.is_empty());
        assert_eq!(result.report.steps.len(), 4);
        assert!(result.report.steps.iter().all(|s| s.trees == 0));
        Ok(())
    }

    #[test]
    fn test_single_trees() -> Result<()> {
        let params = ShmTreeParameters::default();
        let library = fixtures::library();
        let groups = groups(&[
            ("", "AGAGATCGGTATAGCAGC", ""),
            ("", "AGAGATCGGTATTGCAGC", ""),
            ("", "AGAGATCGGTATTGCTGC", ""),
        ]);
        let result = ShmTreeBuilderOrchestrator::new(&params, &library, groups).build_single_trees()?;
        assert_eq!(result.trees.len(), 1);
        assert_eq!(result.trees[0].clones_count(), 3);
        assert_eq!(result.report.clones_in_written_trees, 3);
        Ok(())
    }

    #[test]
    fn test_first_step_is_checked() {
        let params = ShmTreeParameters {
            steps: vec![BuildShmTreeStep::CombineTrees],
            ..Default::default()
        };
        let library = fixtures::library();
        let groups = groups(&[("", JUNCTION, "")]);
        assert!(ShmTreeBuilderOrchestrator::new(&params, &library, groups)
            .build_trees()
            .is_err());
    }
}
