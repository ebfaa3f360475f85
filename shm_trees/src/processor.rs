// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! The steps of the tree search applied to the clones of one [`VJBase`].

use crate::clone::{CloneWrapper, CloneWrapperId, GeneLibrary, GeneType, VJBase};
use crate::debug::DebugRow;
use crate::germline::{GroupInfo, MutationsFromGermline};
use crate::meta::{DecisionInfo, ShmAction, ShmContent, Snapshot, TreeId, TreeIdGenerator, TreeWithMetaBuilder};
use crate::model::ShmModel;
use crate::params::{BuildShmTreeStep, ScoringSet, ShmTreeParameters};
use crate::rebase::{ClonesRebase, RebaseError, RebasedClone};
use crate::root::RootInfo;
use crate::tree::NodeWithParent;
use anyhow::{bail, Context, Result};
use itertools::Itertools;
use log::debug;
use shm_clustering::ClusterPredictor;
use shm_mutations::ndn::ndn_distance;
use shm_mutations::{nucleotide, AlignmentScoring, Mutations, MutationsWithRange, SeqRange};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Output of one step for one [`VJBase`].
#[derive(Debug, Default)]
pub struct StepResult {
    pub decisions: Vec<(CloneWrapperId, DecisionInfo)>,
    pub snapshots: Vec<Snapshot>,
    pub debug_rows: Vec<DebugRow>,
    /// Trees merged into others by the step.
    pub combined_trees: usize,
}

/// The germline ranges a root is built over: the V and J parts in CDR3 are
/// voted on by the least mutated clones, each clone voting for the parts it
/// aligned itself. The most voted part wins, the shorter one on equal votes.
/// Parts that would overlap fall back to the shortest parts of the group.
///
/// The root junction is the per position consensus of the voters' CDR3 letters
/// between the voted parts; letters tied on votes merge into a wildcard.
pub(crate) fn build_root_info(
    group: &GroupInfo,
    cluster: &[Arc<MutationsFromGermline>],
    top_to_vote: usize,
) -> Result<RootInfo> {
    let voters: Vec<&Arc<MutationsFromGermline>> = cluster
        .iter()
        .sorted_by_key(|c| c.vj_mutations_count())
        .take(top_to_vote)
        .collect();
    if voters.is_empty() {
        bail!("can't build a root of {} without clones", group.vj_base);
    }
    let mut v_range = most_likely_range(voters.iter().map(|c| c.v_own_range));
    let mut j_range = most_likely_range(voters.iter().map(|c| c.j_own_range));
    let cdr3_length = group.vj_base.cdr3_length;
    if v_range.len() + j_range.len() > cdr3_length {
        v_range = group.v_range_in_cdr3;
        j_range = group.j_range_in_cdr3;
    }
    let ndn_length = cdr3_length.saturating_sub(v_range.len() + j_range.len());
    let ndn_start = v_range.len().min(cdr3_length);
    let reconstructed_ndn = consensus_ndn(
        voters
            .iter()
            .filter_map(|c| c.cdr3.get(ndn_start..ndn_start + ndn_length)),
        ndn_length,
    );
    Ok(RootInfo {
        vj_base: group.vj_base.clone(),
        v_sequence: group.v_sequence.clone(),
        v_ranges: group.v_ranges.ranges().to_vec(),
        v_range_in_cdr3: v_range,
        reconstructed_ndn: reconstructed_ndn.into(),
        j_range_in_cdr3: j_range,
        j_sequence: group.j_sequence.clone(),
        j_ranges: group.j_ranges.ranges().to_vec(),
    })
}

/// Most frequent letter at every position of `junctions`; `N` where no
/// junction has a letter.
fn consensus_ndn<'a>(junctions: impl Iterator<Item = &'a [u8]>, length: usize) -> Vec<u8> {
    let mut votes = vec![BTreeMap::<u8, usize>::new(); length];
    for junction in junctions {
        for (position, &letter) in junction.iter().enumerate().take(length) {
            if nucleotide::is_nucleotide(letter) {
                *votes[position].entry(letter.to_ascii_uppercase()).or_default() += 1;
            }
        }
    }
    votes
        .into_iter()
        .map(|letters| {
            let best = letters.values().copied().max().unwrap_or(0);
            letters
                .into_iter()
                .filter(|&(_, count)| count == best)
                .map(|(letter, _)| letter)
                .reduce(nucleotide::union)
                .unwrap_or(nucleotide::N)
        })
        .collect()
}

fn most_likely_range(ranges: impl Iterator<Item = SeqRange>) -> SeqRange {
    let mut votes: BTreeMap<SeqRange, usize> = BTreeMap::new();
    for range in ranges {
        *votes.entry(range).or_default() += 1;
    }
    let mut best: Option<(SeqRange, usize)> = None;
    for (range, count) in votes {
        let better = match best {
            None => true,
            Some((b, c)) => count > c || (count == c && range.len() < b.len()),
        };
        if better {
            best = Some((range, count));
        }
    }
    best.map(|(r, _)| r).unwrap_or_default()
}

/// Clones cluster together when they share enough V and J edits that no allele
/// explains and their junctions are alike. Clones whose junctions span the same
/// CDR3 positions are preferred.
struct CommonMutationsPredictor<'a> {
    group: &'a GroupInfo,
    ndn_scoring: &'a AlignmentScoring,
    min_common_mutations: usize,
    max_ndn_distance: f64,
}

impl ClusterPredictor<Arc<MutationsFromGermline>> for CommonMutationsPredictor<'_> {
    fn prefer(&self, first: &Arc<MutationsFromGermline>, second: &Arc<MutationsFromGermline>) -> bool {
        let range = first.ndn_range_in_cdr3();
        !range.is_reversed() && range == second.ndn_range_in_cdr3()
    }

    fn from_the_same_cluster(&self, first: &Arc<MutationsFromGermline>, second: &Arc<MutationsFromGermline>) -> bool {
        self.group.common_mutations_count(first, second) >= self.min_common_mutations
            && ndn_distance(self.ndn_scoring, &first.known_ndn, &second.known_ndn) <= self.max_ndn_distance
    }
}

/// Runs the steps over the clones of one [`VJBase`].
pub struct GroupProcessor<'a> {
    params: &'a ShmTreeParameters,
    scoring: Arc<ScoringSet>,
    group: GroupInfo,
    clones: Vec<Arc<CloneWrapper>>,
    ids: &'a TreeIdGenerator,
}

impl<'a> GroupProcessor<'a> {
    pub fn new(
        params: &'a ShmTreeParameters,
        scoring: Arc<ScoringSet>,
        library: &GeneLibrary,
        vj_base: &VJBase,
        clones: Vec<Arc<CloneWrapper>>,
        related_alleles: &HashMap<String, Vec<Mutations>>,
        ids: &'a TreeIdGenerator,
    ) -> Result<Self> {
        let group = GroupInfo::new(
            library,
            vj_base,
            &clones,
            params.min_portion_of_clones_for_common_alignment_ranges,
            related_alleles,
        )?;
        Ok(GroupProcessor {
            params,
            scoring,
            group,
            clones,
            ids,
        })
    }

    pub fn vj_base(&self) -> &VJBase {
        &self.group.vj_base
    }

    fn rebase_from_germline<'c>(
        &self,
        clones: impl IntoIterator<Item = &'c Arc<CloneWrapper>>,
    ) -> Vec<Arc<MutationsFromGermline>> {
        clones
            .into_iter()
            .filter_map(|c| self.group.rebase_from_germline(c))
            .map(Arc::new)
            .collect()
    }

    fn model(&self) -> ShmModel {
        ShmModel::new(self.params, self.scoring.clone())
    }

    fn rebase(&self) -> ClonesRebase {
        ClonesRebase::new(self.scoring.clone())
    }

    /// Cluster clones far from every germline and build a tree per cluster.
    pub fn build_initial_trees(&self) -> Result<StepResult> {
        let threshold = self.params.common_mutations_count_for_clustering;
        let candidates =
            self.rebase_from_germline(self.clones.iter().filter(|c| !c.close_to_any_germline(threshold)));
        let predictor = CommonMutationsPredictor {
            group: &self.group,
            ndn_scoring: &self.scoring.ndn,
            min_common_mutations: threshold,
            max_ndn_distance: self.params.max_ndn_distance_for_clustering,
        };
        let clusters = self
            .params
            .clustering_algorithm
            .build_clusters(&predictor, &candidates);

        let mut decisions = Vec::new();
        let mut trees = Vec::new();
        for cluster in clusters {
            let members: Vec<Arc<MutationsFromGermline>> = cluster.iter().map(|&i| candidates[i].clone()).collect();
            // the same clone seen with another constant region or in another dataset
            let first_targets = members[0].clone.targets();
            if members[1..].iter().all(|m| m.clone.targets() == first_targets) {
                continue;
            }
            let tree = self.build_a_tree(&members, None)?;
            for member in &members {
                let parent = tree.effective_parent(&member.clone.id)?;
                decisions.push((
                    member.clone.id.clone(),
                    DecisionInfo::ZeroStep {
                        common_mutations_count: parent.from_root.vj_mutations_count(),
                        v_score: member.clone.hit(GeneType::Variable).score,
                        j_score: member.clone.hit(GeneType::Joining).score,
                    },
                ));
            }
            trees.push(tree);
        }
        debug!(
            "{}: {} candidates, {} initial trees",
            self.group.vj_base,
            candidates.len(),
            trees.len()
        );
        Ok(self.step_result(decisions, &trees, 0))
    }

    /// Apply a step after the first one to trees restored from snapshots.
    /// `in_trees` holds every clone already placed, under any [`VJBase`].
    pub fn apply_step(
        &self,
        step: BuildShmTreeStep,
        trees: Vec<TreeWithMetaBuilder>,
        in_trees: &HashSet<CloneWrapperId>,
    ) -> Result<StepResult> {
        let free = || self.rebase_from_germline(self.clones.iter().filter(|c| !in_trees.contains(&c.id)));
        match step {
            BuildShmTreeStep::BuildingInitialTrees => bail!("{step} is only run first"),
            BuildShmTreeStep::AttachClonesByDistanceChange => self.attach_clones_by_distance_change(trees, free()),
            BuildShmTreeStep::CombineTrees => self.combine_trees(trees),
            BuildShmTreeStep::AttachClonesByNDN => self.attach_clones_by_ndn(trees, free()),
        }
    }

    /// Rebuild a tree from its snapshot, keeping its id.
    pub fn restore(&self, snapshot: &Snapshot) -> Result<TreeWithMetaBuilder> {
        let in_tree: HashSet<&CloneWrapperId> = snapshot.history.iter().collect();
        let members = self.rebase_from_germline(self.clones.iter().filter(|c| in_tree.contains(&c.id)));
        self.build_a_tree(&members, Some(snapshot.tree_id.clone()))
            .with_context(|| format!("can't restore tree {}", snapshot.tree_id))
    }

    /// One tree over every clone of the group, without clustering. `None` when
    /// no clone covers the common alignment ranges.
    pub fn build_tree_from_all_clones(&self) -> Result<Option<TreeWithMetaBuilder>> {
        let members = self.rebase_from_germline(&self.clones);
        if members.is_empty() {
            return Ok(None);
        }
        self.build_a_tree(&members, None).map(Some)
    }

    /// Build a tree over a root voted by `members`, adding the most mutated
    /// clones first and the farthest from the root among equally mutated ones.
    fn build_a_tree(&self, members: &[Arc<MutationsFromGermline>], tree_id: Option<TreeId>) -> Result<TreeWithMetaBuilder> {
        let root_info = Arc::new(build_root_info(
            &self.group,
            members,
            self.params.top_to_vote_on_ndn_size,
        )?);
        let rebase = self.rebase();
        let rebased = members
            .iter()
            .map(|m| rebase.rebase_clone(&root_info, m))
            .collect::<Result<Vec<_>, _>>()?;
        let model = self.model();
        let mut ordered: Vec<(i32, f64, RebasedClone)> = rebased
            .into_iter()
            .map(|r| (r.mutations.score(&self.scoring), model.plain_distance(&r.mutations), r))
            .collect();
        // farther from the root first on equal scores
        ordered.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.total_cmp(&a.1)));

        let tree_id = tree_id.unwrap_or_else(|| self.ids.next(&self.group.vj_base));
        let mut tree = TreeWithMetaBuilder::new(
            model,
            root_info,
            rebase,
            self.params.count_of_nodes_to_probe,
            tree_id,
        );
        for (_, _, clone) in ordered {
            tree.add_clone(clone)?;
        }
        Ok(tree)
    }

    /// `None` when the clone can't be laid over the root of the tree.
    fn try_rebase(&self, tree: &TreeWithMetaBuilder, clone: &Arc<MutationsFromGermline>) -> Result<Option<RebasedClone>> {
        match tree.rebase_clone(clone) {
            Ok(rebased) => Ok(Some(rebased)),
            Err(RebaseError::Overlap(_)) => {
                debug!("clone {} does not fit the root of tree {}", clone.clone.id, tree.tree_id());
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Offer every mutated free clone, most mutated first, to the tree where it
    /// adds the least length. The clone is added when the added length is small
    /// compared to its distance from the root.
    fn attach_clones_by_distance_change(
        &self,
        mut trees: Vec<TreeWithMetaBuilder>,
        mut free: Vec<Arc<MutationsFromGermline>>,
    ) -> Result<StepResult> {
        free.sort_by_key(|c| Reverse(c.vj_mutations_count()));
        let mut decisions = Vec::new();
        for clone in free
            .iter()
            .filter(|c| c.vj_mutations_count() >= self.params.common_mutations_count_for_clustering)
        {
            let mut best: Option<(usize, ShmAction, f64)> = None;
            for (i, tree) in trees.iter().enumerate() {
                let Some(rebased) = self.try_rebase(tree, clone)? else {
                    continue;
                };
                let action = tree.best_action(&rebased)?;
                let parent_ndn = action
                    .parent_content()
                    .map(|p| p.from_root.ndn_sequence())
                    .unwrap_or_default();
                let ndn = ndn_distance(&self.scoring.ndn, parent_ndn, rebased.mutations.ndn_sequence());
                if ndn > self.params.max_ndn_distance_for_free_clones {
                    continue;
                }
                let distance_from_root = tree.distance_from_root_to_clone(&rebased)?;
                if best
                    .as_ref()
                    .map_or(true, |(_, b, _)| action.change_of_distance() < b.change_of_distance())
                {
                    best = Some((i, action, distance_from_root));
                }
            }
            let Some((i, action, distance_from_root)) = best else {
                continue;
            };
            let metric = action.change_of_distance() / distance_from_root;
            if metric <= self.params.threshold_for_free_clones {
                trees[i].apply(action)?;
                decisions.push((clone.clone.id.clone(), DecisionInfo::Metric { metric }));
            }
        }
        Ok(self.step_result(decisions, &trees, 0))
    }

    /// Merge trees whose most recent common ancestors are close, growing the
    /// largest trees first with the smallest ones first.
    fn combine_trees(&self, mut trees: Vec<TreeWithMetaBuilder>) -> Result<StepResult> {
        trees.sort_by_key(|t| Reverse(t.clones_count()));
        let mut result = Vec::new();
        let mut combined = 0;
        while !trees.is_empty() {
            let mut to_grow = trees.remove(0);
            for i in (0..trees.len()).rev() {
                let to_attach = &trees[i];
                let metric = self
                    .distance_between_trees(to_attach, &to_grow)?
                    .min(self.distance_between_trees(&to_grow, to_attach)?);
                if metric > self.params.threshold_for_combine_trees {
                    continue;
                }
                let attached = trees.remove(i);
                let members: Vec<Arc<MutationsFromGermline>> = to_grow
                    .observed_clones()
                    .into_iter()
                    .chain(attached.observed_clones())
                    .map(|c| c.from_germline.clone())
                    .collect();
                debug!("combining {} into {}", attached.tree_id(), to_grow.tree_id());
                to_grow = self.build_a_tree(&members, None)?;
                combined += 1;
            }
            result.push(to_grow);
        }
        Ok(self.step_result(Vec::new(), &result, combined))
    }

    /// Distance from the common ancestor of `from` to the common ancestor of
    /// `destination` laid over the root of `from`.
    fn distance_between_trees(&self, from: &TreeWithMetaBuilder, destination: &TreeWithMetaBuilder) -> Result<f64> {
        let from_ancestor = from.most_recent_common_ancestor()?;
        let destination_ancestor = destination.most_recent_common_ancestor()?;
        let rebased = self.rebase().rebase_mutations(
            &destination_ancestor.from_root,
            destination.root_info(),
            from.root_info(),
        )?;
        let difference = from_ancestor.from_root.difference_with(&rebased)?;
        Ok(from.model().plain_distance(&difference))
    }

    /// Offer every lightly mutated free clone to the tree whose common ancestor
    /// has the closest junction.
    fn attach_clones_by_ndn(
        &self,
        mut trees: Vec<TreeWithMetaBuilder>,
        free: Vec<Arc<MutationsFromGermline>>,
    ) -> Result<StepResult> {
        let mut decisions = Vec::new();
        for clone in free
            .iter()
            .filter(|c| c.vj_mutations_count() < self.params.common_mutations_count_for_clustering)
        {
            let mut best: Option<(usize, RebasedClone, f64)> = None;
            for (i, tree) in trees.iter().enumerate() {
                let Some(rebased) = self.try_rebase(tree, clone)? else {
                    continue;
                };
                let ancestor_ndn = tree.most_recent_common_ancestor_ndn()?;
                let clone_ndn = rebased.mutations.ndn_sequence();
                let metric = ndn_distance(&self.scoring.ndn, &ancestor_ndn, clone_ndn)
                    .min(ndn_distance(&self.scoring.ndn, clone_ndn, &ancestor_ndn));
                if best.as_ref().map_or(true, |(_, _, b)| metric < *b) {
                    best = Some((i, rebased, metric));
                }
            }
            let Some((i, rebased, metric)) = best else {
                continue;
            };
            if metric <= self.params.threshold_for_combine_by_ndn {
                trees[i].add_clone(rebased)?;
                decisions.push((clone.clone.id.clone(), DecisionInfo::Metric { metric }));
            }
        }
        Ok(self.step_result(decisions, &trees, 0))
    }

    fn step_result(
        &self,
        decisions: Vec<(CloneWrapperId, DecisionInfo)>,
        trees: &[TreeWithMetaBuilder],
        combined_trees: usize,
    ) -> StepResult {
        let by_clone: HashMap<&CloneWrapperId, &DecisionInfo> = decisions.iter().map(|(id, d)| (id, d)).collect();
        let debug_rows = self.debug_rows_with(trees, &by_clone);
        StepResult {
            snapshots: trees.iter().map(TreeWithMetaBuilder::snapshot).collect(),
            debug_rows,
            combined_trees,
            decisions,
        }
    }

    /// Diagnostics for the reconstructed nodes of the trees, without metrics.
    pub fn debug_rows(&self, trees: &[TreeWithMetaBuilder]) -> Vec<DebugRow> {
        self.debug_rows_with(trees, &HashMap::new())
    }

    fn debug_rows_with(
        &self,
        trees: &[TreeWithMetaBuilder],
        decisions: &HashMap<&CloneWrapperId, &DecisionInfo>,
    ) -> Vec<DebugRow> {
        let mut rows = Vec::new();
        for tree in trees {
            for node in tree.all_nodes() {
                if let Some(row) = self.debug_row(tree, node, decisions) {
                    rows.push(row);
                }
            }
        }
        rows
    }

    fn debug_row(
        &self,
        tree: &TreeWithMetaBuilder,
        node: NodeWithParent<'_, ShmContent>,
        decisions: &HashMap<&CloneWrapperId, &DecisionInfo>,
    ) -> Option<DebugRow> {
        let content = node.node.content().as_reconstructed()?;
        let clone_id = node
            .node
            .links()
            .iter()
            .find_map(|l| l.node().content().as_observed())
            .map(|o| &o.clone_wrapper().id);
        let metric = clone_id
            .and_then(|id| decisions.get(id))
            .and_then(|d| d.metric());
        let from_parent = node
            .parent
            .and_then(|p| p.content().as_reconstructed())
            .and_then(|p| p.from_root.difference_with(&content.from_root).ok());
        let root_info = tree.root_info();
        Some(DebugRow {
            v_gene: root_info.vj_base.v_gene.clone(),
            j_gene: root_info.vj_base.j_gene.clone(),
            cdr3_length: root_info.vj_base.cdr3_length,
            tree_number: tree.tree_id().number,
            node_id: node.node.content().id(),
            parent_id: node.parent.map(|p| p.content().id()),
            clone_id: clone_id.map(ToString::to_string),
            metric,
            ndn: String::from_utf8_lossy(content.from_root.ndn_sequence()).into_owned(),
            v_mutations_from_root: parts_summary(content.from_root.v_parts()),
            ndn_mutations_from_root: content.from_root.ndn.mutations().to_string(),
            j_mutations_from_root: parts_summary(content.from_root.j_parts()),
            v_mutations_from_parent: from_parent.as_ref().map(|d| parts_summary(d.v_parts())),
            ndn_mutations_from_parent: from_parent.as_ref().map(|d| d.ndn.mutations().to_string()),
            j_mutations_from_parent: from_parent.as_ref().map(|d| parts_summary(d.j_parts())),
            is_public: root_info.reconstructed_ndn.len() <= self.params.ndn_size_limit_for_public_clones,
        })
    }
}

fn parts_summary<'a>(parts: impl Iterator<Item = &'a MutationsWithRange>) -> String {
    parts.map(|p| p.mutations().to_string()).join("|")
}
