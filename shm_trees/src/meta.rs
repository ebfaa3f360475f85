// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! A lineage tree under construction together with its root, its identity and
//! the order in which clones were added to it.

use crate::builder::{Action, Content, TreeBuilderByAncestors};
use crate::clone::{CloneWrapperId, VJBase};
use crate::germline::MutationsFromGermline;
use crate::model::{ShmModel, SyntheticNode};
use crate::rebase::{ClonesRebase, RebaseError, RebasedClone};
use crate::root::RootInfo;
use crate::tree::{Node, NodeLink, NodeWithParent, Tree};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Identity of a tree: its gene pair and CDR3 length plus a number unique among
/// the trees of that key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TreeId {
    pub vj_base: VJBase,
    pub number: u32,
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.vj_base, self.number)
    }
}

/// Hands out tree numbers per [`VJBase`]; shared by the workers of a step.
#[derive(Debug, Default)]
pub struct TreeIdGenerator {
    counters: Mutex<BTreeMap<VJBase, u32>>,
}

impl TreeIdGenerator {
    pub fn next(&self, vj_base: &VJBase) -> TreeId {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let counter = counters.entry(vj_base.clone()).or_insert(0);
        *counter += 1;
        TreeId {
            vj_base: vj_base.clone(),
            number: *counter,
        }
    }
}

/// What survives of a tree between steps: enough to rebuild it by replaying
/// the additions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Clones in the order they were added.
    pub history: Vec<CloneWrapperId>,
    pub root_info: Arc<RootInfo>,
    pub tree_id: TreeId,
}

impl Snapshot {
    pub fn exclude_clones(&self, to_exclude: &HashSet<CloneWrapperId>) -> Snapshot {
        Snapshot {
            history: self
                .history
                .iter()
                .filter(|id| !to_exclude.contains(id))
                .cloned()
                .collect(),
            ..self.clone()
        }
    }

    pub fn clones_count(&self) -> usize {
        self.history.len()
    }
}

/// Why a clone was placed into a tree; compared across gene pair hypotheses to
/// keep the clone in one tree only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DecisionInfo {
    /// Placement by clustering: V and J edits of the node above the clone and
    /// the alignment scores of the hypothesis.
    ZeroStep {
        common_mutations_count: usize,
        v_score: f32,
        j_score: f32,
    },
    /// Placement by a step with a cost; smaller is better.
    Metric { metric: f64 },
}

impl DecisionInfo {
    pub fn metric(&self) -> Option<f64> {
        match self {
            DecisionInfo::Metric { metric } => Some(*metric),
            DecisionInfo::ZeroStep { .. } => None,
        }
    }

    fn compare_zero_step(first: &DecisionInfo, second: &DecisionInfo) -> Ordering {
        match (first, second) {
            (
                DecisionInfo::ZeroStep {
                    common_mutations_count: c1,
                    v_score: v1,
                    j_score: j1,
                },
                DecisionInfo::ZeroStep {
                    common_mutations_count: c2,
                    v_score: v2,
                    j_score: j2,
                },
            ) => c1.cmp(c2).then_with(|| (v2 + j2).total_cmp(&(v1 + j1))),
            _ => Ordering::Equal,
        }
    }
}

/// Pick the gene pair that keeps a clone.
///
/// Placements by clustering prefer the fewest edits above the clone, then the
/// highest V plus J score; placements with a cost prefer the smallest cost.
/// Remaining ties go to the smallest [`VJBase`]. Mixing both kinds is an error.
pub fn make_decision(candidates: &BTreeMap<VJBase, DecisionInfo>) -> Result<VJBase> {
    let mut entries = candidates.iter();
    let Some((first_base, first)) = entries.next() else {
        bail!("no candidates to decide between");
    };
    let mut best = (first_base, first);
    for (vj_base, decision) in entries {
        let ordering = match (decision, best.1) {
            (DecisionInfo::ZeroStep { .. }, DecisionInfo::ZeroStep { .. }) => {
                DecisionInfo::compare_zero_step(decision, best.1)
            }
            (DecisionInfo::Metric { metric }, DecisionInfo::Metric { metric: best_metric }) => {
                metric.total_cmp(best_metric)
            }
            _ => bail!("decisions of different kinds for {first_base} and {vj_base}"),
        };
        if ordering == Ordering::Less {
            best = (vj_base, decision);
        }
    }
    Ok(best.0.clone())
}

pub type ShmAction = Action<ShmModel>;
pub type ShmContent = Content<ShmModel>;

#[derive(Clone)]
pub struct TreeWithMetaBuilder {
    builder: TreeBuilderByAncestors<ShmModel>,
    root_info: Arc<RootInfo>,
    rebase: ClonesRebase,
    history: Vec<CloneWrapperId>,
    tree_id: TreeId,
}

impl TreeWithMetaBuilder {
    pub fn new(
        model: ShmModel,
        root_info: Arc<RootInfo>,
        rebase: ClonesRebase,
        count_of_nodes_to_probe: usize,
        tree_id: TreeId,
    ) -> Self {
        let root = SyntheticNode {
            from_root: root_info.empty_description(),
        };
        TreeWithMetaBuilder {
            builder: TreeBuilderByAncestors::new(model, root, count_of_nodes_to_probe),
            root_info,
            rebase,
            history: Vec::new(),
            tree_id,
        }
    }

    pub fn tree_id(&self) -> &TreeId {
        &self.tree_id
    }

    pub fn root_info(&self) -> &Arc<RootInfo> {
        &self.root_info
    }

    pub fn model(&self) -> &ShmModel {
        self.builder.model()
    }

    pub fn tree(&self) -> &Tree<ShmContent> {
        self.builder.tree()
    }

    pub fn all_nodes(&self) -> Vec<NodeWithParent<'_, ShmContent>> {
        self.builder.tree().all_nodes()
    }

    pub fn clones_count(&self) -> usize {
        self.history.len()
    }

    pub fn history(&self) -> &[CloneWrapperId] {
        &self.history
    }

    pub fn rebase_clone(&self, clone: &Arc<MutationsFromGermline>) -> Result<RebasedClone, RebaseError> {
        self.rebase.rebase_clone(&self.root_info, clone)
    }

    pub fn add_clone(&mut self, clone: RebasedClone) -> Result<()> {
        let id = clone.clone_wrapper().id.clone();
        self.builder
            .add_node(clone)
            .with_context(|| format!("can't add clone {id} to tree {}", self.tree_id))?;
        self.history.push(id);
        Ok(())
    }

    pub fn best_action(&self, clone: &RebasedClone) -> Result<ShmAction> {
        self.builder
            .best_action(clone)
            .with_context(|| format!("no place for clone {} in tree {}", clone.clone_wrapper().id, self.tree_id))
    }

    /// Apply an action computed by [`best_action`](Self::best_action) on this tree.
    pub fn apply(&mut self, action: ShmAction) -> Result<()> {
        let id = action.observed().clone_wrapper().id.clone();
        self.builder
            .apply(action)
            .with_context(|| format!("can't add clone {id} to tree {}", self.tree_id))?;
        self.history.push(id);
        Ok(())
    }

    pub fn distance_from_root_to_clone(&self, clone: &RebasedClone) -> Result<f64> {
        self.builder.distance_from_root_to_observed(clone)
    }

    fn most_recent_common_ancestor_node(&self) -> &Arc<Node<ShmContent>> {
        let root = self.builder.tree().root();
        root.links()
            .iter()
            .map(NodeLink::node)
            .find(|n| n.content().as_reconstructed().is_some())
            .unwrap_or(root)
    }

    /// The first reconstructed child of the root, or the root itself if there
    /// is none.
    pub fn most_recent_common_ancestor(&self) -> Result<&SyntheticNode> {
        self.most_recent_common_ancestor_node()
            .content()
            .as_reconstructed()
            .with_context(|| format!("tree {} has an observed root", self.tree_id))
    }

    pub fn most_recent_common_ancestor_id(&self) -> Option<u32> {
        Some(self.most_recent_common_ancestor_node().content().id())
    }

    pub fn most_recent_common_ancestor_ndn(&self) -> Result<Vec<u8>> {
        Ok(self.most_recent_common_ancestor()?.from_root.ndn_sequence().to_vec())
    }

    /// The reconstructed node above the node that holds the clone: the holder
    /// is a copy of the clone itself unless the clone sits on a shared ancestor.
    pub fn effective_parent(&self, clone: &CloneWrapperId) -> Result<&SyntheticNode> {
        let nodes = self.builder.tree().all_nodes();
        let holder = nodes
            .iter()
            .find(|n| {
                n.node
                    .links()
                    .iter()
                    .any(|l| l.node().content().as_observed().is_some_and(|o| o.clone_wrapper().id == *clone))
            })
            .with_context(|| format!("clone {clone} is not in tree {}", self.tree_id))?;
        let parent = holder.parent.unwrap_or(holder.node);
        parent
            .content()
            .as_reconstructed()
            .with_context(|| format!("observed node above clone {clone} in tree {}", self.tree_id))
    }

    pub fn observed_clones(&self) -> Vec<&RebasedClone> {
        self.builder
            .tree()
            .all_nodes()
            .into_iter()
            .filter_map(|n| n.node.content().as_observed())
            .collect()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            history: self.history.clone(),
            root_info: self.root_info.clone(),
            tree_id: self.tree_id.clone(),
        }
    }
}
