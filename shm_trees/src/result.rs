// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! Final trees as flat node tables.

use crate::builder::ObservedOrReconstructed;
use crate::clone::CloneWrapperId;
use crate::meta::{TreeId, TreeWithMetaBuilder};
use crate::root::RootInfo;
use serde::{Deserialize, Serialize};
use shm_mutations::{Mutations, MutationsWithRange};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShmTreeNode {
    pub id: u32,
    pub parent: Option<u32>,
    pub distance_from_parent: Option<f64>,
    /// Sum of the edges from the reconstructed root.
    pub distance_from_root: f64,
    /// Distance of the node state from germline, the junction taken from the root.
    pub distance_from_germline: f64,
    /// Sum of the edges from the most recent common ancestor, for nodes below it.
    pub distance_from_mrca: Option<f64>,
    /// Set on observed nodes.
    pub clone: Option<CloneWrapperId>,
    pub count: Option<f64>,
    /// Absolute edits per V part, from the part farthest from CDR3.
    pub v_mutations: Vec<Mutations>,
    pub ndn_mutations: Mutations,
    /// Absolute edits per J part, from the part in CDR3.
    pub j_mutations: Vec<Mutations>,
    pub ndn: String,
    pub cdr3: String,
}

impl ShmTreeNode {
    pub fn is_observed(&self) -> bool {
        self.clone.is_some()
    }
}

/// A lineage tree; nodes are in preorder so a parent always comes before its
/// children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShmTree {
    pub tree_id: TreeId,
    pub root: RootInfo,
    pub nodes: Vec<ShmTreeNode>,
}

impl ShmTree {
    pub fn from_builder(tree: &TreeWithMetaBuilder) -> ShmTree {
        let model = tree.model();
        let mrca_id = tree.most_recent_common_ancestor_id();
        let mut from_root: HashMap<u32, f64> = HashMap::new();
        let mut from_mrca: HashMap<u32, f64> = HashMap::new();
        let mut nodes = Vec::new();

        for n in tree.all_nodes() {
            let content = n.node.content();
            let id = content.id();
            let parent = n.parent.map(|p| p.content().id());
            let edge = n.distance.unwrap_or(0.0);
            let distance_from_root = parent.and_then(|p| from_root.get(&p)).copied().unwrap_or(0.0) + edge;
            from_root.insert(id, distance_from_root);
            let distance_from_mrca = if Some(id) == mrca_id {
                Some(0.0)
            } else {
                parent.and_then(|p| from_mrca.get(&p)).map(|d| d + edge)
            };
            if let Some(d) = distance_from_mrca {
                from_mrca.insert(id, d);
            }

            let (description, clone, count) = match content {
                ObservedOrReconstructed::Observed { content: observed, .. } => (
                    &observed.mutations,
                    Some(observed.clone_wrapper().id.clone()),
                    Some(observed.clone_wrapper().count),
                ),
                ObservedOrReconstructed::Reconstructed { content: ancestor, .. } => (&ancestor.from_root, None, None),
            };
            nodes.push(ShmTreeNode {
                id,
                parent,
                distance_from_parent: n.distance,
                distance_from_root,
                distance_from_germline: model.plain_distance(description),
                distance_from_mrca,
                clone,
                count,
                v_mutations: absolute(description.v_parts()),
                ndn_mutations: description.ndn.mutations().clone(),
                j_mutations: absolute(description.j_parts()),
                ndn: String::from_utf8_lossy(description.ndn_sequence()).into_owned(),
                cdr3: String::from_utf8_lossy(&description.build_cdr3()).into_owned(),
            });
        }
        ShmTree {
            tree_id: tree.tree_id().clone(),
            root: tree.root_info().as_ref().clone(),
            nodes,
        }
    }

    pub fn clones_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_observed()).count()
    }

    pub fn node(&self, id: u32) -> Option<&ShmTreeNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn children(&self, id: u32) -> impl Iterator<Item = &ShmTreeNode> {
        self.nodes.iter().filter(move |n| n.parent == Some(id))
    }
}

fn absolute<'a>(parts: impl Iterator<Item = &'a MutationsWithRange>) -> Vec<Mutations> {
    parts.map(|p| p.mutations().clone()).collect()
}

/// Sum of the edge lengths of the tree.
pub fn total_distance(tree: &ShmTree) -> f64 {
    tree.nodes.iter().filter_map(|n| n.distance_from_parent).sum()
}
