// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! Greedy lineage tree construction by reconstruction of common ancestors.
//!
//! Observed leaves are added one at a time. For each new leaf the builder
//! probes the reconstructed nodes closest to it and considers either hanging
//! the leaf under a probed node or replacing an edge with a new common
//! ancestor of the leaf and the node at the end of that edge. The action that
//! adds the least total edge length wins.
//!
//! The tree keeps these properties:
//! - the root is reconstructed and never changes
//! - leaves are observed nodes
//! - an observed node may sit at distance zero from its reconstructed parent
//! - siblings share no common ancestor other than their parent

use crate::tree::{Node, NodeLink, Tree};
use anyhow::{bail, Context, Result};
use std::cmp::Ordering;
use std::sync::Arc;

/// Operations on node states needed by [`TreeBuilderByAncestors`].
pub trait AncestorModel {
    type Observed: Clone;
    type Ancestor: Clone;
    /// Difference between two ancestor states.
    type Mutations;

    /// Length of the edge that starts at `from` and applies `mutations`.
    fn distance(&self, from: &Self::Ancestor, mutations: &Self::Mutations) -> Result<f64>;

    fn mutations_between(&self, first: &Self::Ancestor, second: &Self::Ancestor) -> Result<Self::Mutations>;

    fn mutate(&self, parent: &Self::Ancestor, mutations: &Self::Mutations) -> Result<Self::Ancestor>;

    fn as_ancestor(&self, observed: &Self::Observed) -> Self::Ancestor;

    /// Mutations shared by two differences starting at the same state.
    fn find_common_mutations(&self, first: &Self::Mutations, second: &Self::Mutations) -> Result<Self::Mutations>;

    /// Re-express a descendant after its parent was reconstructed.
    fn postprocess_descendant(&self, parent: &Self::Ancestor, child: &Self::Ancestor) -> Result<Self::Ancestor>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObservedOrReconstructed<O, A> {
    Observed {
        content: O,
        id: u32,
    },
    Reconstructed {
        content: A,
        /// Length that remains on the path to the nearest observed node once
        /// reconstructed nodes are removed. Zero for the root and for nodes with
        /// an observed child at distance zero.
        min_distance_from_observed: f64,
        id: u32,
    },
}

impl<O, A> ObservedOrReconstructed<O, A> {
    pub fn id(&self) -> u32 {
        match self {
            ObservedOrReconstructed::Observed { id, .. } | ObservedOrReconstructed::Reconstructed { id, .. } => *id,
        }
    }

    pub fn as_observed(&self) -> Option<&O> {
        match self {
            ObservedOrReconstructed::Observed { content, .. } => Some(content),
            ObservedOrReconstructed::Reconstructed { .. } => None,
        }
    }

    pub fn as_reconstructed(&self) -> Option<&A> {
        match self {
            ObservedOrReconstructed::Observed { .. } => None,
            ObservedOrReconstructed::Reconstructed { content, .. } => Some(content),
        }
    }

    fn min_distance_from_observed(&self) -> f64 {
        match self {
            ObservedOrReconstructed::Observed { .. } => 0.0,
            ObservedOrReconstructed::Reconstructed {
                min_distance_from_observed,
                ..
            } => *min_distance_from_observed,
        }
    }
}

pub type Content<M> = ObservedOrReconstructed<<M as AncestorModel>::Observed, <M as AncestorModel>::Ancestor>;
pub type BuilderNode<M> = Node<Content<M>>;

enum Change<M: AncestorModel> {
    Insert {
        distance: f64,
    },
    Replace {
        what: Arc<BuilderNode<M>>,
        what_min_distance: f64,
        common_ancestor: M::Ancestor,
        min_distance_from_observed: f64,
        rebuilt_child: M::Ancestor,
        distance_from_parent_to_common: f64,
        distance_from_common_to_child: f64,
        distance_from_common_to_added: f64,
    },
}

/// A possible placement of an observed node, to be applied with
/// [`TreeBuilderByAncestors::apply`] on the builder that produced it.
pub struct Action<M: AncestorModel> {
    parent: Arc<BuilderNode<M>>,
    observed: M::Observed,
    added: M::Ancestor,
    change: Change<M>,
    change_of_distance: f64,
    distance_from_observed: f64,
}

impl<M: AncestorModel> Action<M> {
    /// Total length the tree gains.
    pub fn change_of_distance(&self) -> f64 {
        self.change_of_distance
    }

    pub fn distance_from_observed(&self) -> f64 {
        self.distance_from_observed
    }

    /// State of the node the action attaches to.
    pub fn parent_content(&self) -> Option<&M::Ancestor> {
        self.parent.content().as_reconstructed()
    }

    pub fn is_insert(&self) -> bool {
        matches!(self.change, Change::Insert { .. })
    }

    pub fn observed(&self) -> &M::Observed {
        &self.observed
    }

    fn distance_from_parent_to_common(&self) -> f64 {
        match self.change {
            Change::Insert { .. } => 0.0,
            Change::Replace {
                distance_from_parent_to_common,
                ..
            } => distance_from_parent_to_common,
        }
    }

    /// Ordering of candidate actions, best first.
    fn compare(&self, other: &Self) -> Ordering {
        (self.change_of_distance + self.distance_from_observed)
            .total_cmp(&(other.change_of_distance + other.distance_from_observed))
            .then_with(|| self.change_of_distance.total_cmp(&other.change_of_distance))
            .then_with(|| other.is_insert().cmp(&self.is_insert()))
    }
}

#[derive(Clone)]
pub struct TreeBuilderByAncestors<M: AncestorModel> {
    model: M,
    tree: Tree<Content<M>>,
    count_of_nodes_to_probe: usize,
    counter: u32,
}

impl<M: AncestorModel> TreeBuilderByAncestors<M> {
    pub fn new(model: M, root: M::Ancestor, count_of_nodes_to_probe: usize) -> Self {
        let root = Node::new(ObservedOrReconstructed::Reconstructed {
            content: root,
            min_distance_from_observed: 0.0,
            id: 0,
        });
        TreeBuilderByAncestors {
            model,
            tree: Tree::new(root),
            count_of_nodes_to_probe,
            counter: 1,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn tree(&self) -> &Tree<Content<M>> {
        &self.tree
    }

    pub fn add_node(&mut self, observed: M::Observed) -> Result<()> {
        let action = self.best_action(&observed)?;
        self.apply(action)
    }

    fn root_content(&self) -> Result<&M::Ancestor> {
        self.tree
            .root()
            .content()
            .as_reconstructed()
            .context("tree root must be a reconstructed node")
    }

    pub fn distance_from_root_to_observed(&self, observed: &M::Observed) -> Result<f64> {
        let root = self.root_content()?;
        let added = self.model.as_ancestor(observed);
        self.model
            .distance(root, &self.model.mutations_between(root, &added)?)
    }

    /// The cheapest way to add `observed`, without changing the tree.
    pub fn best_action(&self, observed: &M::Observed) -> Result<Action<M>> {
        let added = self.model.as_ancestor(observed);

        let mut nearest = Vec::new();
        for candidate in self.tree.all_nodes() {
            let content = candidate.node.content();
            if let Some(state) = content.as_reconstructed() {
                let distance = self
                    .model
                    .distance(state, &self.model.mutations_between(state, &added)?)?;
                nearest.push((candidate, distance + content.min_distance_from_observed()));
            }
        }
        nearest.sort_by(|a, b| a.1.total_cmp(&b.1));
        nearest.truncate(self.count_of_nodes_to_probe);

        let mut possible = Vec::new();
        for (probed, _) in nearest {
            let chosen = probed.node;
            let mut sibling_to_merge_with: Option<Action<M>> = None;
            for link in chosen.links() {
                if link.node().content().as_reconstructed().is_none() {
                    continue;
                }
                let Some(replace) = self.replace_child(chosen, link.node(), link.distance(), observed, &added)? else {
                    continue;
                };
                // first of the equally good ones
                let better = sibling_to_merge_with
                    .as_ref()
                    .map_or(true, |s| replace.distance_from_parent_to_common() > s.distance_from_parent_to_common());
                if better {
                    sibling_to_merge_with = Some(replace);
                }
            }
            if let Some(replace) = sibling_to_merge_with {
                possible.push(replace);
                continue;
            }
            possible.push(self.insert_as_direct_descendant(chosen, observed, &added)?);
            if let (Some(parent), Some(distance)) = (probed.parent, probed.distance) {
                if let Some(replace) = self.replace_child(parent, chosen, distance, observed, &added)? {
                    possible.push(replace);
                }
            }
        }

        let mut best: Option<Action<M>> = None;
        for action in possible {
            if best.as_ref().map_or(true, |b| action.compare(b) == Ordering::Less) {
                best = Some(action);
            }
        }
        match best {
            Some(action) => Ok(action),
            None => bail!("no node of the tree can take a new observed node"),
        }
    }

    fn insert_as_direct_descendant(
        &self,
        parent: &Arc<BuilderNode<M>>,
        observed: &M::Observed,
        added: &M::Ancestor,
    ) -> Result<Action<M>> {
        let content = parent.content();
        let state = content
            .as_reconstructed()
            .context("only reconstructed nodes take children")?;
        let distance = self
            .model
            .distance(state, &self.model.mutations_between(state, added)?)?;
        Ok(Action {
            parent: parent.clone(),
            observed: observed.clone(),
            added: added.clone(),
            change: Change::Insert { distance },
            change_of_distance: distance,
            distance_from_observed: content.min_distance_from_observed(),
        })
    }

    /// Replace the edge from `parent` to `child` with a common ancestor of the
    /// added node and `child`. `None` if they share nothing below `parent` or if
    /// the common ancestor would be `child` itself.
    fn replace_child(
        &self,
        parent: &Arc<BuilderNode<M>>,
        child: &Arc<BuilderNode<M>>,
        distance_from_parent_to_child: f64,
        observed: &M::Observed,
        added: &M::Ancestor,
    ) -> Result<Option<Action<M>>> {
        let parent_content = parent.content();
        let (Some(parent_state), Some(child_state)) =
            (parent_content.as_reconstructed(), child.content().as_reconstructed())
        else {
            return Ok(None);
        };
        let m = &self.model;
        let to_added = m.mutations_between(parent_state, added)?;
        let to_child = m.mutations_between(parent_state, child_state)?;
        let common = m.find_common_mutations(&to_added, &to_child)?;
        let distance_from_parent_to_common = m.distance(parent_state, &common)?;
        if distance_from_parent_to_common == 0.0 {
            return Ok(None);
        }
        let common_ancestor = m.mutate(parent_state, &common)?;
        let from_common_to_child = m.mutations_between(&common_ancestor, child_state)?;
        let distance_from_common_to_child = m.distance(&common_ancestor, &from_common_to_child)?;
        if distance_from_common_to_child == 0.0 {
            return Ok(None);
        }
        let distance_from_common_to_added =
            m.distance(&common_ancestor, &m.mutations_between(&common_ancestor, added)?)?;
        let min_distance_from_observed = distance_from_common_to_added
            .min(distance_from_common_to_child)
            .min(parent_content.min_distance_from_observed() + distance_from_parent_to_common);
        let rebuilt_child = m.mutate(&common_ancestor, &from_common_to_child)?;
        let change_of_distance = distance_from_parent_to_common - distance_from_parent_to_child
            + distance_from_common_to_child
            + distance_from_common_to_added;
        Ok(Some(Action {
            parent: parent.clone(),
            observed: observed.clone(),
            added: added.clone(),
            change: Change::Replace {
                what: child.clone(),
                what_min_distance: child.content().min_distance_from_observed(),
                common_ancestor,
                min_distance_from_observed,
                rebuilt_child,
                distance_from_parent_to_common,
                distance_from_common_to_child,
                distance_from_common_to_added,
            },
            change_of_distance,
            distance_from_observed: parent_content.min_distance_from_observed(),
        }))
    }

    fn next_id(&mut self) -> u32 {
        let id = self.counter;
        self.counter += 1;
        id
    }

    /// The node holding the added leaf: the leaf itself at distance zero, or a
    /// reconstructed copy of it with the leaf below.
    fn generate_node(&mut self, observed: M::Observed, added: M::Ancestor, distance: f64) -> BuilderNode<M> {
        if distance == 0.0 {
            return Node::new(ObservedOrReconstructed::Observed {
                content: observed,
                id: self.next_id(),
            });
        }
        let mut node = Node::new(ObservedOrReconstructed::Reconstructed {
            content: added,
            min_distance_from_observed: 0.0,
            id: self.next_id(),
        });
        node.add_child(
            Node::new(ObservedOrReconstructed::Observed {
                content: observed,
                id: self.next_id(),
            }),
            0.0,
        );
        node
    }

    pub fn apply(&mut self, action: Action<M>) -> Result<()> {
        let Action {
            parent,
            observed,
            added,
            change,
            ..
        } = action;
        let updated = match change {
            Change::Insert { distance } => {
                let node = self.generate_node(observed, added, distance);
                self.tree.replace_node(&parent, |p| {
                    let mut copy = p.clone();
                    if distance == 0.0 {
                        if let ObservedOrReconstructed::Reconstructed {
                            min_distance_from_observed,
                            ..
                        } = copy.content_mut()
                        {
                            *min_distance_from_observed = 0.0;
                        }
                    }
                    copy.add_child(node, distance);
                    copy
                })
            }
            Change::Replace {
                what,
                what_min_distance,
                common_ancestor,
                min_distance_from_observed,
                rebuilt_child,
                distance_from_parent_to_common,
                distance_from_common_to_child,
                distance_from_common_to_added,
            } => {
                let id = self.next_id();
                let rebuilt = Node::with_links(
                    ObservedOrReconstructed::Reconstructed {
                        content: rebuilt_child,
                        min_distance_from_observed: what_min_distance,
                        id: self.next_id(),
                    },
                    what.links().to_vec(),
                );
                let generated = self.generate_node(observed, added, distance_from_common_to_added);
                let links = vec![
                    NodeLink::new(Arc::new(rebuilt), distance_from_common_to_child),
                    NodeLink::new(Arc::new(generated), distance_from_common_to_added),
                ];
                let links = self.postprocess(&common_ancestor, &links)?;
                let replacement = Node::with_links(
                    ObservedOrReconstructed::Reconstructed {
                        content: common_ancestor,
                        min_distance_from_observed,
                        id,
                    },
                    links,
                );
                self.tree.replace_node(&parent, |p| {
                    let mut copy = p.clone();
                    copy.replace_child(&what, replacement, distance_from_parent_to_common);
                    copy
                })
            }
        };
        match updated {
            Some(tree) => {
                self.tree = tree;
                Ok(())
            }
            None => bail!("action was computed on another version of the tree"),
        }
    }

    /// Re-express reconstructed descendants below a new ancestor. A descendant
    /// that becomes equal to its parent is removed and its children move up.
    fn postprocess(
        &mut self,
        parent: &M::Ancestor,
        links: &[NodeLink<Content<M>>],
    ) -> Result<Vec<NodeLink<Content<M>>>> {
        let mut result = Vec::with_capacity(links.len());
        for link in links {
            let child = link.node();
            let ObservedOrReconstructed::Reconstructed {
                content,
                min_distance_from_observed,
                ..
            } = child.content()
            else {
                result.push(link.clone());
                continue;
            };
            let mapped = self.model.postprocess_descendant(parent, content)?;
            let new_distance = self
                .model
                .distance(parent, &self.model.mutations_between(parent, &mapped)?)?;
            if new_distance == 0.0 {
                result.extend(self.postprocess(parent, child.links())?);
                continue;
            }
            let id = self.next_id();
            let grandchildren = self.postprocess(&mapped, child.links())?;
            let node = Node::with_links(
                ObservedOrReconstructed::Reconstructed {
                    content: mapped,
                    min_distance_from_observed: *min_distance_from_observed,
                    id,
                },
                grandchildren,
            );
            result.push(NodeLink::new(Arc::new(node), new_distance));
        }
        Ok(result)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::cmp::Reverse;
    use std::collections::{BTreeSet, HashSet};

    type State = BTreeSet<u32>;

    pub(crate) struct Delta {
        added: State,
        removed: State,
    }

    /// Nodes are sets of markers, an edge costs one per gained or lost marker.
    #[derive(Clone)]
    pub(crate) struct SetModel;

    impl AncestorModel for SetModel {
        type Observed = State;
        type Ancestor = State;
        type Mutations = Delta;

        fn distance(&self, _from: &State, mutations: &Delta) -> Result<f64> {
            Ok((mutations.added.len() + mutations.removed.len()) as f64)
        }

        fn mutations_between(&self, first: &State, second: &State) -> Result<Delta> {
            Ok(Delta {
                added: second.difference(first).copied().collect(),
                removed: first.difference(second).copied().collect(),
            })
        }

        fn mutate(&self, parent: &State, mutations: &Delta) -> Result<State> {
            Ok(parent
                .union(&mutations.added)
                .filter(|m| !mutations.removed.contains(m))
                .copied()
                .collect())
        }

        fn as_ancestor(&self, observed: &State) -> State {
            observed.clone()
        }

        fn find_common_mutations(&self, first: &Delta, second: &Delta) -> Result<Delta> {
            Ok(Delta {
                added: first.added.intersection(&second.added).copied().collect(),
                removed: first.removed.intersection(&second.removed).copied().collect(),
            })
        }

        fn postprocess_descendant(&self, _parent: &State, child: &State) -> Result<State> {
            Ok(child.clone())
        }
    }

    fn set(items: &[u32]) -> State {
        items.iter().copied().collect()
    }

    fn build(leaves: &[State]) -> TreeBuilderByAncestors<SetModel> {
        let mut builder = TreeBuilderByAncestors::new(SetModel, State::new(), 25);
        for leaf in leaves {
            builder.add_node(leaf.clone()).unwrap();
        }
        builder
    }

    fn total_length(builder: &TreeBuilderByAncestors<SetModel>) -> f64 {
        builder.tree().all_nodes().iter().filter_map(|n| n.distance).sum()
    }

    fn star_length(leaves: &[State]) -> f64 {
        leaves.iter().map(|l| l.len() as f64).sum()
    }

    fn observed(builder: &TreeBuilderByAncestors<SetModel>) -> Vec<State> {
        let mut result: Vec<State> = builder
            .tree()
            .all_nodes()
            .iter()
            .filter_map(|n| n.node.content().as_observed().cloned())
            .collect();
        result.sort();
        result
    }

    #[test]
    fn test_shared_mutations_make_an_ancestor() {
        let leaves = [set(&[1, 2, 3, 4]), set(&[1, 2, 3, 5]), set(&[1, 2])];
        let builder = build(&leaves);
        assert_eq!(total_length(&builder), 5.0);
        assert_eq!(star_length(&leaves), 10.0);

        let root = builder.tree().root();
        assert_eq!(root.links().len(), 1);
        // the first common ancestor holds {1, 2}, with the third leaf on it
        let first = root.links()[0].node();
        assert_eq!(first.content().as_reconstructed(), Some(&set(&[1, 2])));
        assert_eq!(root.links()[0].distance(), 2.0);
        assert!(first
            .links()
            .iter()
            .any(|l| l.distance() == 0.0 && l.node().content().as_observed() == Some(&set(&[1, 2]))));
    }

    #[test]
    fn test_order_of_leaves() {
        let leaves = [set(&[1, 2, 3, 4]), set(&[1, 2, 3, 5]), set(&[1, 2])];
        let reversed: Vec<State> = leaves.iter().rev().cloned().collect();
        let in_order = build(&leaves);
        let in_reverse = build(&reversed);
        assert_eq!(total_length(&in_reverse), 5.0);
        assert!(total_length(&in_order) <= total_length(&in_reverse));
        assert_eq!(observed(&in_order), observed(&in_reverse));
    }

    #[test]
    fn test_leaf_equal_to_root() {
        let builder = build(&[State::new()]);
        let root = builder.tree().root();
        assert_eq!(root.links().len(), 1);
        assert_eq!(root.links()[0].distance(), 0.0);
        assert!(root.links()[0].node().content().as_observed().is_some());
    }

    #[test]
    fn test_best_action_does_not_change_tree() {
        let builder = build(&[set(&[1, 2, 3])]);
        let before = builder.tree().all_nodes().len();
        let action = builder.best_action(&set(&[1, 2, 4])).unwrap();
        assert_eq!(builder.tree().all_nodes().len(), before);
        assert_eq!(action.change_of_distance(), 1.0);
        assert!(!action.is_insert());
        assert_eq!(action.parent_content(), Some(&State::new()));
        assert_eq!(builder.distance_from_root_to_observed(&set(&[1, 2, 4])).unwrap(), 3.0);
    }

    #[test]
    fn test_stale_action_is_rejected() {
        let mut builder = build(&[set(&[1, 2, 3])]);
        let action = builder.best_action(&set(&[7])).unwrap();
        builder.add_node(set(&[1, 2])).unwrap();
        assert!(builder.apply(action).is_err());
    }

    /// Strictly nested non-empty sets in random order.
    fn shuffled_chain() -> impl Strategy<Value = Vec<State>> {
        prop::collection::btree_set(0u32..100, 1..7)
            .prop_map(|markers| {
                let markers: Vec<u32> = markers.into_iter().collect();
                (1..=markers.len()).map(|i| set(&markers[..i])).collect::<Vec<State>>()
            })
            .prop_shuffle()
    }

    proptest! {
        #[test]
        fn prop_farthest_leaves_first_is_never_longer(chain in shuffled_chain()) {
            let mut farthest_first = chain.clone();
            farthest_first.sort_by_key(|s| Reverse(s.len()));
            let sorted = build(&farthest_first);
            let shuffled = build(&chain);
            prop_assert_eq!(total_length(&sorted), farthest_first[0].len() as f64);
            prop_assert!(total_length(&sorted) <= total_length(&shuffled));
            prop_assert_eq!(observed(&sorted), observed(&shuffled));
        }

        #[test]
        fn prop_never_longer_than_star(
            leaves in prop::collection::vec(prop::collection::btree_set(0u32..8, 0..6), 1..7)
        ) {
            let builder = build(&leaves);
            prop_assert!(total_length(&builder) <= star_length(&leaves));

            let mut expected = leaves.clone();
            expected.sort();
            prop_assert_eq!(observed(&builder), expected);

            let ids: HashSet<u32> = builder.tree().all_nodes().iter().map(|n| n.node.content().id()).collect();
            prop_assert_eq!(ids.len(), builder.tree().all_nodes().len());
        }
    }
}
