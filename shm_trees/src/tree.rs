// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! Persistent rooted tree with weighted edges.
//!
//! Nodes are shared through `Arc`, so a tree is cheap to clone and an edit
//! copies only the path from the root to the edited node. Nodes are identified
//! by pointer when edited, which keeps copies of a tree independent.

use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Tree<C> {
    root: Arc<Node<C>>,
}

#[derive(Debug, Clone)]
pub struct Node<C> {
    content: C,
    links: Vec<NodeLink<C>>,
}

#[derive(Debug, Clone)]
pub struct NodeLink<C> {
    node: Arc<Node<C>>,
    distance: f64,
}

/// A node seen during traversal, with the link that leads to it.
#[derive(Debug)]
pub struct NodeWithParent<'a, C> {
    pub parent: Option<&'a Arc<Node<C>>>,
    pub node: &'a Arc<Node<C>>,
    pub distance: Option<f64>,
}

impl<C> Clone for NodeWithParent<'_, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for NodeWithParent<'_, C> {}

impl<C> NodeLink<C> {
    pub fn new(node: Arc<Node<C>>, distance: f64) -> Self {
        NodeLink { node, distance }
    }

    pub fn node(&self) -> &Arc<Node<C>> {
        &self.node
    }

    pub fn distance(&self) -> f64 {
        self.distance
    }
}

impl<C> Node<C> {
    pub fn new(content: C) -> Self {
        Node {
            content,
            links: Vec::new(),
        }
    }

    pub fn with_links(content: C, links: Vec<NodeLink<C>>) -> Self {
        Node { content, links }
    }

    pub fn content(&self) -> &C {
        &self.content
    }

    pub fn content_mut(&mut self) -> &mut C {
        &mut self.content
    }

    pub fn links(&self) -> &[NodeLink<C>] {
        &self.links
    }

    pub fn add_child(&mut self, child: Node<C>, distance: f64) {
        self.links.push(NodeLink::new(Arc::new(child), distance));
    }

    /// Drop the link to `what` and link `with` at the end instead.
    pub fn replace_child(&mut self, what: &Arc<Node<C>>, with: Node<C>, distance: f64) {
        self.links.retain(|l| !Arc::ptr_eq(&l.node, what));
        self.add_child(with, distance);
    }

    /// Children in link order.
    pub fn children(&self) -> impl Iterator<Item = &Arc<Node<C>>> {
        self.links.iter().map(|l| &l.node)
    }

    fn map<D>(&self, parent: Option<&C>, f: &mut impl FnMut(Option<&C>, &C) -> D) -> Node<D> {
        let content = f(parent, &self.content);
        let links = self
            .links
            .iter()
            .map(|l| NodeLink::new(Arc::new(l.node.map(Some(&self.content), f)), l.distance))
            .collect();
        Node { content, links }
    }
}

impl<C: Clone> Tree<C> {
    /// Copy of this tree with `target` replaced by the node `edit` makes of it.
    /// `None` if `target` is not part of the tree.
    pub fn replace_node(&self, target: &Arc<Node<C>>, edit: impl FnOnce(&Node<C>) -> Node<C>) -> Option<Tree<C>> {
        let mut path = Vec::new();
        if !find_path(&self.root, target, &mut path) {
            return None;
        }
        let mut rebuilt = edit(target);
        // path holds the chain of ancestors from the root down to the parent of target
        let mut replaced = target.clone();
        for ancestor in path.into_iter().rev() {
            let mut copy = Node::clone(&ancestor);
            let new_child = Arc::new(rebuilt);
            for link in &mut copy.links {
                if Arc::ptr_eq(&link.node, &replaced) {
                    link.node = new_child.clone();
                }
            }
            rebuilt = copy;
            replaced = ancestor;
        }
        Some(Tree {
            root: Arc::new(rebuilt),
        })
    }
}

fn find_path<C>(from: &Arc<Node<C>>, target: &Arc<Node<C>>, path: &mut Vec<Arc<Node<C>>>) -> bool {
    if Arc::ptr_eq(from, target) {
        return true;
    }
    path.push(from.clone());
    for child in from.children() {
        if find_path(child, target, path) {
            return true;
        }
    }
    path.pop();
    false
}

impl<C> Tree<C> {
    pub fn new(root: Node<C>) -> Self {
        Tree { root: Arc::new(root) }
    }

    pub fn root(&self) -> &Arc<Node<C>> {
        &self.root
    }

    /// Every node in preorder; children follow their link order.
    pub fn all_nodes(&self) -> Vec<NodeWithParent<'_, C>> {
        let mut result = Vec::new();
        let mut stack = vec![NodeWithParent {
            parent: None,
            node: &self.root,
            distance: None,
        }];
        while let Some(next) = stack.pop() {
            result.push(next);
            for link in next.node.links.iter().rev() {
                stack.push(NodeWithParent {
                    parent: Some(next.node),
                    node: &link.node,
                    distance: Some(link.distance),
                });
            }
        }
        result
    }

    /// Same shape with every content replaced by `f(parent content, content)`.
    pub fn map<D>(&self, mut f: impl FnMut(Option<&C>, &C) -> D) -> Tree<D> {
        Tree {
            root: Arc::new(self.root.map(None, &mut f)),
        }
    }
}
