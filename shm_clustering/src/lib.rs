// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! Grouping of candidate clones into disjoint clusters that may share an
//! ancestor.
//!
//! Clusterers work on a slice of items and a [`ClusterPredictor`] deciding
//! whether two items, or an item and an existing cluster, belong together. They
//! return clusters as sorted lists of indices into the input. Clusters of one
//! item are never returned.

use bit_set::BitSet;
use log::debug;
use serde::{Deserialize, Serialize};

pub mod adjacency;

pub use adjacency::AdjacencyMatrix;

/// Pairwise "same lineage" decisions used by the clusterers.
pub trait ClusterPredictor<T> {
    /// Whether the two items should be merged ahead of the others.
    fn prefer(&self, first: &T, second: &T) -> bool;

    fn from_the_same_cluster(&self, first: &T, second: &T) -> bool;

    /// Whether `item` joins a cluster. By default it joins if it is compatible
    /// with any member.
    fn fits_cluster(&self, cluster: &[&T], item: &T) -> bool {
        cluster.iter().any(|c| self.from_the_same_cluster(c, item))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClusteringAlgorithm {
    /// Disjoint maximal cliques, largest first.
    #[default]
    BronKerbosch,
    /// Incremental single linkage merging.
    SingleLinkage,
}

impl ClusteringAlgorithm {
    pub fn build_clusters<T, P: ClusterPredictor<T> + ?Sized>(
        self,
        predictor: &P,
        items: &[T],
    ) -> Vec<Vec<usize>> {
        match self {
            ClusteringAlgorithm::BronKerbosch => bron_kerbosch_clusters(predictor, items),
            ClusteringAlgorithm::SingleLinkage => single_linkage_clusters(predictor, items),
        }
    }
}

/// Connect every compatible pair, enumerate maximal cliques and keep them
/// greedily by descending size as long as they do not overlap a clique that
/// was already kept. Cliques of equal size keep their discovery order.
pub fn bron_kerbosch_clusters<T, P: ClusterPredictor<T> + ?Sized>(
    predictor: &P,
    items: &[T],
) -> Vec<Vec<usize>> {
    let mut matrix = AdjacencyMatrix::new(items.len());
    for i in 0..items.len() {
        for j in i + 1..items.len() {
            if predictor.from_the_same_cluster(&items[i], &items[j]) {
                matrix.set_connected(i, j);
            }
        }
    }

    let mut cliques: Vec<BitSet> = matrix
        .maximal_cliques()
        .into_iter()
        .filter(|c| c.len() > 1)
        .collect();
    cliques.sort_by_key(|c| std::cmp::Reverse(c.len()));

    let mut used = BitSet::with_capacity(items.len());
    let mut kept = Vec::new();
    for clique in cliques {
        if clique.is_disjoint(&used) {
            used.union_with(&clique);
            kept.push(clique.iter().collect::<Vec<_>>());
        }
    }
    debug!("{} items formed {} non overlapping cliques", items.len(), kept.len());
    kept
}

/// Single linkage in two passes.
///
/// The first pass adds each item to the clusters that hold a preferred partner
/// and accept the item; all accepting clusters are merged into the first one.
/// Items left alone are then offered to every cluster regardless of
/// preference, in the same manner.
pub fn single_linkage_clusters<T, P: ClusterPredictor<T> + ?Sized>(
    predictor: &P,
    items: &[T],
) -> Vec<Vec<usize>> {
    let mut clusters: Vec<Vec<usize>> = Vec::new();
    for next in 0..items.len() {
        let to_grow: Vec<usize> = (0..clusters.len())
            .filter(|&c| clusters[c].iter().any(|&i| predictor.prefer(&items[next], &items[i])))
            .filter(|&c| fits(predictor, items, &clusters[c], next))
            .collect();
        grow(&mut clusters, &to_grow, next);
    }

    let (left_alone, mut clusters): (Vec<_>, Vec<_>) = clusters.into_iter().partition(|c| c.len() == 1);
    for next in left_alone.into_iter().flatten() {
        let to_grow: Vec<usize> = (0..clusters.len())
            .filter(|&c| fits(predictor, items, &clusters[c], next))
            .collect();
        grow(&mut clusters, &to_grow, next);
    }

    let mut result: Vec<Vec<usize>> = clusters.into_iter().filter(|c| c.len() > 1).collect();
    for cluster in &mut result {
        cluster.sort_unstable();
    }
    debug!("{} items formed {} linked clusters", items.len(), result.len());
    result
}

fn fits<T, P: ClusterPredictor<T> + ?Sized>(predictor: &P, items: &[T], cluster: &[usize], next: usize) -> bool {
    let members: Vec<&T> = cluster.iter().map(|&i| &items[i]).collect();
    predictor.fits_cluster(&members, &items[next])
}

/// Add `next` to the first cluster of `to_grow` and merge the others into it,
/// or open a new cluster if none accepts it.
fn grow(clusters: &mut Vec<Vec<usize>>, to_grow: &[usize], next: usize) {
    let Some((&first, rest)) = to_grow.split_first() else {
        clusters.push(vec![next]);
        return;
    };
    clusters[first].push(next);
    for &other in rest {
        let moved = std::mem::take(&mut clusters[other]);
        clusters[first].extend(moved);
    }
    // indices in `rest` are ascending, drop from the back so earlier ones stay valid
    for &other in rest.iter().rev() {
        clusters.remove(other);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    /// Items are numbers; two are compatible if they differ by at most `reach`.
    struct Near {
        reach: i32,
    }

    impl ClusterPredictor<i32> for Near {
        fn prefer(&self, first: &i32, second: &i32) -> bool {
            first % 2 == second % 2
        }

        fn from_the_same_cluster(&self, first: &i32, second: &i32) -> bool {
            (first - second).abs() <= self.reach
        }
    }

    #[test]
    fn test_cliques_are_disjoint_and_largest_first() {
        let items = [0, 1, 2, 10, 11, 20];
        let clusters = bron_kerbosch_clusters(&Near { reach: 2 }, &items);
        assert_eq!(clusters, vec![vec![0, 1, 2], vec![3, 4]]);
    }

    #[test]
    fn test_overlapping_cliques_keep_first() {
        // 0-1-2 is a path: cliques {0,1} and {1,2} overlap
        let items = [0, 2, 4];
        let clusters = bron_kerbosch_clusters(&Near { reach: 2 }, &items);
        assert_eq!(clusters.len(), 1);
        assert!(clusters[0].contains(&1));
    }

    #[test]
    fn test_single_linkage_chains() {
        let items = [0, 2, 4, 6, 30, 31, 50];
        let clusters = single_linkage_clusters(&Near { reach: 2 }, &items);
        assert_eq!(clusters, vec![vec![0, 1, 2, 3], vec![4, 5]]);
    }

    #[test]
    fn test_single_linkage_merges_bridged_clusters() {
        // 4 bridges the clusters of 0 and 8
        let items = [0, 8, 4];
        let clusters = single_linkage_clusters(&Near { reach: 4 }, &items);
        assert_eq!(clusters, vec![vec![0, 1, 2]]);
    }

    #[test]
    fn test_empty_input() {
        let items: [i32; 0] = [];
        assert!(ClusteringAlgorithm::BronKerbosch.build_clusters(&Near { reach: 1 }, &items).is_empty());
        assert!(ClusteringAlgorithm::SingleLinkage.build_clusters(&Near { reach: 1 }, &items).is_empty());
    }

    proptest! {
        #[test]
        fn prop_cliques_are_deterministic_and_disjoint(items in prop::collection::vec(0i32..60, 0..25)) {
            let predictor = Near { reach: 3 };
            let first = bron_kerbosch_clusters(&predictor, &items);
            let second = bron_kerbosch_clusters(&predictor, &items);
            prop_assert_eq!(&first, &second);
            let mut seen = vec![false; items.len()];
            for cluster in &first {
                prop_assert!(cluster.len() > 1);
                for &i in cluster {
                    prop_assert!(!seen[i]);
                    seen[i] = true;
                }
            }
        }
    }
}
