// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! Undirected graph over `0..size` stored as one bit set of neighbors per vertex,
//! with maximal clique enumeration.

use bit_set::BitSet;

/// Symmetric adjacency matrix. Self loops are never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjacencyMatrix {
    rows: Vec<BitSet>,
}

impl AdjacencyMatrix {
    pub fn new(size: usize) -> Self {
        AdjacencyMatrix {
            rows: (0..size).map(|_| BitSet::with_capacity(size)).collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.rows.len()
    }

    pub fn set_connected(&mut self, i: usize, j: usize) {
        if i != j {
            self.rows[i].insert(j);
            self.rows[j].insert(i);
        }
    }

    #[cfg(test)]
    fn disconnect(&mut self, i: usize, j: usize) {
        self.rows[i].remove(j);
        self.rows[j].remove(i);
    }

    pub fn is_connected(&self, i: usize, j: usize) -> bool {
        self.rows[i].contains(j)
    }

    /// All maximal cliques, found with the Bron-Kerbosch algorithm with pivoting.
    ///
    /// Candidates are visited in ascending vertex order and the pivot is the first
    /// vertex of `P ∪ X` with the most neighbors in `P`, so the output order is a
    /// function of the matrix alone. Isolated vertices are reported as cliques of
    /// one.
    pub fn maximal_cliques(&self) -> Vec<BitSet> {
        let mut cliques = Vec::new();
        let all: BitSet = (0..self.size()).collect();
        self.extend_clique(BitSet::new(), all, BitSet::new(), &mut cliques);
        cliques
    }

    fn extend_clique(&self, r: BitSet, mut p: BitSet, mut x: BitSet, cliques: &mut Vec<BitSet>) {
        if p.is_empty() {
            if x.is_empty() && !r.is_empty() {
                cliques.push(r);
            }
            return;
        }

        let mut pivot = None;
        let mut best = 0;
        for u in p.union(&x) {
            let count = self.rows[u].intersection(&p).count();
            if pivot.is_none() || count > best {
                pivot = Some(u);
                best = count;
            }
        }
        let mut candidates = p.clone();
        if let Some(u) = pivot {
            candidates.difference_with(&self.rows[u]);
        }

        for v in &candidates {
            let neighbors = &self.rows[v];
            let mut next_r = r.clone();
            next_r.insert(v);
            let mut next_p = p.clone();
            next_p.intersect_with(neighbors);
            let mut next_x = x.clone();
            next_x.intersect_with(neighbors);
            self.extend_clique(next_r, next_p, next_x, cliques);
            p.remove(v);
            x.insert(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn set(items: &[usize]) -> BitSet {
        items.iter().copied().collect()
    }

    fn sample() -> AdjacencyMatrix {
        let mut matrix = AdjacencyMatrix::new(6);
        for (i, j) in [(0, 4), (0, 1), (1, 4), (1, 2), (2, 3), (3, 4), (3, 5)] {
            matrix.set_connected(i, j);
        }
        matrix
    }

    #[test]
    fn test_maximal_cliques() {
        let cliques = sample().maximal_cliques();
        assert_eq!(cliques.len(), 5);
        for expected in [set(&[0, 1, 4]), set(&[1, 2]), set(&[2, 3]), set(&[3, 4]), set(&[3, 5])] {
            assert!(cliques.contains(&expected), "missing {expected:?}");
        }
    }

    #[test]
    fn test_self_loops_are_ignored() {
        let mut matrix = sample();
        for i in 0..6 {
            matrix.set_connected(i, i);
        }
        assert_eq!(matrix.maximal_cliques(), sample().maximal_cliques());
        assert!(!matrix.is_connected(2, 2));
    }

    #[test]
    fn test_isolated_vertices() {
        let mut matrix = AdjacencyMatrix::new(3);
        matrix.set_connected(0, 2);
        let cliques = matrix.maximal_cliques();
        assert_eq!(cliques.len(), 2);
        assert!(cliques.contains(&set(&[0, 2])));
        assert!(cliques.contains(&set(&[1])));
        assert!(AdjacencyMatrix::new(0).maximal_cliques().is_empty());
    }

    #[test]
    fn test_disconnect() {
        let mut matrix = sample();
        matrix.disconnect(0, 1);
        assert!(!matrix.is_connected(1, 0));
        assert!(matrix.maximal_cliques().contains(&set(&[0, 4])));
    }
}
