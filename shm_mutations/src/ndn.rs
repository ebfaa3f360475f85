// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! Junction (NDN) specific operations.
//!
//! Junction edits are expressed against a placeholder of wildcards, so the usual
//! set operations are replaced by letter level rules that keep as much certainty
//! as the observations allow.

use crate::align::align_global;
use crate::mutation::{Mutation, Mutations};
use crate::nucleotide;
use crate::scoring::AlignmentScoring;

/// Edits describing the most likely common ancestor of two junctions expressed
/// against the same placeholder.
///
/// Identical edits are kept. Substitutions of the same position resolve to the
/// narrower letter when one strictly contains the other, and to their union
/// otherwise. Indels present in only one operand are dropped.
pub fn find_ndn_common_ancestor(first: &Mutations, second: &Mutations) -> Mutations {
    let at = |position: usize| first.iter().filter(move |m| m.position() == position);
    let mut result = Vec::new();
    for m in second {
        let position = m.position();
        if at(position).any(|f| f == m) {
            result.push(*m);
            continue;
        }
        if let Mutation::Substitution { from, to, .. } = *m {
            let other = at(position).find_map(|f| match *f {
                Mutation::Substitution { to, .. } => Some(to),
                _ => None,
            });
            if let Some(other) = other {
                let to = nucleotide::combine(to, other);
                if to != from {
                    result.push(Mutation::Substitution { position, from, to });
                }
            }
        }
    }
    Mutations::new(result)
}

/// Edits of a child junction re-expressed after its parent was replaced.
///
/// A child substitution at a position the parent also substitutes picks the
/// parent letter when that letter is one of the child's possibilities, which
/// removes the mutation between them. Indels are kept unchanged.
pub fn concrete_ndn_child(parent: &Mutations, child: &Mutations) -> Mutations {
    let mut result = Vec::with_capacity(child.len());
    for m in child {
        let Mutation::Substitution { position, from, to } = *m else {
            result.push(*m);
            continue;
        };
        let of_parent = parent.iter().find_map(|p| match *p {
            Mutation::Substitution { position: q, to, .. } if q == position => Some(to),
            _ => None,
        });
        match of_parent {
            None => result.push(*m),
            Some(parent_letter) => {
                let to = nucleotide::concrete_child(parent_letter, to);
                if to != from {
                    result.push(Mutation::Substitution { position, from, to });
                }
            }
        }
    }
    Mutations::new(result)
}

/// Alignment distance between two junction sequences, normalized by the
/// shorter length.
///
/// Two empty junctions are identical; an empty junction is infinitely far from
/// a non-empty one.
pub fn ndn_distance(scoring: &AlignmentScoring, first: &[u8], second: &[u8]) -> f64 {
    match (first.is_empty(), second.is_empty()) {
        (true, true) => return 0.0,
        (true, false) | (false, true) => return f64::INFINITY,
        _ => {}
    }
    let score = align_global(scoring, first, second).score;
    let max_score = scoring.max_score(first.len()).max(scoring.max_score(second.len()));
    (max_score - score) as f64 / first.len().min(second.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn m(s: &str) -> Mutations {
        s.parse().unwrap()
    }

    #[test]
    fn test_common_ancestor() {
        // shared edit kept, different letters widen, strict containment narrows
        let first = m("SN0ASN1ASN2RDN4");
        let second = m("SN0ASN1CSN2GSN3T");
        assert_eq!(find_ndn_common_ancestor(&first, &second), m("SN0ASN1MSN2G"));
    }

    #[test]
    fn test_common_ancestor_drops_full_wildcard() {
        assert_eq!(find_ndn_common_ancestor(&m("SN0R"), &m("SN0Y")), Mutations::empty());
    }

    #[test]
    fn test_concrete_child() {
        let parent = m("SN0ASN1CSN3G");
        let child = m("SN0RSN1TI2ASN3G");
        // R covers A so the child takes the parent letter, T is a real mutation
        assert_eq!(concrete_ndn_child(&parent, &child), m("SN0ASN1TI2ASN3G"));
    }

    #[test]
    fn test_ndn_distance() {
        let scoring = AlignmentScoring::ndn_default();
        assert_eq!(ndn_distance(&scoring, b"", b""), 0.0);
        assert!(ndn_distance(&scoring, b"", b"ACG").is_infinite());
        assert_eq!(ndn_distance(&scoring, b"ACGTA", b"ACGTA"), 0.0);
        // one mismatch: (25 - (20 - 4)) / 5
        assert_eq!(ndn_distance(&scoring, b"ACGTA", b"ACCTA"), 9.0 / 5.0);
    }
}
