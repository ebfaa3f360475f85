// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! Point edits against a reference sequence and the algebra over sorted lists of
//! them.
//!
//! Positions always refer to the sequence the edits are applied to. An insertion
//! at position `p` is placed before letter `p`; `p` may equal the sequence length
//! for trailing insertions. Within one list, insertions at a position precede a
//! substitution or deletion at the same position, and consecutive insertions at
//! one position are kept in the order of the inserted letters.

use crate::align::align_global;
use crate::error::AlgebraError;
use crate::range::SeqRange;
use crate::scoring::AlignmentScoring;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A single edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mutation {
    Substitution { position: usize, from: u8, to: u8 },
    Deletion { position: usize, from: u8 },
    Insertion { position: usize, to: u8 },
}

impl Mutation {
    pub fn position(&self) -> usize {
        match *self {
            Mutation::Substitution { position, .. }
            | Mutation::Deletion { position, .. }
            | Mutation::Insertion { position, .. } => position,
        }
    }

    pub fn is_insertion(&self) -> bool {
        matches!(self, Mutation::Insertion { .. })
    }

    pub fn is_deletion(&self) -> bool {
        matches!(self, Mutation::Deletion { .. })
    }

    pub fn is_substitution(&self) -> bool {
        matches!(self, Mutation::Substitution { .. })
    }

    /// Reference letter consumed by the edit.
    pub fn from(&self) -> Option<u8> {
        match *self {
            Mutation::Substitution { from, .. } | Mutation::Deletion { from, .. } => Some(from),
            Mutation::Insertion { .. } => None,
        }
    }

    /// Letter produced by the edit.
    pub fn to(&self) -> Option<u8> {
        match *self {
            Mutation::Substitution { to, .. } | Mutation::Insertion { to, .. } => Some(to),
            Mutation::Deletion { .. } => None,
        }
    }

    pub fn with_position(&self, position: usize) -> Mutation {
        match *self {
            Mutation::Substitution { from, to, .. } => Mutation::Substitution { position, from, to },
            Mutation::Deletion { from, .. } => Mutation::Deletion { position, from },
            Mutation::Insertion { to, .. } => Mutation::Insertion { position, to },
        }
    }

    fn moved(&self, offset: isize) -> Mutation {
        self.with_position(self.position().wrapping_add_signed(offset))
    }

    /// Sort key: insertions go before the other edit at the same position.
    fn order_key(&self) -> (usize, u8) {
        (self.position(), u8::from(!self.is_insertion()))
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Mutation::Substitution { position, from, to } => {
                write!(f, "S{}{}{}", from as char, position, to as char)
            }
            Mutation::Deletion { position, from } => write!(f, "D{}{}", from as char, position),
            Mutation::Insertion { position, to } => write!(f, "I{}{}", position, to as char),
        }
    }
}

/// Position of a reference letter after the edits were applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seq2Position {
    /// The letter survived at this position.
    Present(usize),
    /// The letter was deleted; `next` is where the following surviving letter sits.
    Deleted { next: usize },
}

impl Seq2Position {
    /// The surviving position, or the position right after the deleted run.
    pub fn position(&self) -> usize {
        match *self {
            Seq2Position::Present(p) | Seq2Position::Deleted { next: p } => p,
        }
    }
}

/// Sorted list of edits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Mutations(Vec<Mutation>);

impl Mutations {
    pub const fn empty() -> Self {
        Mutations(Vec::new())
    }

    /// Edits in any order; sorted into canonical order, keeping the relative order
    /// of insertions at one position.
    pub fn new(mut mutations: Vec<Mutation>) -> Self {
        mutations.sort_by_key(Mutation::order_key);
        Mutations(mutations)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Mutation> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Mutation] {
        &self.0
    }

    pub fn count_insertions_at(&self, position: usize) -> usize {
        self.0
            .iter()
            .filter(|m| m.is_insertion() && m.position() == position)
            .count()
    }

    /// Insertions minus deletions.
    pub fn length_delta(&self) -> isize {
        self.0
            .iter()
            .map(|m| match m {
                Mutation::Insertion { .. } => 1,
                Mutation::Deletion { .. } => -1,
                Mutation::Substitution { .. } => 0,
            })
            .sum()
    }

    /// Apply the edits to `seq`.
    pub fn mutate(&self, seq: &[u8]) -> Vec<u8> {
        let delta = self.length_delta();
        let mut out = Vec::with_capacity(seq.len().saturating_add_signed(delta));
        let mut next = 0;
        for m in &self.0 {
            let p = m.position().min(seq.len());
            if p > next {
                out.extend_from_slice(&seq[next..p]);
                next = p;
            }
            match *m {
                Mutation::Insertion { to, .. } => out.push(to),
                Mutation::Substitution { to, .. } => {
                    out.push(to);
                    next = p + 1;
                }
                Mutation::Deletion { .. } => next = p + 1,
            }
        }
        if next < seq.len() {
            out.extend_from_slice(&seq[next..]);
        }
        out
    }

    /// Edits that turn the mutated sequence back into the reference, positioned on
    /// the mutated sequence.
    pub fn invert(&self) -> Mutations {
        let mut shift: isize = 0;
        let inverted = self
            .0
            .iter()
            .map(|m| {
                let p = m.position().wrapping_add_signed(shift);
                match *m {
                    Mutation::Substitution { from, to, .. } => Mutation::Substitution {
                        position: p,
                        from: to,
                        to: from,
                    },
                    Mutation::Deletion { from, .. } => {
                        shift -= 1;
                        Mutation::Insertion { position: p, to: from }
                    }
                    Mutation::Insertion { to, .. } => {
                        shift += 1;
                        Mutation::Deletion { position: p, from: to }
                    }
                }
            })
            .collect();
        Mutations::new(inverted)
    }

    /// Compose `self` (seq1 to seq2) with `other` (seq2 to seq3) into edits from
    /// seq1 to seq3.
    pub fn combine_with(&self, other: &Mutations) -> Mutations {
        let first = &self.0;
        let second = &other.0;
        let (mut i, mut j) = (0, 0);
        // p1 in seq1 corresponds to p2 in seq2 while no edit of `self` intervenes.
        let (mut p1, mut p2): (isize, isize) = (0, 0);
        let mut out = Vec::with_capacity(first.len() + second.len());

        loop {
            let next_first = first.get(i).map(|m| p2 + (m.position() as isize - p1));
            let next_second = second.get(j).map(|m| m.position() as isize);
            let take_second = match (next_first, next_second) {
                (None, None) => break,
                (None, Some(_)) => true,
                (Some(q1), Some(q2)) => q2 < q1,
                (Some(_), None) => false,
            };

            if take_second {
                // Edit of a letter that `self` left untouched.
                let m = second[j];
                j += 1;
                let b = m.position() as isize;
                p1 += b - p2;
                p2 = b;
                out.push(m.with_position(p1 as usize));
                if !m.is_insertion() {
                    p1 += 1;
                    p2 += 1;
                }
                continue;
            }

            let m = first[i];
            i += 1;
            let q = p2 + (m.position() as isize - p1);
            p1 = m.position() as isize;
            p2 = q;
            let at = p1 as usize;

            match m {
                Mutation::Deletion { from, .. } => {
                    // Later edits at this point of seq2 belong after the deleted letter.
                    out.push(Mutation::Deletion { position: at, from });
                    p1 += 1;
                }
                Mutation::Insertion { to, .. } => {
                    match edits_of_letter(second, &mut j, q, at, &mut out) {
                        Some(Mutation::Substitution { to: later, .. }) => {
                            out.push(Mutation::Insertion { position: at, to: later })
                        }
                        Some(_) => {}
                        None => out.push(Mutation::Insertion { position: at, to }),
                    }
                    p2 += 1;
                }
                Mutation::Substitution { from, to, .. } => {
                    match edits_of_letter(second, &mut j, q, at, &mut out) {
                        Some(Mutation::Substitution { to: later, .. }) => {
                            if later != from {
                                out.push(Mutation::Substitution { position: at, from, to: later });
                            }
                        }
                        Some(_) => out.push(Mutation::Deletion { position: at, from }),
                        None => out.push(Mutation::Substitution { position: at, from, to }),
                    }
                    p1 += 1;
                    p2 += 1;
                }
            }
        }
        Mutations::new(out)
    }

    /// Where reference letter `position` ends up after the edits.
    pub fn convert_to_seq2_position(&self, position: usize) -> Seq2Position {
        let mut shift: isize = 0;
        let mut deleted = false;
        for m in &self.0 {
            let p = m.position();
            if p > position {
                break;
            }
            match m {
                Mutation::Insertion { .. } => shift += 1,
                Mutation::Deletion { .. } if p < position => shift -= 1,
                Mutation::Deletion { .. } => deleted = true,
                Mutation::Substitution { .. } => {}
            }
        }
        let p2 = position.wrapping_add_signed(shift);
        if deleted {
            Seq2Position::Deleted { next: p2 }
        } else {
            Seq2Position::Present(p2)
        }
    }

    /// Range in the mutated sequence spanned by the reference range, including
    /// insertions at both of its bounds.
    pub fn project_range(&self, range: SeqRange) -> SeqRange {
        let from = self.convert_to_seq2_position(range.lower).position()
            - self.count_insertions_at(range.lower);
        let to = self.convert_to_seq2_position(range.upper).position();
        SeqRange::new(from, to)
    }

    pub fn move_by(&self, offset: isize) -> Mutations {
        Mutations(self.0.iter().map(|m| m.moved(offset)).collect())
    }

    /// Append edits that lie after the edits of `self`.
    pub fn concat(&self, other: &Mutations) -> Mutations {
        let mut all = self.0.clone();
        all.extend_from_slice(&other.0);
        Mutations::new(all)
    }

    /// Edits that fall into `range`. Insertions at the lower bound are kept only if
    /// `include_first_inserts`; insertions at the upper bound are always kept.
    pub fn extract_absolute_mutations(&self, range: SeqRange, include_first_inserts: bool) -> Mutations {
        Mutations(
            self.0
                .iter()
                .filter(|m| {
                    let p = m.position();
                    if p == range.lower {
                        if m.is_insertion() {
                            include_first_inserts
                        } else {
                            p < range.upper
                        }
                    } else if p == range.upper {
                        m.is_insertion()
                    } else {
                        range.lower < p && p < range.upper
                    }
                })
                .copied()
                .collect(),
        )
    }

    /// Edits shared by both lists. Runs of insertions at one position are aligned
    /// against each other and the letters of the first run that survive the
    /// alignment are kept.
    pub fn intersection(&self, other: &Mutations) -> Mutations {
        let mut result = Vec::new();
        self.find_intersections(other, |m| result.push(m));
        Mutations(result)
    }

    pub fn intersection_count(&self, other: &Mutations) -> usize {
        let mut count = 0;
        self.find_intersections(other, |_| count += 1);
        count
    }

    fn find_intersections(&self, other: &Mutations, mut callback: impl FnMut(Mutation)) {
        if self.is_empty() || other.is_empty() {
            return;
        }
        let first = &self.0;
        let second = &other.0;
        let (mut i, mut j) = (0, 0);
        while i < first.len() && j < second.len() {
            let position = first[i].position();
            let position_of_second = second[j].position();
            if position < position_of_second {
                i += 1;
                continue;
            }
            if position > position_of_second {
                j += 1;
                continue;
            }

            let inserted_in_first = take_insertions(first, &mut i, position);
            let inserted_in_second = take_insertions(second, &mut j, position);
            if !inserted_in_first.is_empty() && !inserted_in_second.is_empty() {
                let between = align_global(
                    &AlignmentScoring::blast_linear(),
                    &inserted_in_first,
                    &inserted_in_second,
                );
                let changed: Vec<usize> = between
                    .mutations
                    .iter()
                    .filter(|m| !m.is_insertion())
                    .map(Mutation::position)
                    .collect();
                for (k, &to) in inserted_in_first.iter().enumerate() {
                    if !changed.contains(&k) {
                        callback(Mutation::Insertion { position, to });
                    }
                }
            } else if i < first.len() && j < second.len() && first[i] == second[j] {
                callback(first[i]);
            }

            if inserted_in_first.is_empty() {
                i += 1;
            }
            if inserted_in_second.is_empty() {
                j += 1;
            }
        }
    }

    /// Drop every edit that also occurs in `other`; each edit of `other` removes at
    /// most one edit.
    pub fn without(&self, other: &Mutations) -> Mutations {
        if other.is_empty() {
            return self.clone();
        }
        let mut consumed = vec![false; other.len()];
        let mut j = 0;
        let kept = self
            .0
            .iter()
            .filter(|m| {
                while j < other.0.len() && other.0[j].order_key() < m.order_key() {
                    j += 1;
                }
                let same_key = other.0[j..]
                    .iter()
                    .take_while(|o| o.order_key() == m.order_key())
                    .count();
                for k in j..j + same_key {
                    if !consumed[k] && other.0[k] == **m {
                        consumed[k] = true;
                        return false;
                    }
                }
                true
            })
            .copied()
            .collect();
        Mutations(kept)
    }
}

/// Push the insertions of `second` placed before seq2 letter `q` as insertions at
/// `at`, then consume and return the edit of that letter, if any.
fn edits_of_letter(
    second: &[Mutation],
    j: &mut usize,
    q: isize,
    at: usize,
    out: &mut Vec<Mutation>,
) -> Option<Mutation> {
    while let Some(Mutation::Insertion { position, to }) = second.get(*j) {
        if *position as isize != q {
            break;
        }
        out.push(Mutation::Insertion { position: at, to: *to });
        *j += 1;
    }
    let on_letter = second
        .get(*j)
        .filter(|s| !s.is_insertion() && s.position() as isize == q)
        .copied();
    if on_letter.is_some() {
        *j += 1;
    }
    on_letter
}

fn take_insertions(mutations: &[Mutation], index: &mut usize, position: usize) -> Vec<u8> {
    let mut letters = Vec::new();
    while let Some(Mutation::Insertion { position: p, to }) = mutations.get(*index) {
        if *p != position {
            break;
        }
        letters.push(*to);
        *index += 1;
    }
    letters
}

impl<'a> IntoIterator for &'a Mutations {
    type Item = &'a Mutation;
    type IntoIter = std::slice::Iter<'a, Mutation>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<Mutation> for Mutations {
    fn from_iter<I: IntoIterator<Item = Mutation>>(iter: I) -> Self {
        Mutations::new(iter.into_iter().collect())
    }
}

impl fmt::Display for Mutations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for m in &self.0 {
            write!(f, "{m}")?;
        }
        Ok(())
    }
}

impl From<Mutations> for String {
    fn from(m: Mutations) -> String {
        m.to_string()
    }
}

impl TryFrom<String> for Mutations {
    type Error = AlgebraError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl FromStr for Mutations {
    type Err = AlgebraError;

    /// Parse the compact form, e.g. `SA12TDG15I16C`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        let err = || AlgebraError::Parse(s.to_string());
        let mut result = Vec::new();
        let mut i = 0;
        let letter_at = |i: usize| bytes.get(i).copied().filter(|&c| crate::nucleotide::is_nucleotide(c));
        while i < bytes.len() {
            let kind = bytes[i];
            i += 1;
            let from = if kind == b'S' || kind == b'D' {
                let c = letter_at(i).ok_or_else(err)?;
                i += 1;
                Some(c)
            } else {
                None
            };
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            let position: usize = s[start..i].parse().map_err(|_| err())?;
            let m = match (kind, from) {
                (b'S', Some(from)) => {
                    let to = letter_at(i).ok_or_else(err)?;
                    i += 1;
                    Mutation::Substitution { position, from, to }
                }
                (b'D', Some(from)) => Mutation::Deletion { position, from },
                (b'I', None) => {
                    let to = letter_at(i).ok_or_else(err)?;
                    i += 1;
                    Mutation::Insertion { position, to }
                }
                _ => return Err(err()),
            };
            result.push(m);
        }
        Ok(Mutations::new(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn m(s: &str) -> Mutations {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let mutations = m("SA2TDC5I7G");
        assert_eq!(mutations.len(), 3);
        assert_eq!(mutations.to_string(), "SA2TDC5I7G");
        assert!("SX2T".parse::<Mutations>().is_err());
        assert!("Q12".parse::<Mutations>().is_err());
    }

    #[test]
    fn test_mutate() {
        let seq = b"ACGTACGT";
        assert_eq!(m("SA0T").mutate(seq), b"TCGTACGT".to_vec());
        assert_eq!(m("DC1").mutate(seq), b"AGTACGT".to_vec());
        assert_eq!(m("I0G").mutate(seq), b"GACGTACGT".to_vec());
        assert_eq!(m("I8G").mutate(seq), b"ACGTACGTG".to_vec());
        assert_eq!(m("I2TI2TSG2A").mutate(seq), b"ACTTATACGT".to_vec());
    }

    #[test]
    fn test_invert() {
        let seq = b"ACGTACGT";
        let mutations = m("SA0TDC1I4GDA4");
        let mutated = mutations.mutate(seq);
        assert_eq!(mutations.invert().mutate(&mutated), seq.to_vec());
    }

    #[test]
    fn test_convert_to_seq2_position() {
        let mutations = m("I2TDG2");
        assert_eq!(mutations.convert_to_seq2_position(1), Seq2Position::Present(1));
        assert_eq!(mutations.convert_to_seq2_position(2), Seq2Position::Deleted { next: 3 });
        assert_eq!(mutations.convert_to_seq2_position(3), Seq2Position::Present(3));
    }

    #[test]
    fn test_extract_boundaries() {
        let mutations = m("I2TSG2AI5CSC5G");
        let range = SeqRange::new(2, 5);
        assert_eq!(mutations.extract_absolute_mutations(range, true), m("I2TSG2AI5C"));
        assert_eq!(mutations.extract_absolute_mutations(range, false), m("SG2AI5C"));
    }

    #[test]
    fn test_intersection() {
        assert_eq!(m("SA1TSC3G").intersection(&m("SA1TSC3A")), m("SA1T"));
        assert_eq!(m("SA1T").intersection(&Mutations::empty()), Mutations::empty());
        assert_eq!(m("I3AI3C").intersection(&m("I3AI3C")), m("I3AI3C"));
        assert_eq!(m("I3ASA3C").intersection(&m("SA3C")), m("SA3C"));
        assert_eq!(m("SA1TSC3G").intersection_count(&m("SA1TSC3G")), 2);
    }

    #[test]
    fn test_without() {
        assert_eq!(m("SA1TSC3GSG5A").without(&m("SC3G")), m("SA1TSG5A"));
        assert_eq!(m("SG10A").without(&m("SA3CSG10A")), Mutations::empty());
        assert_eq!(m("I3AI3A").without(&m("I3A")), m("I3A"));
    }

    #[test]
    fn test_project_range() {
        let mutations = m("I2TDG2DT3");
        assert_eq!(mutations.project_range(SeqRange::new(2, 4)), SeqRange::new(2, 3));
        assert_eq!(mutations.project_range(SeqRange::new(0, 2)), SeqRange::new(0, 3));
    }

    fn seq_and_mutations() -> impl Strategy<Value = (Vec<u8>, Mutations)> {
        prop::collection::vec(prop::sample::select(b"ACGT".to_vec()), 1..30).prop_flat_map(|seq| {
            let len = seq.len();
            let seq2 = seq.clone();
            prop::collection::vec((0..=len, 0u8..3, prop::sample::select(b"ACGT".to_vec())), 0..6)
                .prop_map(move |raw| (seq2.clone(), random_mutations(&seq2, &raw)))
        })
    }

    /// Build a valid edit list: at most one substitution or deletion per position.
    fn random_mutations(seq: &[u8], raw: &[(usize, u8, u8)]) -> Mutations {
        let mut used = vec![false; seq.len()];
        let mut result = Vec::new();
        for &(position, kind, letter) in raw {
            if kind == 0 || position == seq.len() {
                result.push(Mutation::Insertion { position, to: letter });
            } else if !used[position] {
                used[position] = true;
                if kind == 1 && seq[position] != letter {
                    result.push(Mutation::Substitution { position, from: seq[position], to: letter });
                } else {
                    result.push(Mutation::Deletion { position, from: seq[position] });
                }
            }
        }
        Mutations::new(result)
    }

    proptest! {
        #[test]
        fn prop_invert_restores_reference((seq, mutations) in seq_and_mutations()) {
            let mutated = mutations.mutate(&seq);
            prop_assert_eq!(mutations.invert().mutate(&mutated), seq);
        }

        #[test]
        fn prop_combine_is_composition(
            (seq, first) in seq_and_mutations(),
            raw in prop::collection::vec((0usize..40, 0u8..3, prop::sample::select(b"ACGT".to_vec())), 0..6)
        ) {
            let middle = first.mutate(&seq);
            let raw: Vec<_> = raw.into_iter().map(|(p, k, l)| (p % (middle.len() + 1), k, l)).collect();
            let second = random_mutations(&middle, &raw);
            let combined = first.combine_with(&second);
            prop_assert_eq!(combined.mutate(&seq), second.mutate(&middle));
        }

        #[test]
        fn prop_difference_reaches_target(
            (seq, first) in seq_and_mutations(),
            raw in prop::collection::vec((0usize..40, 0u8..3, prop::sample::select(b"ACGT".to_vec())), 0..6)
        ) {
            let raw: Vec<_> = raw.into_iter().map(|(p, k, l)| (p % (seq.len() + 1), k, l)).collect();
            let second = random_mutations(&seq, &raw);
            let difference = first.invert().combine_with(&second);
            prop_assert_eq!(first.combine_with(&difference).mutate(&seq), second.mutate(&seq));
        }

        #[test]
        fn prop_project_range_matches_mutated_slice((seq, mutations) in seq_and_mutations(), a in 0usize..30, b in 0usize..30) {
            let (lower, upper) = (a.min(b) % (seq.len() + 1), a.max(b) % (seq.len() + 1));
            let (lower, upper) = (lower.min(upper), lower.max(upper));
            let range = SeqRange::new(lower, upper);
            let inside = mutations.extract_absolute_mutations(range, true);
            let projected = inside.project_range(range);
            let expected = inside.move_by(-(lower as isize)).mutate(&seq[lower..upper]);
            prop_assert_eq!(inside.mutate(&seq)[projected.as_range()].to_vec(), expected);
        }
    }
}
