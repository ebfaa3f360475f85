// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! Per group view of clones: the germline ranges all clones share and each
//! clone's edits split into the parts a tree works with.

use crate::clone::{CloneWrapper, GeneHit, GeneLibrary, GeneType, HitAlignment, VJBase};
use anyhow::{bail, ensure, Result};
use shm_mutations::{Mutations, SeqRange};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Germline ranges outside of CDR3 that are covered by enough clones of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonAlignmentRanges {
    ranges: Vec<SeqRange>,
}

impl CommonAlignmentRanges {
    /// Ranges are counted per alignment after the CDR3 part is cut off. A range
    /// is supported by every counted range that contains it; the maximal ranges
    /// supported by at least `max(floor(n * min_portion), ceil(n / 2))` of `n`
    /// clones are kept.
    pub fn calculate<'a>(
        hits: impl IntoIterator<Item = &'a GeneHit>,
        clones_count: usize,
        min_portion: f64,
        gene_type: GeneType,
        cdr3_boundary: usize,
    ) -> Result<Self> {
        ensure!(
            min_portion >= 0.5,
            "portion of clones for common alignment ranges must be at least 0.5, got {min_portion}"
        );
        let threshold = ((clones_count as f64 * min_portion).floor() as usize).max(clones_count.div_ceil(2));

        let mut counts: BTreeMap<SeqRange, usize> = BTreeMap::new();
        for hit in hits {
            for alignment in &hit.alignments {
                let range = without_cdr3(alignment.germline_range, gene_type, cdr3_boundary);
                if !range.is_empty() {
                    *counts.entry(range).or_default() += 1;
                }
            }
        }

        let supported: Vec<SeqRange> = counts
            .keys()
            .filter(|&range| {
                let support: usize = counts
                    .iter()
                    .filter(|(other, _)| other.contains_range(range))
                    .map(|(_, count)| count)
                    .sum();
                support >= threshold
            })
            .copied()
            .collect();
        let ranges: Vec<SeqRange> = supported
            .iter()
            .filter(|&range| !supported.iter().any(|other| other != range && other.contains_range(range)))
            .copied()
            .collect();
        for (i, first) in ranges.iter().enumerate() {
            for second in &ranges[i + 1..] {
                if first.lower < second.upper && second.lower < first.upper {
                    bail!("common alignment ranges {first} and {second} intersect");
                }
            }
        }
        Ok(CommonAlignmentRanges { ranges })
    }

    pub fn ranges(&self) -> &[SeqRange] {
        &self.ranges
    }

    /// Every alignment of the hit contains one of the common ranges.
    pub fn contains_hit(&self, hit: &GeneHit) -> bool {
        hit.alignments
            .iter()
            .all(|a| self.ranges.iter().any(|r| a.germline_range.contains_range(r)))
    }
}

fn without_cdr3(range: SeqRange, gene_type: GeneType, cdr3_boundary: usize) -> SeqRange {
    match gene_type {
        GeneType::Variable => SeqRange::new(range.lower, range.upper.min(cdr3_boundary)),
        GeneType::Joining => SeqRange::new(range.lower.max(cdr3_boundary), range.upper),
    }
}

/// Whether leading insertions belong to each of consecutive germline parts.
/// The first V part starts an alignment; the first J part follows the J part in
/// CDR3. Later parts own them when they do not touch the previous part.
pub fn outside_flags(ranges: &[SeqRange], gene_type: GeneType) -> Vec<bool> {
    ranges
        .iter()
        .enumerate()
        .map(|(i, range)| match i {
            0 => gene_type == GeneType::Variable,
            _ => ranges[i - 1].upper != range.lower,
        })
        .collect()
}

/// Edits of the alignment that covers `range`.
fn alignment_covering<'a>(hit: &'a GeneHit, range: &SeqRange) -> Option<&'a HitAlignment> {
    hit.alignments.iter().find(|a| a.germline_range.contains_range(range))
}

/// The part of a gene alignment that lies inside the CDR3, as far as the clone
/// was aligned.
fn own_range_in_cdr3(hit: &GeneHit, gene_type: GeneType, cdr3_boundary: usize) -> (Mutations, SeqRange) {
    let covering = hit.alignments.iter().find(|a| {
        a.germline_range.lower <= cdr3_boundary && cdr3_boundary <= a.germline_range.upper
    });
    match (covering, gene_type) {
        (None, _) => (Mutations::empty(), SeqRange::new(cdr3_boundary, cdr3_boundary)),
        (Some(a), GeneType::Variable) => {
            let range = SeqRange::new(cdr3_boundary, a.germline_range.upper);
            (a.mutations.extract_absolute_mutations(range, false), range)
        }
        (Some(a), GeneType::Joining) => {
            let range = SeqRange::new(a.germline_range.lower, cdr3_boundary);
            (a.mutations.extract_absolute_mutations(range, true), range)
        }
    }
}

/// Germline data and shared ranges of all clones with one [`VJBase`].
#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub vj_base: VJBase,
    pub v_sequence: Arc<[u8]>,
    pub j_sequence: Arc<[u8]>,
    pub v_ranges: CommonAlignmentRanges,
    pub j_ranges: CommonAlignmentRanges,
    /// The shortest V part in CDR3 among the clones.
    pub v_range_in_cdr3: SeqRange,
    /// The shortest J part in CDR3 among the clones.
    pub j_range_in_cdr3: SeqRange,
    v_alleles: Vec<Mutations>,
    j_alleles: Vec<Mutations>,
}

impl GroupInfo {
    pub fn new(
        library: &GeneLibrary,
        vj_base: &VJBase,
        clones: &[Arc<CloneWrapper>],
        min_portion: f64,
        related_alleles: &HashMap<String, Vec<Mutations>>,
    ) -> Result<Self> {
        let v_gene = library.require(&vj_base.v_gene)?;
        let j_gene = library.require(&vj_base.j_gene)?;
        let cdr3_begin = v_gene.reference.cdr3_boundary;
        let cdr3_end = j_gene.reference.cdr3_boundary;

        let v_ranges = CommonAlignmentRanges::calculate(
            clones.iter().map(|c| c.hit(GeneType::Variable)),
            clones.len(),
            min_portion,
            GeneType::Variable,
            cdr3_begin,
        )?;
        let j_ranges = CommonAlignmentRanges::calculate(
            clones.iter().map(|c| c.hit(GeneType::Joining)),
            clones.len(),
            min_portion,
            GeneType::Joining,
            cdr3_end,
        )?;
        let v_range_in_cdr3 = clones
            .iter()
            .map(|c| own_range_in_cdr3(c.hit(GeneType::Variable), GeneType::Variable, cdr3_begin).1)
            .min_by_key(SeqRange::len)
            .unwrap_or(SeqRange::new(cdr3_begin, cdr3_begin));
        let j_range_in_cdr3 = clones
            .iter()
            .map(|c| own_range_in_cdr3(c.hit(GeneType::Joining), GeneType::Joining, cdr3_end).1)
            .min_by_key(SeqRange::len)
            .unwrap_or(SeqRange::new(cdr3_end, cdr3_end));

        Ok(GroupInfo {
            vj_base: vj_base.clone(),
            v_sequence: v_gene.sequence.clone(),
            j_sequence: j_gene.sequence.clone(),
            v_ranges,
            j_ranges,
            v_range_in_cdr3,
            j_range_in_cdr3,
            v_alleles: related_alleles.get(&vj_base.v_gene).cloned().unwrap_or_default(),
            j_alleles: related_alleles.get(&vj_base.j_gene).cloned().unwrap_or_default(),
        })
    }

    pub fn contains_clone(&self, clone: &CloneWrapper) -> bool {
        self.v_ranges.contains_hit(clone.hit(GeneType::Variable))
            && self.j_ranges.contains_hit(clone.hit(GeneType::Joining))
    }

    /// Split the clone's edits from the V and J germlines by part. `None` if the
    /// clone does not cover the common ranges of the group.
    pub fn rebase_from_germline(&self, clone: &Arc<CloneWrapper>) -> Option<MutationsFromGermline> {
        if !self.contains_clone(clone) {
            return None;
        }
        let v_hit = clone.hit(GeneType::Variable);
        let j_hit = clone.hit(GeneType::Joining);
        let outside = |hit: &GeneHit, ranges: &CommonAlignmentRanges, gene_type| -> Option<Vec<Mutations>> {
            ranges
                .ranges()
                .iter()
                .zip(outside_flags(ranges.ranges(), gene_type))
                .map(|(range, flag)| {
                    alignment_covering(hit, range).map(|a| a.mutations.extract_absolute_mutations(*range, flag))
                })
                .collect()
        };
        let v_outside = outside(v_hit, &self.v_ranges, GeneType::Variable)?;
        let j_outside = outside(j_hit, &self.j_ranges, GeneType::Joining)?;

        let (v_own, v_own_range) = own_range_in_cdr3(v_hit, GeneType::Variable, self.v_range_in_cdr3.lower);
        let (j_own, j_own_range) = own_range_in_cdr3(j_hit, GeneType::Joining, self.j_range_in_cdr3.upper);
        let v_in_cdr3 = v_own.extract_absolute_mutations(self.v_range_in_cdr3, false);
        let j_in_cdr3 = j_own.extract_absolute_mutations(self.j_range_in_cdr3, true);

        let cdr3: Arc<[u8]> = clone.cdr3().to_ascii_uppercase().into();
        let known_ndn = between_germline_parts(
            &cdr3,
            self.v_range_in_cdr3.len() as isize + v_in_cdr3.length_delta(),
            self.j_range_in_cdr3.len() as isize + j_in_cdr3.length_delta(),
        );

        Some(MutationsFromGermline {
            clone: clone.clone(),
            v_outside,
            v_in_cdr3,
            v_own_in_cdr3: v_own,
            v_own_range,
            known_ndn,
            j_own_in_cdr3: j_own,
            j_own_range,
            j_in_cdr3,
            j_outside,
            cdr3,
        })
    }

    /// Edits two clones share in V and J, ignoring edits explained by another
    /// allele of the same gene. For each gene the allele hypothesis with the
    /// fewest shared edits counts.
    pub fn common_mutations_count(&self, first: &MutationsFromGermline, second: &MutationsFromGermline) -> usize {
        let count = |alleles: &[Mutations], a: Vec<&Mutations>, b: Vec<&Mutations>| {
            std::iter::once(None)
                .chain(alleles.iter().map(Some))
                .map(|allele| {
                    a.iter()
                        .zip(&b)
                        .map(|(x, y)| match allele {
                            None => x.intersection_count(y),
                            Some(allele) => x.without(allele).intersection_count(&y.without(allele)),
                        })
                        .sum::<usize>()
                })
                .min()
                .unwrap_or(0)
        };
        count(
            &self.v_alleles,
            first.v_parts(!self.v_range_in_cdr3.is_empty()),
            second.v_parts(!self.v_range_in_cdr3.is_empty()),
        ) + count(
            &self.j_alleles,
            first.j_parts(!self.j_range_in_cdr3.is_empty()),
            second.j_parts(!self.j_range_in_cdr3.is_empty()),
        )
    }
}

/// The slice of `cdr3` left after `v_len` letters from the start and `j_len`
/// letters from the end; empty when they overlap.
fn between_germline_parts(cdr3: &[u8], v_len: isize, j_len: isize) -> Vec<u8> {
    let lower = v_len.clamp(0, cdr3.len() as isize) as usize;
    let upper = (cdr3.len() as isize - j_len).clamp(0, cdr3.len() as isize) as usize;
    if lower >= upper {
        Vec::new()
    } else {
        cdr3[lower..upper].to_vec()
    }
}

/// Edits of one clone against its V and J germlines.
#[derive(Debug, Clone)]
pub struct MutationsFromGermline {
    pub clone: Arc<CloneWrapper>,
    /// One entry per common V range.
    pub v_outside: Vec<Mutations>,
    /// Edits over the group V range in CDR3.
    pub v_in_cdr3: Mutations,
    /// Edits over the full V alignment in CDR3 of this clone.
    pub v_own_in_cdr3: Mutations,
    pub v_own_range: SeqRange,
    /// CDR3 letters between the group V and J parts.
    pub known_ndn: Vec<u8>,
    pub j_own_in_cdr3: Mutations,
    pub j_own_range: SeqRange,
    pub j_in_cdr3: Mutations,
    pub j_outside: Vec<Mutations>,
    pub cdr3: Arc<[u8]>,
}

impl MutationsFromGermline {
    fn v_parts(&self, with_cdr3_part: bool) -> Vec<&Mutations> {
        let mut parts: Vec<&Mutations> = self.v_outside.iter().collect();
        if with_cdr3_part {
            parts.push(&self.v_in_cdr3);
        }
        parts
    }

    fn j_parts(&self, with_cdr3_part: bool) -> Vec<&Mutations> {
        let mut parts: Vec<&Mutations> = self.j_outside.iter().collect();
        if with_cdr3_part {
            parts.push(&self.j_in_cdr3);
        }
        parts
    }

    /// The CDR3 positions between this clone's own V and J alignments; reversed
    /// when the alignments overlap.
    pub fn ndn_range_in_cdr3(&self) -> SeqRange {
        let own_length = |range: SeqRange, mutations: &Mutations| {
            (range.len() as isize + mutations.length_delta()).max(0) as usize
        };
        SeqRange::new(
            own_length(self.v_own_range, &self.v_own_in_cdr3),
            self.cdr3.len().saturating_sub(own_length(self.j_own_range, &self.j_own_in_cdr3)),
        )
    }

    pub fn vj_mutations_count(&self) -> usize {
        self.v_parts(true)
            .into_iter()
            .chain(self.j_parts(true))
            .map(Mutations::len)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clone::tests::hit;
    use pretty_assertions::assert_eq;

    fn hits(ranges: &[(usize, usize)]) -> Vec<GeneHit> {
        ranges.iter().map(|&(l, u)| hit("V1*01", l, u, "")).collect()
    }

    #[test]
    fn test_common_ranges_take_majority() {
        // CDR3 starts at 90
        let hits = hits(&[(0, 95), (0, 95), (10, 95), (20, 80)]);
        let common = CommonAlignmentRanges::calculate(&hits, 4, 0.75, GeneType::Variable, 90).unwrap();
        // [10, 90) is covered by 3 of 4 clones, [0, 90) only by 2; [20, 80) is not maximal
        assert_eq!(common.ranges(), &[SeqRange::new(10, 90)]);
        assert!(common.contains_hit(&hits[0]));
        assert!(!common.contains_hit(&hits[3]));
    }

    #[test]
    fn test_common_ranges_of_j() {
        let hits = [hit("J1*01", 0, 40, ""), hit("J1*01", 5, 38, ""), hit("J1*01", 0, 38, "")];
        let common = CommonAlignmentRanges::calculate(&hits, 3, 0.8, GeneType::Joining, 10).unwrap();
        assert_eq!(common.ranges(), &[SeqRange::new(10, 38)]);
    }

    #[test]
    fn test_small_portion_is_rejected() {
        assert!(CommonAlignmentRanges::calculate(&hits(&[(0, 10)]), 1, 0.4, GeneType::Variable, 5).is_err());
    }

    #[test]
    fn test_outside_flags() {
        let ranges = [SeqRange::new(0, 10), SeqRange::new(10, 20), SeqRange::new(25, 30)];
        assert_eq!(outside_flags(&ranges, GeneType::Variable), vec![true, false, true]);
        assert_eq!(outside_flags(&ranges, GeneType::Joining), vec![false, false, true]);
    }

    #[test]
    fn test_ndn_range_in_cdr3() {
        let group = crate::fixtures::group(&[("", crate::fixtures::JUNCTION, "")]);
        let clone = group.from_germline(0);
        assert_eq!(clone.ndn_range_in_cdr3(), SeqRange::new(6, 24));
        let overlapping = MutationsFromGermline {
            v_own_range: SeqRange::new(10, 30),
            j_own_range: SeqRange::new(0, 20),
            ..(*clone).clone()
        };
        assert!(overlapping.ndn_range_in_cdr3().is_reversed());
    }

    #[test]
    fn test_between_germline_parts() {
        assert_eq!(between_germline_parts(b"AACCGGTT", 2, 2), b"CCGG".to_vec());
        assert_eq!(between_germline_parts(b"AACCGGTT", 5, 4), Vec::<u8>::new());
        assert_eq!(between_germline_parts(b"AACC", -1, 0), b"AACC".to_vec());
    }
}
