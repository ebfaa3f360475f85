// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! Nucleotide scoring with wildcard aware substitution scores and affine gaps.

use crate::mutation::{Mutation, Mutations};
use crate::nucleotide::{self, basic_letters, mask};
use serde::{Deserialize, Serialize};

/// The serialized form of a scoring scheme.
///
/// A gap of length `k` scores `gap_open + (k - 1) * gap_extend`, so a linear gap
/// penalty is expressed with `gap_open == gap_extend`.
///
/// Scores between wildcards are averaged over the basic letters they stand for.
/// The letters of the second operand are weighted by `wildcard_multiplier`, which
/// makes the matrix asymmetric for values other than one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScoringConfig {
    pub match_score: i32,
    pub mismatch: i32,
    pub gap_open: i32,
    pub gap_extend: i32,
    #[serde(default = "default_multiplier")]
    pub wildcard_multiplier: i32,
}

fn default_multiplier() -> i32 {
    1
}

/// Scoring scheme with a precomputed 16x16 substitution matrix indexed by letter
/// mask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ScoringConfig", into = "ScoringConfig")]
pub struct AlignmentScoring {
    config: ScoringConfig,
    matrix: [[i32; 16]; 16],
}

impl From<ScoringConfig> for AlignmentScoring {
    fn from(config: ScoringConfig) -> Self {
        let mut matrix = [[0; 16]; 16];
        for (m1, row) in matrix.iter_mut().enumerate().skip(1) {
            for (m2, cell) in row.iter_mut().enumerate().skip(1) {
                *cell = cell_score(&config, nucleotide::from_mask(m1 as u8), nucleotide::from_mask(m2 as u8));
            }
        }
        AlignmentScoring { config, matrix }
    }
}

impl From<AlignmentScoring> for ScoringConfig {
    fn from(scoring: AlignmentScoring) -> Self {
        scoring.config
    }
}

fn cell_score(config: &ScoringConfig, first: u8, second: u8) -> i32 {
    let score = |matched: bool| {
        if matched {
            config.match_score
        } else {
            config.mismatch
        }
    };
    if !nucleotide::is_wildcard(first) && !nucleotide::is_wildcard(second) {
        return score(first == second);
    }
    let mult = config.wildcard_multiplier;
    let from_first: i32 = basic_letters(first)
        .map(|b| score(nucleotide::matches(second, b)))
        .sum();
    let from_second: i32 = basic_letters(second)
        .map(|b| score(nucleotide::matches(first, b)) * mult)
        .sum();
    let weight = nucleotide::basic_size(first) as i32 + nucleotide::basic_size(second) as i32 * mult;
    (from_first + from_second) / weight
}

impl AlignmentScoring {
    pub fn new(config: ScoringConfig) -> Self {
        config.into()
    }

    /// Linear scoring used by BLAST for nucleotides: match 5, mismatch -4, gap -14.
    pub fn blast_linear() -> Self {
        ScoringConfig {
            match_score: 5,
            mismatch: -4,
            gap_open: -14,
            gap_extend: -14,
            wildcard_multiplier: 1,
        }
        .into()
    }

    /// Scoring for V and J germline segments.
    pub fn germline_default() -> Self {
        ScoringConfig {
            match_score: 5,
            mismatch: -9,
            gap_open: -12,
            gap_extend: -12,
            wildcard_multiplier: 1,
        }
        .into()
    }

    /// Scoring for junction segments aligned against wildcard placeholders.
    pub fn ndn_default() -> Self {
        ScoringConfig {
            match_score: 5,
            mismatch: -4,
            gap_open: -10,
            gap_extend: -1,
            wildcard_multiplier: 4,
        }
        .into()
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn gap_open(&self) -> i32 {
        self.config.gap_open
    }

    pub fn gap_extend(&self) -> i32 {
        self.config.gap_extend
    }

    /// Substitution score; bytes that are not nucleotides score as mismatches.
    pub fn score(&self, first: u8, second: u8) -> i32 {
        match (mask(first), mask(second)) {
            (Some(a), Some(b)) => self.matrix[a as usize][b as usize],
            _ => self.config.mismatch,
        }
    }

    /// Best score a single letter can reach.
    pub fn max_match(&self) -> i32 {
        nucleotide::BASIC_LETTERS
            .iter()
            .map(|&b| self.score(b, b))
            .max()
            .unwrap_or(self.config.match_score)
    }

    /// Score of aligning `seq1` with its mutated copy.
    pub fn calculate_score(&self, seq1: &[u8], mutations: &Mutations) -> i32 {
        let mut score = 0;
        let mut next = 0;
        let mut previous: Option<Mutation> = None;
        for m in mutations {
            let p = m.position().min(seq1.len());
            if p > next {
                score += seq1[next..p].iter().map(|&c| self.score(c, c)).sum::<i32>();
                next = p;
                previous = None;
            }
            score += match *m {
                Mutation::Substitution { from, to, .. } => self.score(from, to),
                Mutation::Deletion { .. } => match previous {
                    Some(Mutation::Deletion { position, .. }) if position + 1 == p => self.gap_extend(),
                    _ => self.gap_open(),
                },
                Mutation::Insertion { .. } => match previous {
                    Some(Mutation::Insertion { position, .. }) if position == p => self.gap_extend(),
                    _ => self.gap_open(),
                },
            };
            if !m.is_insertion() {
                next = p + 1;
            }
            previous = Some(*m);
        }
        if next < seq1.len() {
            score += seq1[next..].iter().map(|&c| self.score(c, c)).sum::<i32>();
        }
        score
    }

    /// `len * max_match`, the score of an unmutated sequence of basic letters.
    pub fn max_score(&self, len: usize) -> i32 {
        len as i32 * self.max_match()
    }
}
