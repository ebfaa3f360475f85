// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Half open interval `[lower, upper)` over sequence positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SeqRange {
    pub lower: usize,
    pub upper: usize,
}

impl SeqRange {
    /// A range; bounds are taken as given, `lower > upper` denotes a reversed range.
    pub const fn new(lower: usize, upper: usize) -> Self {
        SeqRange { lower, upper }
    }

    /// Number of positions covered; zero for empty and reversed ranges.
    pub fn len(&self) -> usize {
        self.upper.saturating_sub(self.lower)
    }

    pub fn is_empty(&self) -> bool {
        self.upper <= self.lower
    }

    pub fn is_reversed(&self) -> bool {
        self.lower > self.upper
    }

    pub fn contains(&self, position: usize) -> bool {
        self.lower <= position && position < self.upper
    }

    /// True if `other` lies inside this range.
    pub fn contains_range(&self, other: &SeqRange) -> bool {
        self.lower <= other.lower && other.upper <= self.upper
    }

    pub fn intersection(&self, other: &SeqRange) -> Option<SeqRange> {
        let lower = self.lower.max(other.lower);
        let upper = self.upper.min(other.upper);
        (lower <= upper).then_some(SeqRange { lower, upper })
    }

    /// Shift both bounds by a signed offset.
    pub fn move_by(&self, offset: isize) -> SeqRange {
        SeqRange {
            lower: self.lower.wrapping_add_signed(offset),
            upper: self.upper.wrapping_add_signed(offset),
        }
    }

    pub fn as_range(&self) -> Range<usize> {
        self.lower..self.upper
    }
}

impl From<Range<usize>> for SeqRange {
    fn from(r: Range<usize>) -> Self {
        SeqRange::new(r.start, r.end)
    }
}

impl fmt::Display for SeqRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.lower, self.upper)
    }
}
