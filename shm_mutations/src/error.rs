// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

use crate::range::SeqRange;
use thiserror::Error;

/// Errors raised by the mutation algebra.
///
/// A range or base mismatch means two edit sets that were never meant to be
/// composed reached the same operation; callers treat it as fatal for the unit of
/// work that produced it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AlgebraError {
    #[error("operands have different ranges: {left} vs {right}")]
    RangeMismatch { left: SeqRange, right: SeqRange },

    #[error("operands are built over different base sequences (lengths {left} and {right})")]
    BaseMismatch { left: usize, right: usize },

    #[error("operands disagree on leading insertions")]
    FlagMismatch,

    #[error("descriptions have different part layouts: {0}")]
    LayoutMismatch(String),

    #[error("invalid mutation {0:?}")]
    Parse(String),
}
