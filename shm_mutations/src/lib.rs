// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! Nucleotide edit lists and the algebra used to compare mutated copies of a
//! germline sequence.

pub mod align;
pub mod error;
pub mod mutation;
pub mod ndn;
pub mod nucleotide;
pub mod range;
pub mod ranged;
pub mod scoring;

pub use align::{align_global, align_global_range, Alignment};
pub use error::AlgebraError;
pub use mutation::{Mutation, Mutations, Seq2Position};
pub use range::SeqRange;
pub use ranged::MutationsWithRange;
pub use scoring::{AlignmentScoring, ScoringConfig};
