// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! Lineage trees of somatically hypermutated clones.
//!
//! Clones are grouped by V allele, J allele and CDR3 length. Within a group,
//! strongly mutated clones are clustered by shared edits and each cluster is
//! grown into a tree whose inner nodes are reconstructed ancestors. Later steps
//! attach the remaining clones and merge close trees.

pub mod builder;
pub mod clone;
pub mod debug;
pub mod description;
pub mod germline;
pub mod meta;
pub mod model;
pub mod orchestrator;
pub mod params;
pub mod processor;
pub mod rebase;
pub mod report;
pub mod result;
pub mod root;
pub mod store;
pub mod tree;

#[cfg(test)]
pub(crate) mod fixtures;

pub use clone::{CloneDataset, CloneFilter, CloneWrapper, CloneWrapperId, GeneLibrary, VJBase};
pub use meta::{DecisionInfo, Snapshot, TreeId};
pub use orchestrator::{BuildResult, ShmTreeBuilderOrchestrator};
pub use params::{BuildShmTreeStep, ShmTreeParameters};
pub use rebase::RebaseError;
pub use report::BuildShmTreeReport;
pub use result::{ShmTree, ShmTreeNode};
