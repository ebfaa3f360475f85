// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! Counts collected while the steps run, written as JSON next to the trees.

use crate::meta::{Snapshot, TreeId};
use crate::params::BuildShmTreeStep;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Trees and clones after one step, counted after decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub step: BuildShmTreeStep,
    pub clones_added: usize,
    pub trees_created: usize,
    pub trees_combined: usize,
    /// Clones claimed under more than one gene pair and dropped from all but one.
    pub clones_reassigned: usize,
    pub trees: usize,
    pub clones_in_trees: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildShmTreeReport {
    pub input_clones: usize,
    pub groups: usize,
    pub steps: Vec<StepReport>,
    /// Trees written out, after the size cut.
    pub trees_written: usize,
    pub clones_in_written_trees: usize,
}

impl BuildShmTreeReport {
    pub(crate) fn add_step(
        &mut self,
        step: BuildShmTreeStep,
        before: &BTreeMap<TreeId, usize>,
        after: &[&Snapshot],
        clones_reassigned: usize,
        trees_combined: usize,
    ) {
        let clones_before: usize = before.values().sum();
        let clones_in_trees: usize = after.iter().map(|s| s.clones_count()).sum();
        let trees_created = after
            .iter()
            .filter(|s| !before.contains_key(&s.tree_id))
            .count();
        self.steps.push(StepReport {
            step,
            clones_added: clones_in_trees.saturating_sub(clones_before),
            trees_created,
            trees_combined,
            clones_reassigned,
            trees: after.len(),
            clones_in_trees,
        });
    }

    pub fn distinct_clones(snapshots: &[&Snapshot]) -> usize {
        snapshots
            .iter()
            .flat_map(|s| &s.history)
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| path.display().to_string())?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }
}

impl fmt::Display for BuildShmTreeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "input clones: {} in {} groups", self.input_clones, self.groups)?;
        for s in &self.steps {
            writeln!(
                f,
                "{}: +{} clones, {} new trees, {} combined, {} reassigned; {} trees with {} clones",
                s.step, s.clones_added, s.trees_created, s.trees_combined, s.clones_reassigned, s.trees, s.clones_in_trees
            )?;
        }
        write!(
            f,
            "written: {} trees with {} clones",
            self.trees_written, self.clones_in_written_trees
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clone::{CloneId, CloneWrapperId, VJBase};
    use crate::root::tests::root;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn snapshot(number: u32, clones: &[u32]) -> Snapshot {
        let root = root();
        Snapshot {
            history: clones
                .iter()
                .map(|&clone| CloneWrapperId(vec![CloneId { dataset: 0, clone }]))
                .collect(),
            tree_id: TreeId {
                vj_base: VJBase {
                    v_gene: "V1*01".to_string(),
                    j_gene: "J1*01".to_string(),
                    cdr3_length: 30,
                },
                number,
            },
            root_info: Arc::new(root),
        }
    }

    #[test]
    fn test_step_counts() {
        let mut report = BuildShmTreeReport::default();
        let first = snapshot(1, &[1, 2]);
        report.add_step(BuildShmTreeStep::BuildingInitialTrees, &BTreeMap::new(), &[&first], 0, 0);

        let before: BTreeMap<TreeId, usize> = [(first.tree_id.clone(), 2)].into_iter().collect();
        let grown = snapshot(1, &[1, 2, 3]);
        let new = snapshot(2, &[4, 5]);
        report.add_step(BuildShmTreeStep::AttachClonesByDistanceChange, &before, &[&grown, &new], 1, 0);

        assert_eq!(report.steps[0].trees_created, 1);
        assert_eq!(report.steps[0].clones_added, 2);
        assert_eq!(
            report.steps[1],
            StepReport {
                step: BuildShmTreeStep::AttachClonesByDistanceChange,
                clones_added: 3,
                trees_created: 1,
                trees_combined: 0,
                clones_reassigned: 1,
                trees: 2,
                clones_in_trees: 5,
            }
        );
        assert_eq!(BuildShmTreeReport::distinct_clones(&[&first, &grown]), 3);
    }

    #[test]
    fn test_json_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("report.json");
        let report = BuildShmTreeReport {
            input_clones: 10,
            groups: 2,
            ..Default::default()
        };
        report.write_json(&path)?;
        let read: BuildShmTreeReport = serde_json::from_reader(File::open(&path)?)?;
        assert_eq!(read, report);
        assert!(report.to_string().starts_with("input clones: 10 in 2 groups"));
        Ok(())
    }
}
