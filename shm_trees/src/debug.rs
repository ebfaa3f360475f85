// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! Per node diagnostics written after every step.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// One reconstructed node of a tree. Edits are given per part, parts joined by
/// `|`, from the V part farthest from CDR3 to the J part farthest from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugRow {
    pub v_gene: String,
    pub j_gene: String,
    pub cdr3_length: usize,
    pub tree_number: u32,
    pub node_id: u32,
    pub parent_id: Option<u32>,
    /// Clone held by the node at distance zero, if any.
    pub clone_id: Option<String>,
    /// Cost of the step that placed that clone.
    pub metric: Option<f64>,
    pub ndn: String,
    pub v_mutations_from_root: String,
    pub ndn_mutations_from_root: String,
    pub j_mutations_from_root: String,
    pub v_mutations_from_parent: Option<String>,
    pub ndn_mutations_from_parent: Option<String>,
    pub j_mutations_from_parent: Option<String>,
    pub is_public: bool,
}

/// `;` separated table of [`DebugRow`] with a header line.
pub struct DebugWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl DebugWriter<BufWriter<File>> {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).with_context(|| path.display().to_string())?;
        Ok(DebugWriter::new(BufWriter::new(file)))
    }
}

impl<W: Write> DebugWriter<W> {
    pub fn new(writer: W) -> Self {
        DebugWriter {
            writer: csv::WriterBuilder::new().delimiter(b';').from_writer(writer),
        }
    }

    pub fn write_rows(&mut self, rows: &[DebugRow]) -> Result<()> {
        for row in rows {
            self.writer.serialize(row)?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer.into_inner().map_err(|e| e.into_error())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn row(node_id: u32, parent_id: Option<u32>) -> DebugRow {
        DebugRow {
            v_gene: "V1*01".to_string(),
            j_gene: "J1*01".to_string(),
            cdr3_length: 30,
            tree_number: 1,
            node_id,
            parent_id,
            clone_id: parent_id.map(|_| "0:1".to_string()),
            metric: parent_id.map(|_| 0.25),
            ndn: "NNNN".to_string(),
            v_mutations_from_root: "SA4T|".to_string(),
            ndn_mutations_from_root: String::new(),
            j_mutations_from_root: "|".to_string(),
            v_mutations_from_parent: None,
            ndn_mutations_from_parent: None,
            j_mutations_from_parent: None,
            is_public: true,
        }
    }

    #[test]
    fn test_rows_round_trip() -> Result<()> {
        let rows = vec![row(0, None), row(3, Some(0))];
        let mut writer = DebugWriter::new(Vec::new());
        writer.write_rows(&rows)?;
        let bytes = writer.finish()?;
        let text = String::from_utf8(bytes)?;
        assert!(text.starts_with("v_gene;j_gene;cdr3_length;tree_number;node_id;parent_id;"));

        let mut reader = csv::ReaderBuilder::new().delimiter(b';').from_reader(text.as_bytes());
        let read: Vec<DebugRow> = reader.deserialize().collect::<Result<_, _>>()?;
        assert_eq!(read, rows);
        Ok(())
    }

    #[test]
    fn test_create_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("debug.csv");
        let mut writer = DebugWriter::create(&path)?;
        writer.write_rows(&[row(0, None)])?;
        writer.finish()?;
        assert_eq!(std::fs::read_to_string(&path)?.lines().count(), 2);
        Ok(())
    }
}
