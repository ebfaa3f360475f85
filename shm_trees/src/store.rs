// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! Reading and writing the tree file. The layout is
//! ```text
//!
//! +----------+-----------+
//! | Magic    | Version   |
//! | [8 bytes]| [4 bytes] |
//! +----------+-----------+
//!
//! +-----------+----------------------------+
//! | Length    | Metadata (JSON)            |
//! | [4 bytes] | [Length Bytes]             |
//! +-----------+----------------------------+
//! | Length    | Genes (bincode)            |
//! | [4 bytes] | [Length Bytes]             |
//! +-----------+----------------------------+
//!
//! +-------------------------+
//! | Number of trees (k)     |
//! |       [4 bytes]         |
//! +-------------------------+
//!
//! +-----------+----------------------------+
//! | Length    | Tree 0 (bincode)           |
//! | [4 bytes] | [Length Bytes]             |
//! +-----------+----------------------------+
//! ...
//! +-----------+----------------------------+
//! | Length    | Tree k-1 (bincode)         |
//! | [4 bytes] | [Length Bytes]             |
//! +-----------+----------------------------+
//!
//! +-----------+----------------------------+-----------+
//! | Length    | Reports (bincode)          | End       |
//! | [4 bytes] | [Length Bytes]             | [8 bytes] |
//! +-----------+----------------------------+-----------+
//! ```
//! Numbers are big endian. The tree count is written as zero first and filled
//! in by [`StoreWriter::finish`].

use crate::clone::GeneReference;
use crate::report::BuildShmTreeReport;
use crate::result::ShmTree;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;

pub const MAGIC: &[u8; 8] = b"SHMTREES";
pub const END_MARKER: &[u8; 8] = b"SHMT_END";
pub const VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not a tree file")]
    BadMagic,

    #[error("unsupported tree file version {0}")]
    UnsupportedVersion(u32),

    #[error("tree file is truncated")]
    Truncated,

    #[error("record of {0} bytes does not fit the format")]
    RecordTooLarge(usize),

    #[error(transparent)]
    Io(io::Error),

    #[error(transparent)]
    Codec(#[from] bincode::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::Truncated
        } else {
            Error::Io(e)
        }
    }
}

/// Tool and inputs the trees were built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub tool_version: String,
    pub inputs: Vec<String>,
    pub parameters: serde_json::Value,
}

fn write_record<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<(), Error> {
    let len = u32::try_from(bytes.len()).map_err(|_| Error::RecordTooLarge(bytes.len()))?;
    writer.write_u32::<BigEndian>(len)?;
    writer.write_all(bytes)?;
    Ok(())
}

fn read_record<R: Read>(reader: &mut R) -> Result<Vec<u8>, Error> {
    let len = reader.read_u32::<BigEndian>()? as usize;
    let mut bytes = vec![0; len];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn write_encoded<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<(), Error> {
    write_record(writer, &bincode::serialize(value)?)
}

fn read_decoded<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, Error> {
    Ok(bincode::deserialize(&read_record(reader)?)?)
}

/// Streaming writer; trees are written as they come.
pub struct StoreWriter<W: Write + Seek> {
    writer: W,
    count_offset: u64,
    trees: u32,
}

impl StoreWriter<BufWriter<File>> {
    pub fn create(path: &Path, metadata: &StoreMetadata, genes: &[GeneReference]) -> anyhow::Result<Self> {
        use anyhow::Context;
        let file = File::create(path).with_context(|| format!("While creating file: {}", path.display()))?;
        Ok(StoreWriter::new(BufWriter::new(file), metadata, genes)?)
    }
}

impl<W: Write + Seek> StoreWriter<W> {
    pub fn new(mut writer: W, metadata: &StoreMetadata, genes: &[GeneReference]) -> Result<Self, Error> {
        writer.write_all(MAGIC)?;
        writer.write_u32::<BigEndian>(VERSION)?;
        write_record(&mut writer, &serde_json::to_vec(metadata)?)?;
        write_encoded(&mut writer, &genes)?;
        let count_offset = writer.stream_position()?;
        // filled in by finish()
        writer.write_u32::<BigEndian>(0)?;
        Ok(StoreWriter {
            writer,
            count_offset,
            trees: 0,
        })
    }

    pub fn write_tree(&mut self, tree: &ShmTree) -> Result<(), Error> {
        write_encoded(&mut self.writer, tree)?;
        self.trees += 1;
        Ok(())
    }

    /// Write the footer and the tree count.
    pub fn finish(mut self, reports: &[BuildShmTreeReport]) -> Result<W, Error> {
        write_encoded(&mut self.writer, &reports)?;
        self.writer.write_all(END_MARKER)?;
        let end = self.writer.stream_position()?;
        self.writer.seek(SeekFrom::Start(self.count_offset))?;
        self.writer.write_u32::<BigEndian>(self.trees)?;
        self.writer.seek(SeekFrom::Start(end))?;
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// Streaming reader: header on open, then trees one by one, then the footer.
pub struct StoreReader<R: Read> {
    reader: R,
    metadata: StoreMetadata,
    genes: Vec<GeneReference>,
    trees: u32,
    trees_read: u32,
}

impl StoreReader<BufReader<File>> {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let file = File::open(path).with_context(|| format!("While opening file for reading: {}", path.display()))?;
        Ok(StoreReader::new(BufReader::new(file))?)
    }
}

impl<R: Read> StoreReader<R> {
    pub fn new(mut reader: R) -> Result<Self, Error> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::BadMagic);
        }
        let version = reader.read_u32::<BigEndian>()?;
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let metadata = serde_json::from_slice(&read_record(&mut reader)?)?;
        let genes = read_decoded(&mut reader)?;
        let trees = reader.read_u32::<BigEndian>()?;
        Ok(StoreReader {
            reader,
            metadata,
            genes,
            trees,
            trees_read: 0,
        })
    }

    pub fn metadata(&self) -> &StoreMetadata {
        &self.metadata
    }

    pub fn genes(&self) -> &[GeneReference] {
        &self.genes
    }

    pub fn len(&self) -> usize {
        self.trees as usize
    }

    pub fn is_empty(&self) -> bool {
        self.trees == 0
    }

    pub fn read_tree(&mut self) -> Result<Option<ShmTree>, Error> {
        if self.trees_read == self.trees {
            return Ok(None);
        }
        self.trees_read += 1;
        read_decoded(&mut self.reader).map(Some)
    }

    /// Skip the trees left and read the footer.
    pub fn finish(mut self) -> Result<Vec<BuildShmTreeReport>, Error> {
        while self.trees_read < self.trees {
            read_record(&mut self.reader)?;
            self.trees_read += 1;
        }
        let reports = read_decoded(&mut self.reader)?;
        let mut end = [0u8; 8];
        self.reader.read_exact(&mut end)?;
        if &end != END_MARKER {
            return Err(Error::Truncated);
        }
        Ok(reports)
    }
}

impl<R: Read> Iterator for StoreReader<R> {
    type Item = Result<ShmTree, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_tree().transpose()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.trees - self.trees_read) as usize;
        (left, Some(left))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clone::tests::gene;
    use crate::clone::{CloneId, CloneWrapperId, GeneType};
    use crate::meta::TreeId;
    use crate::result::ShmTreeNode;
    use crate::root::tests::root;
    use pretty_assertions::assert_eq;
    use shm_mutations::Mutations;
    use std::io::Cursor;

    fn tree(number: u32) -> ShmTree {
        let root = root();
        let node = |id, parent: Option<u32>, clone: Option<u32>| ShmTreeNode {
            id,
            parent,
            distance_from_parent: parent.map(|_| 0.5),
            distance_from_root: if parent.is_some() { 0.5 } else { 0.0 },
            distance_from_germline: 0.25,
            distance_from_mrca: None,
            clone: clone.map(|c| CloneWrapperId(vec![CloneId { dataset: 0, clone: c }])),
            count: clone.map(|_| 2.0),
            v_mutations: vec!["SA4T".parse().unwrap_or_default(), Mutations::default()],
            ndn_mutations: Mutations::default(),
            j_mutations: vec![Mutations::default(), Mutations::default()],
            ndn: "NNNN".to_string(),
            cdr3: "AAANNNNTTT".to_string(),
        };
        ShmTree {
            tree_id: TreeId {
                vj_base: root.vj_base.clone(),
                number,
            },
            nodes: vec![node(0, None, None), node(1, Some(0), Some(7))],
            root,
        }
    }

    fn metadata() -> StoreMetadata {
        StoreMetadata {
            tool_version: "0.1.0".to_string(),
            inputs: vec!["clones.json".to_string()],
            parameters: serde_json::json!({ "count_of_nodes_to_probe": 25 }),
        }
    }

    fn written(trees: &[ShmTree]) -> Result<Vec<u8>, Error> {
        let genes = [gene("V1*01", GeneType::Variable, "ACGTACGTACGTAAA", 12)];
        let mut writer = StoreWriter::new(Cursor::new(Vec::new()), &metadata(), &genes)?;
        for t in trees {
            writer.write_tree(t)?;
        }
        let report = BuildShmTreeReport {
            input_clones: 3,
            groups: 1,
            ..Default::default()
        };
        Ok(writer.finish(&[report])?.into_inner())
    }

    #[test]
    fn test_round_trip() -> anyhow::Result<()> {
        let trees = vec![tree(1), tree(2)];
        let bytes = written(&trees)?;
        let mut reader = StoreReader::new(bytes.as_slice())?;
        assert_eq!(reader.metadata(), &metadata());
        assert_eq!(reader.genes().len(), 1);
        assert_eq!(reader.len(), 2);
        let read: Vec<ShmTree> = reader.by_ref().collect::<Result<_, _>>()?;
        assert_eq!(read, trees);
        let reports = reader.finish()?;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].input_clones, 3);
        Ok(())
    }

    #[test]
    fn test_footer_skips_unread_trees() -> anyhow::Result<()> {
        let bytes = written(&[tree(1), tree(2)])?;
        let mut reader = StoreReader::new(bytes.as_slice())?;
        assert_eq!(reader.read_tree()?.map(|t| t.tree_id.number), Some(1));
        assert_eq!(reader.finish()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_file_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("trees.shmt");
        let mut writer = StoreWriter::create(&path, &metadata(), &[])?;
        writer.write_tree(&tree(1))?;
        writer.finish(&[])?;
        let reader = StoreReader::open(&path)?;
        assert!(reader.genes().is_empty());
        let read: Vec<ShmTree> = reader.collect::<Result<_, _>>()?;
        assert_eq!(read, vec![tree(1)]);
        Ok(())
    }

    #[test]
    fn test_bad_input() -> anyhow::Result<()> {
        assert!(matches!(
            StoreReader::new(b"NOTTREES\0\0\0\x01".as_slice()),
            Err(Error::BadMagic)
        ));
        let mut bytes = written(&[])?;
        bytes[11] = 9;
        assert!(matches!(
            StoreReader::new(bytes.as_slice()),
            Err(Error::UnsupportedVersion(9))
        ));

        let bytes = written(&[tree(1)])?;
        let cut = &bytes[..bytes.len() - 20];
        let mut reader = StoreReader::new(cut)?;
        assert!(reader.read_tree()?.is_some());
        assert!(matches!(reader.finish(), Err(Error::Truncated)));
        Ok(())
    }
}
