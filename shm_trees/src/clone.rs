// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! Input clones, the germline library they were aligned to and the gene pair
//! hypotheses clones are grouped by.

use anyhow::{bail, ensure, Context, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use shm_mutations::nucleotide::is_valid_sequence;
use shm_mutations::{Mutations, SeqRange};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GeneType {
    Variable,
    Joining,
}

/// Germline sequence of one allele.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneReference {
    /// Allele id, e.g. `IGHV3-23*01`.
    pub id: String,
    /// Gene name shared by all alleles of the gene.
    pub gene: String,
    pub gene_type: GeneType,
    pub sequence: String,
    /// First CDR3 position for V genes, one past the last for J genes.
    pub cdr3_boundary: usize,
    /// Edits turning the reference allele of the gene into this one.
    #[serde(default)]
    pub allele_mutations: Option<Mutations>,
}

/// A germline reference with its sequence ready for the mutation algebra.
#[derive(Debug, Clone)]
pub struct Gene {
    pub reference: GeneReference,
    pub sequence: Arc<[u8]>,
}

/// All germline references used by the input datasets, keyed by allele id.
#[derive(Debug, Clone, Default)]
pub struct GeneLibrary {
    genes: BTreeMap<String, Gene>,
}

impl GeneLibrary {
    pub fn new(references: impl IntoIterator<Item = GeneReference>) -> Result<Self> {
        let mut genes: BTreeMap<String, Gene> = BTreeMap::new();
        for reference in references {
            if let Some(known) = genes.get(&reference.id) {
                ensure!(
                    known.reference == reference,
                    "gene {} is defined twice with different content",
                    reference.id
                );
                continue;
            }
            let sequence = reference.sequence.to_ascii_uppercase().into_bytes();
            ensure!(
                is_valid_sequence(&sequence),
                "gene {} has a sequence with non nucleotide letters",
                reference.id
            );
            ensure!(
                reference.cdr3_boundary <= sequence.len(),
                "CDR3 boundary of gene {} is outside of its sequence",
                reference.id
            );
            genes.insert(
                reference.id.clone(),
                Gene {
                    reference,
                    sequence: sequence.into(),
                },
            );
        }
        Ok(GeneLibrary { genes })
    }

    pub fn get(&self, id: &str) -> Option<&Gene> {
        self.genes.get(id)
    }

    pub fn require(&self, id: &str) -> Result<&Gene> {
        self.get(id).with_context(|| format!("unknown gene {id}"))
    }

    pub fn references(&self) -> impl Iterator<Item = &GeneReference> {
        self.genes.values().map(|g| &g.reference)
    }

    pub fn len(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }

    /// For every allele of a gene with several alleles, the edits leading from
    /// it to each of the other alleles.
    pub fn related_allele_mutations(&self) -> HashMap<String, Vec<Mutations>> {
        let by_gene = self
            .genes
            .values()
            .map(|g| (&g.reference.gene, g))
            .into_group_map();
        let mut result = HashMap::new();
        for alleles in by_gene.into_values().filter(|a| a.len() > 1) {
            for allele in &alleles {
                let to_reference = allele_mutations(allele).invert();
                let others = alleles
                    .iter()
                    .filter(|other| other.reference.id != allele.reference.id)
                    .map(|other| to_reference.combine_with(&allele_mutations(other)))
                    .collect();
                result.insert(allele.reference.id.clone(), others);
            }
        }
        result
    }
}

fn allele_mutations(gene: &Gene) -> Mutations {
    gene.reference
        .allele_mutations
        .clone()
        .unwrap_or_else(Mutations::empty)
}

/// One alignment of a clone target to a germline, with edit positions absolute
/// in the germline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitAlignment {
    pub germline_range: SeqRange,
    pub mutations: Mutations,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneHit {
    /// Allele id of the hit.
    pub gene: String,
    pub score: f32,
    /// Alignments ordered along the germline.
    pub alignments: Vec<HitAlignment>,
}

impl GeneHit {
    pub fn mutations_count(&self) -> usize {
        self.alignments.iter().map(|a| a.mutations.len()).sum()
    }
}

/// A clone as read from one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloneRecord {
    pub id: u32,
    pub count: f64,
    pub targets: Vec<String>,
    pub cdr3: String,
    pub v_hits: Vec<GeneHit>,
    pub j_hits: Vec<GeneHit>,
}

const STOP_CODONS: [&[u8]; 3] = [b"TAA", b"TAG", b"TGA"];

impl CloneRecord {
    pub fn hits(&self, gene_type: GeneType) -> &[GeneHit] {
        match gene_type {
            GeneType::Variable => &self.v_hits,
            GeneType::Joining => &self.j_hits,
        }
    }

    pub fn hit(&self, gene_type: GeneType, gene: &str) -> Option<&GeneHit> {
        self.hits(gene_type).iter().find(|h| h.gene == gene)
    }

    fn best_score(&self, gene_type: GeneType) -> f32 {
        self.hits(gene_type)
            .iter()
            .map(|h| h.score)
            .fold(0.0, f32::max)
    }

    /// In frame CDR3 without stop codons.
    pub fn is_productive(&self) -> bool {
        let cdr3 = self.cdr3.as_bytes();
        cdr3.len() % 3 == 0
            && cdr3
                .chunks(3)
                .all(|codon| !STOP_CODONS.iter().any(|s| codon.eq_ignore_ascii_case(s)))
    }
}

/// Contents of one input file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloneDataset {
    #[serde(default)]
    pub genes: Vec<GeneReference>,
    pub clones: Vec<CloneRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CloneId {
    pub dataset: u32,
    pub clone: u32,
}

impl fmt::Display for CloneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dataset, self.clone)
    }
}

/// Ids of the clones with identical targets merged into one wrapper, sorted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CloneWrapperId(pub Vec<CloneId>);

impl fmt::Display for CloneWrapperId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.iter().format(","))
    }
}

/// Partition key of the tree search: V allele, J allele and CDR3 length.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VJBase {
    pub v_gene: String,
    pub j_gene: String,
    pub cdr3_length: usize,
}

impl VJBase {
    pub fn gene(&self, gene_type: GeneType) -> &str {
        match gene_type {
            GeneType::Variable => &self.v_gene,
            GeneType::Joining => &self.j_gene,
        }
    }
}

impl fmt::Display for VJBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.v_gene, self.j_gene, self.cdr3_length)
    }
}

/// User restrictions on the clones that take part in the search.
#[derive(Debug, Clone, Default)]
pub struct CloneFilter {
    pub v_genes: Option<BTreeSet<String>>,
    pub j_genes: Option<BTreeSet<String>>,
    pub cdr3_lengths: Option<BTreeSet<usize>>,
    pub min_count: Option<f64>,
    pub productive_only: bool,
}

impl CloneFilter {
    pub fn matches_vj_base(&self, vj_base: &VJBase, library: &GeneLibrary) -> bool {
        let gene_name = |id: &str| library.get(id).map(|g| g.reference.gene.clone());
        let in_set = |set: &Option<BTreeSet<String>>, id: &str| match set {
            None => true,
            Some(set) => set.contains(id) || gene_name(id).is_some_and(|name| set.contains(&name)),
        };
        in_set(&self.v_genes, &vj_base.v_gene)
            && in_set(&self.j_genes, &vj_base.j_gene)
            && self
                .cdr3_lengths
                .as_ref()
                .map_or(true, |lengths| lengths.contains(&vj_base.cdr3_length))
    }

    fn matches_count(&self, count: f64) -> bool {
        self.min_count.map_or(true, |min| count >= min)
    }
}

/// Clones with identical targets seen under one gene pair hypothesis.
#[derive(Debug, Clone)]
pub struct CloneWrapper {
    pub id: CloneWrapperId,
    /// The representative record, with the highest V plus J score and then the
    /// highest count.
    pub main: Arc<CloneRecord>,
    pub main_dataset: u32,
    /// Summed over all merged clones.
    pub count: f64,
    pub vj_base: VJBase,
    /// Every hypothesis this clone was wrapped under, this one included.
    pub candidate_vj_bases: Arc<[VJBase]>,
    v_hit: usize,
    j_hit: usize,
}

impl CloneWrapper {
    pub fn hit(&self, gene_type: GeneType) -> &GeneHit {
        match gene_type {
            GeneType::Variable => &self.main.v_hits[self.v_hit],
            GeneType::Joining => &self.main.j_hits[self.j_hit],
        }
    }

    pub fn cdr3(&self) -> &[u8] {
        self.main.cdr3.as_bytes()
    }

    pub fn targets(&self) -> &[String] {
        &self.main.targets
    }

    /// Number of edits of the V and J hits of a hypothesis.
    pub fn vj_mutations_count(&self, vj_base: &VJBase) -> usize {
        let count = |gene_type| {
            self.main
                .hit(gene_type, vj_base.gene(gene_type))
                .map_or(0, GeneHit::mutations_count)
        };
        count(GeneType::Variable) + count(GeneType::Joining)
    }

    /// Whether some hypothesis keeps this clone within `threshold` edits of
    /// germline.
    pub fn close_to_any_germline(&self, threshold: usize) -> bool {
        self.candidate_vj_bases
            .iter()
            .any(|vj_base| self.vj_mutations_count(vj_base) < threshold)
    }
}

/// A clone record tagged with the dataset it came from.
#[derive(Debug, Clone)]
pub struct DatasetClone {
    pub dataset: u32,
    pub record: CloneRecord,
}

/// Merge clones with identical targets and wrap each merged clone once per gene
/// pair hypothesis that survives the checks. The output is ordered by gene pair
/// and then by clone ids.
pub fn wrap_clones(
    clones: Vec<DatasetClone>,
    library: &GeneLibrary,
    filter: &CloneFilter,
) -> Result<Vec<CloneWrapper>> {
    let mut by_targets: BTreeMap<Vec<String>, Vec<DatasetClone>> = BTreeMap::new();
    for c in clones {
        by_targets.entry(c.record.targets.clone()).or_default().push(c);
    }

    let mut result = Vec::new();
    for (_, group) in by_targets {
        let mut ids: Vec<CloneId> = group
            .iter()
            .map(|c| CloneId {
                dataset: c.dataset,
                clone: c.record.id,
            })
            .collect();
        ids.sort();
        let count = group.iter().map(|c| c.record.count).sum();
        let Some(main) = group.into_iter().max_by(compare_for_main) else {
            continue;
        };
        let main_dataset = main.dataset;
        let record = Arc::new(main.record);

        if filter.productive_only && !record.is_productive() {
            continue;
        }
        let mut candidates = Vec::new();
        for (v, v_hit) in record.v_hits.iter().enumerate() {
            for (j, j_hit) in record.j_hits.iter().enumerate() {
                let (Some(v_gene), Some(j_gene)) = (library.get(&v_hit.gene), library.get(&j_hit.gene)) else {
                    bail!(
                        "clone {} refers to genes missing from the library: {} {}",
                        record.id,
                        v_hit.gene,
                        j_hit.gene
                    );
                };
                let vj_base = VJBase {
                    v_gene: v_hit.gene.clone(),
                    j_gene: j_hit.gene.clone(),
                    cdr3_length: record.cdr3.len(),
                };
                if !forms_all_ref_points_in_cdr3(&record, v_hit, v_gene, j_hit, j_gene) {
                    continue;
                }
                candidates.push((vj_base, v, j));
            }
        }
        let candidate_vj_bases: Arc<[VJBase]> = candidates.iter().map(|(b, _, _)| b.clone()).collect();
        for (vj_base, v_hit, j_hit) in candidates {
            let wrapper = CloneWrapper {
                id: CloneWrapperId(ids.clone()),
                main: record.clone(),
                main_dataset,
                count,
                vj_base,
                candidate_vj_bases: candidate_vj_bases.clone(),
                v_hit,
                j_hit,
            };
            if filter.matches_count(wrapper.count) && filter.matches_vj_base(&wrapper.vj_base, library) {
                result.push(wrapper);
            }
        }
    }
    result.sort_by(|a, b| a.vj_base.cmp(&b.vj_base).then_with(|| a.id.cmp(&b.id)));
    Ok(result)
}

fn compare_for_main(a: &DatasetClone, b: &DatasetClone) -> Ordering {
    let score = |c: &CloneRecord| c.best_score(GeneType::Variable) + c.best_score(GeneType::Joining);
    score(&a.record)
        .total_cmp(&score(&b.record))
        .then_with(|| a.record.count.total_cmp(&b.record.count))
        .then_with(|| b.dataset.cmp(&a.dataset))
}

/// The V alignment must reach the CDR3 start, the J alignment must start before
/// the CDR3 end and the germline parts of both must fit in the CDR3 together.
fn forms_all_ref_points_in_cdr3(
    record: &CloneRecord,
    v_hit: &GeneHit,
    v_gene: &Gene,
    j_hit: &GeneHit,
    j_gene: &Gene,
) -> bool {
    let (Some(last_v), Some(first_j)) = (v_hit.alignments.last(), j_hit.alignments.first()) else {
        return false;
    };
    let cdr3_begin = v_gene.reference.cdr3_boundary;
    let cdr3_end = j_gene.reference.cdr3_boundary;
    if last_v.germline_range.lower > cdr3_begin || last_v.germline_range.upper < cdr3_begin {
        return false;
    }
    if first_j.germline_range.lower > cdr3_end || first_j.germline_range.upper < cdr3_end {
        return false;
    }
    let v_range = SeqRange::new(cdr3_begin, last_v.germline_range.upper);
    let j_range = SeqRange::new(first_j.germline_range.lower, cdr3_end);
    let v_len = v_range.len() as isize
        + last_v
            .mutations
            .extract_absolute_mutations(v_range, false)
            .length_delta();
    let j_len = j_range.len() as isize
        + first_j
            .mutations
            .extract_absolute_mutations(j_range, true)
            .length_delta();
    !record.cdr3.is_empty() && v_len >= 0 && j_len >= 0 && v_len + j_len <= record.cdr3.len() as isize
}

/// Group wrappers by gene pair, keeping the input order inside each group.
pub fn group_by_vj_base(wrappers: Vec<CloneWrapper>) -> BTreeMap<VJBase, Vec<Arc<CloneWrapper>>> {
    let mut groups: BTreeMap<VJBase, Vec<Arc<CloneWrapper>>> = BTreeMap::new();
    for w in wrappers {
        groups.entry(w.vj_base.clone()).or_default().push(Arc::new(w));
    }
    groups
}

impl CloneDataset {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| path.display().to_string())?;
        serde_json::from_reader(BufReader::new(file)).with_context(|| path.display().to_string())
    }
}

/// One library for the genes of all datasets; clones are tagged with the index
/// of their dataset.
pub fn merge_datasets(datasets: Vec<CloneDataset>) -> Result<(GeneLibrary, Vec<DatasetClone>)> {
    let library = GeneLibrary::new(datasets.iter().flat_map(|d| d.genes.iter().cloned()))?;
    let clones = datasets
        .into_iter()
        .enumerate()
        .flat_map(|(i, d)| {
            d.clones.into_iter().map(move |record| DatasetClone {
                dataset: i as u32,
                record,
            })
        })
        .collect();
    Ok((library, clones))
}
