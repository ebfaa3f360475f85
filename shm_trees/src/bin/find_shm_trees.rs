// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! find_shm_trees
#![deny(missing_docs)]

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use shm_trees::clone::{group_by_vj_base, merge_datasets, wrap_clones};
use shm_trees::store::{StoreMetadata, StoreWriter};
use shm_trees::{CloneDataset, CloneFilter, ShmTreeBuilderOrchestrator, ShmTreeParameters};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Build lineage trees of hypermutated clones.
#[derive(Debug, Parser)]
struct Args {
    /// Clone datasets, JSON.
    #[clap(required = true)]
    clones: Vec<PathBuf>,

    /// Tree file to write.
    #[clap(long, short)]
    output: PathBuf,

    /// Parameters, TOML; defaults when missing.
    #[clap(long)]
    params: Option<PathBuf>,

    /// Step report, JSON.
    #[clap(long)]
    report: Option<PathBuf>,

    /// Directory for per step debug tables.
    #[clap(long)]
    debug_dir: Option<PathBuf>,

    /// Keep only these V genes or alleles.
    #[clap(long = "v-gene")]
    v_genes: Vec<String>,

    /// Keep only these J genes or alleles.
    #[clap(long = "j-gene")]
    j_genes: Vec<String>,

    /// Keep only these CDR3 lengths.
    #[clap(long = "cdr3-length")]
    cdr3_lengths: Vec<usize>,

    /// Drop clones with a smaller count.
    #[clap(long)]
    min_count: Option<f64>,

    /// One tree per gene pair and CDR3 length over all of its clones.
    #[clap(long)]
    single_trees: bool,

    /// Log filter, as in `RUST_LOG`.
    #[clap(long, default_value = "info")]
    log_level: String,
}

fn non_empty<T: Ord>(values: Vec<T>) -> Option<BTreeSet<T>> {
    if values.is_empty() {
        None
    } else {
        Some(values.into_iter().collect())
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::new()
        .parse_filters(&args.log_level)
        .format_timestamp_secs()
        .init();

    let params = match &args.params {
        Some(path) => ShmTreeParameters::from_toml_file(path)?,
        None => ShmTreeParameters::default(),
    };

    let datasets = args
        .clones
        .iter()
        .map(|path| CloneDataset::from_json_file(path))
        .collect::<Result<Vec<_>>>()?;
    let (library, clones) = merge_datasets(datasets)?;
    let filter = CloneFilter {
        v_genes: non_empty(args.v_genes.clone()),
        j_genes: non_empty(args.j_genes.clone()),
        cdr3_lengths: non_empty(args.cdr3_lengths.clone()),
        min_count: args.min_count,
        productive_only: params.productive_only,
    };
    let wrapped = wrap_clones(clones, &library, &filter)?;
    info!("{} clone hypotheses from {} files", wrapped.len(), args.clones.len());
    let groups = group_by_vj_base(wrapped);

    let mut orchestrator = ShmTreeBuilderOrchestrator::new(&params, &library, groups);
    if let Some(dir) = &args.debug_dir {
        std::fs::create_dir_all(dir).with_context(|| dir.display().to_string())?;
        orchestrator = orchestrator.with_debug_dir(dir.clone());
    }
    let result = if args.single_trees {
        orchestrator.build_single_trees()?
    } else {
        orchestrator.build_trees()?
    };
    info!("\n{}", result.report);

    let metadata = StoreMetadata {
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
        inputs: args.clones.iter().map(|p| p.display().to_string()).collect(),
        parameters: serde_json::to_value(&params)?,
    };
    let genes: Vec<_> = library.references().cloned().collect();
    let mut writer = StoreWriter::create(&args.output, &metadata, &genes)?;
    for tree in &result.trees {
        writer.write_tree(tree)?;
    }
    writer
        .finish(std::slice::from_ref(&result.report))
        .with_context(|| args.output.display().to_string())?;

    if let Some(path) = &args.report {
        result.report.write_json(path)?;
    }
    Ok(())
}
