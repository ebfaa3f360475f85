// Copyright (c) 2021 10x Genomics, Inc. All rights reserved.

//! Small germline library and clone factory shared by the unit tests.

use crate::clone::tests::{gene, hit};
use crate::clone::{
    group_by_vj_base, wrap_clones, CloneFilter, CloneRecord, CloneWrapper, DatasetClone, GeneLibrary, GeneType,
};
use crate::germline::{GroupInfo, MutationsFromGermline};
use crate::processor::build_root_info;
use crate::root::RootInfo;
use shm_mutations::Mutations;
use std::collections::HashMap;
use std::sync::Arc;

/// CDR3 starts at 24.
pub(crate) const V_SEQ: &str = "GACGTCAAGCTTGGATCCATGCATTGTGCG";
/// CDR3 ends at 6.
pub(crate) const J_SEQ: &str = "TTTGACTACTGGGGCCAGGGAACC";
pub(crate) const JUNCTION: &str = "AGAGATCGGTATAGCAGC";

pub(crate) fn library() -> GeneLibrary {
    GeneLibrary::new([
        gene("V1*01", GeneType::Variable, V_SEQ, 24),
        gene("J1*01", GeneType::Joining, J_SEQ, 6),
    ])
    .unwrap()
}

/// A clone aligned over all of V and J with the given substitutions. The CDR3
/// is 30 letters long when the junction has 18.
pub(crate) fn record(id: u32, v_mutations: &str, junction: &str, j_mutations: &str) -> CloneRecord {
    let v_mutations: Mutations = v_mutations.parse().unwrap();
    let j_mutations: Mutations = j_mutations.parse().unwrap();
    let v = String::from_utf8(v_mutations.mutate(V_SEQ.as_bytes())).unwrap();
    let j = String::from_utf8(j_mutations.mutate(J_SEQ.as_bytes())).unwrap();
    let cdr3 = format!("{}{}{}", &v[24..], junction, &j[..6]);
    CloneRecord {
        id,
        count: 1.0,
        targets: vec![format!("{}{}{}", &v[..24], cdr3, &j[6..])],
        cdr3,
        v_hits: vec![hit("V1*01", 0, V_SEQ.len(), &v_mutations.to_string())],
        j_hits: vec![hit("J1*01", 0, J_SEQ.len(), &j_mutations.to_string())],
    }
}

pub(crate) fn wrappers(clones: &[(&str, &str, &str)]) -> Vec<Arc<CloneWrapper>> {
    let records = clones
        .iter()
        .enumerate()
        .map(|(i, (v, ndn, j))| DatasetClone {
            dataset: 0,
            record: record(i as u32, v, ndn, j),
        })
        .collect();
    let wrapped = wrap_clones(records, &library(), &CloneFilter::default()).unwrap();
    group_by_vj_base(wrapped).into_values().next().unwrap_or_default()
}

pub(crate) struct Group {
    pub info: GroupInfo,
    pub clones: Vec<Arc<CloneWrapper>>,
}

impl Group {
    pub fn from_germline(&self, i: usize) -> Arc<MutationsFromGermline> {
        Arc::new(self.info.rebase_from_germline(&self.clones[i]).unwrap())
    }

    pub fn root_of(&self, members: &[usize]) -> RootInfo {
        let cluster: Vec<_> = members.iter().map(|&i| self.from_germline(i)).collect();
        build_root_info(&self.info, &cluster, 5).unwrap()
    }
}

/// Clones given as V substitutions, junction and J substitutions, all under
/// `V1*01/J1*01`.
pub(crate) fn group(clones: &[(&str, &str, &str)]) -> Group {
    let clones = wrappers(clones);
    let vj_base = clones[0].vj_base.clone();
    let info = GroupInfo::new(&library(), &vj_base, &clones, 0.8, &HashMap::new()).unwrap();
    Group { info, clones }
}
