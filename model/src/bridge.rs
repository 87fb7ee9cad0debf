use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::GersId;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingType {
    OneToOne,
    ManyToOne,
    OneToMany,
}

impl MappingType {
    /// Whether following the mapping names exactly one successor.
    pub fn is_unambiguous(&self) -> bool {
        !matches!(self, Self::OneToMany)
    }
}

/// Old -> new identifier correspondence published with an upstream release.
/// Keyed by `(old_id, release_date)`; rows are only ever appended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeMapping {
    pub old_id: GersId,
    pub new_id: GersId,
    pub release_date: NaiveDate,
    pub mapping_type: MappingType,
}

impl BridgeMapping {
    pub fn key(&self) -> (GersId, NaiveDate) {
        (self.old_id, self.release_date)
    }
}

/// Classifies every `(old, new)` pair by how often each side appears in the
/// whole set. An old id with several successors is one-to-many; a new id
/// with several predecessors is many-to-one.
pub fn classify(pairs: &[(GersId, GersId)]) -> Vec<MappingType> {
    let mut olds: BTreeMap<GersId, usize> = BTreeMap::new();
    let mut news: BTreeMap<GersId, usize> = BTreeMap::new();
    for (old, new) in pairs {
        *olds.entry(*old).or_default() += 1;
        *news.entry(*new).or_default() += 1;
    }

    pairs
        .iter()
        .map(|(old, new)| {
            if olds[old] > 1 {
                MappingType::OneToMany
            } else if news[new] > 1 {
                MappingType::ManyToOne
            } else {
                MappingType::OneToOne
            }
        })
        .collect()
}
