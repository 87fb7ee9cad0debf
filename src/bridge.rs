//! Jobs around upstream identifier churn: loading a release's bridge file and
//! rewriting stale building ids with it.

use std::{
    collections::{BTreeMap, BTreeSet},
    io::BufRead,
    path::PathBuf,
};

use _model::{classify, BridgeMapping, GersId, MappingType};
use anyhow::Result;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    linker::{write_batches, BatchOutcome},
    store::{AddressStore, BridgeStore, WriteMode},
    utils::{open_lines, progress_bar},
};

#[derive(Clone, Debug)]
pub struct BridgeImport {
    pub release_date: NaiveDate,
    /// JSON lines, optionally `.zst` compressed.
    pub input: PathBuf,
    pub batch: usize,
}

#[derive(Debug, Deserialize)]
struct RawBridgeRow {
    #[serde(alias = "old_gers_id")]
    old_id: String,
    #[serde(alias = "new_gers_id")]
    new_id: String,
    #[serde(default)]
    mapping_type: Option<MappingType>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BridgeImportReport {
    pub read: usize,
    pub skipped: usize,
    pub upserted: usize,
    pub errors: usize,
}

type ParsedRow = (GersId, GersId, Option<MappingType>);

fn read_rows(input: impl BufRead, report: &mut BridgeImportReport) -> Result<Vec<ParsedRow>> {
    let mut rows = Vec::new();
    for (n, line) in input.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        report.read += 1;

        let raw: RawBridgeRow = match serde_json::from_str(&line) {
            Ok(x) => x,
            Err(e) => {
                warn!(line = n + 1, "unreadable bridge row: {e}");
                report.skipped += 1;
                continue;
            }
        };
        match (GersId::normalize(&raw.old_id), GersId::normalize(&raw.new_id)) {
            (Some(old), Some(new)) => rows.push((old, new, raw.mapping_type)),
            _ => {
                warn!(
                    line = n + 1,
                    old = %raw.old_id,
                    new = %raw.new_id,
                    "invalid bridge identifiers"
                );
                report.skipped += 1;
            }
        }
    }
    Ok(rows)
}

/// Rows without a type are classified against the whole file.
pub fn import_bridge<S: BridgeStore + ?Sized>(
    store: &S,
    job: &BridgeImport,
) -> Result<BridgeImportReport> {
    let mut report = BridgeImportReport::default();
    let rows = read_rows(open_lines(&job.input)?, &mut report)?;

    let pairs: Vec<(GersId, GersId)> = rows.iter().map(|(old, new, _)| (*old, *new)).collect();
    let mappings: Vec<BridgeMapping> = rows
        .into_iter()
        .zip(classify(&pairs))
        .map(|((old_id, new_id, given), derived)| BridgeMapping {
            old_id,
            new_id,
            release_date: job.release_date,
            mapping_type: given.unwrap_or(derived),
        })
        .collect();

    let pb = progress_bar(mappings.len() as u64, "Importing bridge");
    for chunk in mappings.chunks(job.batch.max(1)) {
        match store.upsert_mappings(chunk) {
            Ok(_) => report.upserted += chunk.len(),
            Err(e) => {
                warn!(rows = chunk.len(), "bridge batch failed: {e:#}");
                report.errors += chunk.len();
            }
        }
        pb.inc(chunk.len() as u64);
    }
    pb.finish_and_clear();

    info!(
        release = %job.release_date,
        read = report.read,
        skipped = report.skipped,
        upserted = report.upserted,
        errors = report.errors,
        "imported bridge"
    );
    Ok(report)
}

#[derive(Clone, Debug)]
pub struct BridgeRepair {
    pub campaign: Option<Uuid>,
    pub mode: WriteMode,
    pub batch: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BridgeRepairReport {
    pub examined: usize,
    pub repaired: usize,
    pub ambiguous: usize,
    pub errors: usize,
}

/// Latest mapping per old identifier.
fn newest(mappings: Vec<BridgeMapping>) -> BTreeMap<GersId, BridgeMapping> {
    let mut output: BTreeMap<GersId, BridgeMapping> = BTreeMap::new();
    for x in mappings {
        match output.get(&x.old_id) {
            Some(y) if y.release_date >= x.release_date => {}
            _ => {
                output.insert(x.old_id, x);
            }
        }
    }
    output
}

/// Points linked addresses whose building id has a successor at it. Only
/// one-to-one and many-to-one mappings are followed.
pub fn repair_bridged<S: AddressStore + BridgeStore + ?Sized>(
    store: &S,
    job: &BridgeRepair,
) -> Result<BridgeRepairReport> {
    let linked = store.linked_addresses(job.campaign)?;
    let ids: Vec<GersId> = linked
        .iter()
        .filter_map(|x| x.building_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let mappings = newest(store.mappings_for(&ids)?);

    let mut report = BridgeRepairReport {
        examined: linked.len(),
        ..Default::default()
    };
    let mut rows = Vec::new();
    for x in &linked {
        let Some(mapping) = x.building_id.and_then(|id| mappings.get(&id)) else {
            continue;
        };
        if !mapping.mapping_type.is_unambiguous() {
            warn!(address = %x.id, old = %mapping.old_id, "building was split, leaving as is");
            report.ambiguous += 1;
        } else if mapping.new_id != mapping.old_id {
            rows.push((x.id, mapping.new_id));
        }
    }

    let BatchOutcome { success, errors } = write_batches(store, &rows, job.batch, job.mode);
    report.repaired = success;
    report.errors = errors;
    info!(
        examined = report.examined,
        repaired = report.repaired,
        ambiguous = report.ambiguous,
        errors = report.errors,
        "repaired bridged building ids"
    );
    Ok(report)
}
