use std::{io::BufRead, path::PathBuf};

use _model::{AddressRecord, AddressSource, BuildingRecord};
use anyhow::Result;
use indicatif::ProgressBar;
use itertools::Itertools;
use rayon::prelude::*;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    resolver::municipal::{MunicipalBuildingRow, MunicipalRow},
    store::{AddressStore, GoldStore},
    utils::{open_lines, progress_style},
};

/// Cleaned municipal rows, one JSON object per line.
#[derive(Clone, Debug)]
pub struct BulkImport {
    pub input: PathBuf,
    pub campaign_id: Uuid,
    pub batch: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BulkImportReport {
    pub read: usize,
    pub skipped: usize,
    pub upserted: usize,
}

fn parse<T: DeserializeOwned>(kind: &str, line: &str) -> Option<T> {
    match serde_json::from_str(line) {
        Ok(x) => Some(x),
        Err(e) => {
            warn!("unreadable {kind} row: {e}");
            None
        }
    }
}

/// Refines `input` in parallel chunks of `batch` lines and hands each chunk's
/// survivors to `write`.
fn import_lines<T: Send>(
    input: impl BufRead,
    batch: usize,
    message: &'static str,
    refine: impl Fn(&str) -> Option<T> + Sync,
    mut write: impl FnMut(&[T]) -> Result<usize>,
) -> Result<BulkImportReport> {
    let mut report = BulkImportReport::default();
    let pb = ProgressBar::new_spinner().with_style(progress_style());
    pb.set_message(message);

    for chunk in &input.lines().chunks(batch.max(1)) {
        let chunk: Vec<String> = chunk.try_collect()?;
        let chunk: Vec<&String> = chunk.iter().filter(|x| !x.trim().is_empty()).collect();
        let rows: Vec<T> = chunk.par_iter().filter_map(|x| refine(x)).collect();

        report.read += chunk.len();
        report.skipped += chunk.len() - rows.len();
        report.upserted += write(&rows)?;
        pb.inc(chunk.len() as u64);
    }
    pb.finish_and_clear();
    Ok(report)
}

pub fn import_addresses<S: AddressStore + ?Sized>(
    store: &S,
    job: &BulkImport,
) -> Result<BulkImportReport> {
    let report = import_lines(
        open_lines(&job.input)?,
        job.batch,
        "Importing addresses",
        |line| {
            parse::<MunicipalRow>("address", line)?
                .refine(Some(job.campaign_id), AddressSource::BulkImport)
        },
        |rows| store.upsert_addresses(rows),
    )?;

    info!(
        read = report.read,
        skipped = report.skipped,
        upserted = report.upserted,
        "imported addresses"
    );
    Ok(report)
}

/// Authoritative municipal exports: address rows and building footprints,
/// either or both.
#[derive(Clone, Debug)]
pub struct GoldImport {
    pub addresses: Option<PathBuf>,
    pub buildings: Option<PathBuf>,
    pub batch: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GoldImportReport {
    pub addresses: BulkImportReport,
    pub buildings: BulkImportReport,
}

pub fn import_gold<S: GoldStore + ?Sized>(store: &S, job: &GoldImport) -> Result<GoldImportReport> {
    let mut report = GoldImportReport::default();

    if let Some(path) = &job.addresses {
        report.addresses = import_lines(
            open_lines(path)?,
            job.batch,
            "Importing authoritative addresses",
            |line| parse::<MunicipalRow>("address", line)?.refine(None, AddressSource::Authoritative),
            |rows: &[AddressRecord]| store.upsert_gold_addresses(rows),
        )?;
    }
    if let Some(path) = &job.buildings {
        report.buildings = import_lines(
            open_lines(path)?,
            job.batch,
            "Importing authoritative buildings",
            |line| parse::<MunicipalBuildingRow>("building", line)?.refine(),
            |rows: &[BuildingRecord]| store.upsert_gold_buildings(rows),
        )?;
    }

    info!(
        addresses = report.addresses.upserted,
        buildings = report.buildings.upserted,
        skipped = report.addresses.skipped + report.buildings.skipped,
        "imported authoritative data"
    );
    Ok(report)
}
