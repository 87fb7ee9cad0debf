//! Gives every address still lacking a building one, in a single catalog
//! query and a handful of bulk writes.

use std::collections::{BTreeMap, HashMap, HashSet};

use _model::{geojson::parse_point, GersId};
use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::LinkerConfig,
    store::{AddressStore, Catalog, CatalogHit, CatalogProbe, MatchStrategy, WriteMode},
    utils::progress_bar,
};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub success: usize,
    pub errors: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LinkReport {
    pub matched: usize,
    pub unmatched: usize,
    pub errors: usize,
    pub direct: usize,
    pub containment: usize,
    /// Matches dropped because the building already has an address in the
    /// same campaign. Also counted as unmatched.
    pub collisions: usize,
}

/// The winning candidate per address: any direct reference beats every
/// containment hit, and within a strategy the nearest wins.
pub fn choose(hits: Vec<CatalogHit>) -> BTreeMap<Uuid, CatalogHit> {
    let mut best: BTreeMap<Uuid, CatalogHit> = BTreeMap::new();
    for hit in hits {
        match best.get(&hit.address_id) {
            Some(x) if (x.strategy, x.distance_m) <= (hit.strategy, hit.distance_m) => {}
            _ => {
                best.insert(hit.address_id, hit);
            }
        }
    }
    best
}

/// Hits ordered best first: strategy, then distance, then address id.
fn ranked(chosen: BTreeMap<Uuid, CatalogHit>) -> Vec<CatalogHit> {
    let mut hits: Vec<CatalogHit> = chosen.into_values().collect();
    hits.sort_by(|a, b| {
        a.strategy
            .cmp(&b.strategy)
            .then(a.distance_m.total_cmp(&b.distance_m))
    });
    hits
}

/// Writes `rows` in chunks of `size`. A chunk that fails is counted as errors
/// and the remaining chunks still run.
pub fn write_batches<S: AddressStore + ?Sized>(
    store: &S,
    rows: &[(Uuid, GersId)],
    size: usize,
    mode: WriteMode,
) -> BatchOutcome {
    let pb = progress_bar(rows.len() as u64, "Writing building ids");
    let mut outcome = BatchOutcome::default();
    for chunk in rows.chunks(size.max(1)) {
        match store.write_building_ids(chunk, mode) {
            Ok(_) => outcome.success += chunk.len(),
            Err(e) => {
                warn!(rows = chunk.len(), "building id batch failed: {e:#}");
                outcome.errors += chunk.len();
            }
        }
        pb.inc(chunk.len() as u64);
    }
    pb.finish_and_clear();
    outcome
}

pub fn link_unresolved<S: AddressStore + Catalog + ?Sized>(
    store: &S,
    campaign: Option<Uuid>,
    config: &LinkerConfig,
    mode: WriteMode,
) -> Result<LinkReport> {
    let mut report = LinkReport::default();
    let candidates = store.unresolved(campaign)?;
    info!(count = candidates.len(), "addresses without a building");

    let mut probes = Vec::with_capacity(candidates.len());
    let mut campaigns: HashMap<Uuid, Option<Uuid>> = HashMap::new();
    for x in candidates {
        campaigns.insert(x.id, x.campaign_id);
        match x.geom.as_deref().and_then(parse_point) {
            Some(point) => probes.push(CatalogProbe {
                address_id: x.id,
                gers_id: x.gers_id,
                point,
            }),
            None => {
                warn!(id = %x.id, geom = ?x.geom, "skipping address with unparseable geometry");
                report.unmatched += 1;
            }
        }
    }
    if probes.is_empty() {
        return Ok(report);
    }

    // One address per building within a campaign, counting links made earlier.
    let mut taken: HashSet<(Option<Uuid>, GersId)> = store
        .linked_addresses(campaign)?
        .into_iter()
        .filter_map(|x| Some((x.campaign_id, x.building_id?)))
        .collect();

    let chosen = ranked(choose(store.match_points(&probes)?));
    let mut strategies: HashMap<Uuid, MatchStrategy> = HashMap::new();
    let mut rows = Vec::with_capacity(chosen.len());
    for hit in chosen {
        let address = hit.address_id;
        let Some(id) = GersId::normalize(&hit.building_ref) else {
            warn!(%address, raw = %hit.building_ref, "discarding invalid building id");
            continue;
        };
        let scope = campaigns.get(&address).copied().flatten();
        if !taken.insert((scope, id)) {
            warn!(%address, building = %id, "building already has an address in this campaign");
            report.collisions += 1;
            continue;
        }
        strategies.insert(address, hit.strategy);
        rows.push((address, id));
    }
    rows.sort_by_key(|(address, _)| *address);
    report.unmatched += probes.len() - rows.len();

    let outcome = write_batches(store, &rows, config.write_batch, mode);
    report.matched = outcome.success;
    report.errors = outcome.errors;
    for (address, _) in &rows {
        match strategies.get(address) {
            Some(MatchStrategy::Direct) => report.direct += 1,
            Some(MatchStrategy::Containment) => report.containment += 1,
            None => {}
        }
    }

    info!(
        matched = report.matched,
        unmatched = report.unmatched,
        errors = report.errors,
        direct = report.direct,
        containment = report.containment,
        collisions = report.collisions,
        "linked addresses"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use _model::{AddressComponents, AddressRecord, AddressSource};
    use anyhow::bail;
    use geo::{LineString, Point, Polygon};

    use super::*;
    use crate::store::{
        local::{CatalogAddress, CatalogBuilding},
        LocalStore, UnresolvedAddress,
    };

    const A: &str = "08b2a100d2c64fff02000d8b2b4b5c01";
    const B: &str = "08b2a100d2c64fff02000d8b2b4b5c02";

    fn hit(address: Uuid, building: &str, strategy: MatchStrategy, distance: f64) -> CatalogHit {
        CatalogHit {
            address_id: address,
            building_ref: building.to_string(),
            strategy,
            distance_m: distance,
        }
    }

    fn square(x: f64, y: f64, size: f64) -> Polygon {
        Polygon::new(
            LineString::from(vec![
                (x, y),
                (x + size, y),
                (x + size, y + size),
                (x, y + size),
                (x, y),
            ]),
            vec![],
        )
    }

    fn address(number: u32, point: Point) -> AddressRecord {
        AddressRecord::new(
            None,
            AddressComponents {
                house_number: Some(number.to_string()),
                street_name: Some("Oak St".to_string()),
                ..Default::default()
            },
            point,
            AddressSource::Snapshot,
        )
    }

    #[test]
    fn direct_beats_nearer_containment() {
        let id = Uuid::new_v4();
        let chosen = choose(vec![
            hit(id, B, MatchStrategy::Containment, 0.5),
            hit(id, A, MatchStrategy::Direct, 40.0),
        ]);
        assert_eq!(chosen[&id].building_ref, A);
    }

    #[test]
    fn nearest_containment_wins() {
        let id = Uuid::new_v4();
        let chosen = choose(vec![
            hit(id, A, MatchStrategy::Containment, 9.0),
            hit(id, B, MatchStrategy::Containment, 3.0),
        ]);
        assert_eq!(chosen[&id].building_ref, B);
    }

    #[test]
    fn links_through_local_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path(), 1.5);

        let referenced = address(1, Point::new(-79.40, 43.70));
        let contained = address(3, Point::new(-79.3995, 43.7005));
        let orphan = address(5, Point::new(-79.0, 43.0));
        store
            .upsert_addresses(&[referenced.clone(), contained.clone(), orphan.clone()])
            .unwrap();
        store
            .seed_catalog(
                &[CatalogAddress {
                    gers_id: None,
                    point: referenced.point,
                    building_ref: Some(A.to_uppercase()),
                }],
                &[CatalogBuilding {
                    id: B.to_string(),
                    polygon: square(-79.4, 43.7, 0.001),
                }],
            )
            .unwrap();

        let report = link_unresolved(&store, None, &LinkerConfig::default(), WriteMode::Canonical)
            .unwrap();
        assert_eq!(report.matched, 2);
        assert_eq!(report.unmatched, 1);
        assert_eq!(report.errors, 0);
        assert_eq!(report.direct, 1);
        assert_eq!(report.containment, 1);

        let linked = store.linked_addresses(None).unwrap();
        let building = |id: Uuid| linked.iter().find(|x| x.id == id).and_then(|x| x.building_id);
        assert_eq!(building(referenced.id), GersId::normalize(A));
        assert_eq!(building(contained.id), GersId::normalize(B));
        assert!(linked.iter().all(|x| x.legacy_building_ref.is_none()));

        // Only the orphan is left, and it still has no candidate.
        let again = link_unresolved(&store, None, &LinkerConfig::default(), WriteMode::Canonical)
            .unwrap();
        assert_eq!(again.matched, 0);
        assert_eq!(again.unmatched, 1);
        let relinked = store.linked_addresses(None).unwrap();
        assert_eq!(
            relinked.iter().map(|x| (x.id, x.building_id)).collect::<Vec<_>>(),
            linked.iter().map(|x| (x.id, x.building_id)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn double_write_fills_legacy_column() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path(), 1.5);
        let x = address(1, Point::new(-79.40, 43.70));
        store.upsert_addresses(&[x.clone()]).unwrap();
        store
            .seed_catalog(
                &[CatalogAddress {
                    gers_id: None,
                    point: x.point,
                    building_ref: Some(A.to_string()),
                }],
                &[],
            )
            .unwrap();

        link_unresolved(&store, None, &LinkerConfig::default(), WriteMode::DoubleWrite).unwrap();
        let linked = store.linked_addresses(None).unwrap();
        assert_eq!(
            linked[0].legacy_building_ref.as_deref(),
            Some("08b2a100-d2c6-4fff-0200-0d8b2b4b5c01")
        );
    }

    #[test]
    fn one_address_per_building_in_a_campaign() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path(), 1.5);
        let campaign = Some(Uuid::new_v4());

        let mut near = address(1, Point::new(-79.3995, 43.7005));
        near.campaign_id = campaign;
        let mut far = address(3, Point::new(-79.3991, 43.7009));
        far.campaign_id = campaign;
        let mut other_campaign = address(5, Point::new(-79.3991, 43.7009));
        other_campaign.campaign_id = Some(Uuid::new_v4());
        store
            .upsert_addresses(&[far.clone(), near.clone(), other_campaign.clone()])
            .unwrap();
        store
            .seed_catalog(
                &[],
                &[CatalogBuilding {
                    id: A.to_string(),
                    polygon: square(-79.4, 43.7, 0.001),
                }],
            )
            .unwrap();

        let report = link_unresolved(&store, None, &LinkerConfig::default(), WriteMode::Canonical)
            .unwrap();
        assert_eq!(report.matched, 2);
        assert_eq!(report.unmatched, 1);
        assert_eq!(report.collisions, 1);

        let linked = store.linked_addresses(None).unwrap();
        let mut ids: Vec<_> = linked.iter().map(|x| x.id).collect();
        ids.sort();
        let mut expected = vec![near.id, other_campaign.id];
        expected.sort();
        assert_eq!(ids, expected);

        // The earlier link still owns the building on a second run.
        let again = link_unresolved(&store, campaign, &LinkerConfig::default(), WriteMode::Canonical)
            .unwrap();
        assert_eq!(again.matched, 0);
        assert_eq!(again.collisions, 1);
    }

    struct FakeStore {
        unresolved: Vec<UnresolvedAddress>,
        hits: Vec<CatalogHit>,
        fail_batches: Vec<usize>,
        batches: RefCell<Vec<Vec<(Uuid, GersId)>>>,
    }

    impl AddressStore for FakeStore {
        fn upsert_addresses(&self, rows: &[AddressRecord]) -> Result<usize> {
            Ok(rows.len())
        }

        fn unresolved(&self, _: Option<Uuid>) -> Result<Vec<UnresolvedAddress>> {
            Ok(self.unresolved.clone())
        }

        fn campaign_addresses(&self, _: Uuid) -> Result<Vec<AddressRecord>> {
            Ok(Vec::new())
        }

        fn linked_addresses(&self, _: Option<Uuid>) -> Result<Vec<AddressRecord>> {
            Ok(Vec::new())
        }

        fn write_building_ids(&self, rows: &[(Uuid, GersId)], _: WriteMode) -> Result<usize> {
            let mut batches = self.batches.borrow_mut();
            let n = batches.len();
            batches.push(rows.to_vec());
            if self.fail_batches.contains(&n) {
                bail!("deadlock detected");
            }
            Ok(rows.len())
        }
    }

    impl Catalog for FakeStore {
        fn match_points(&self, _: &[CatalogProbe]) -> Result<Vec<CatalogHit>> {
            Ok(self.hits.clone())
        }
    }

    fn unresolved(geom: Option<&str>) -> UnresolvedAddress {
        UnresolvedAddress {
            id: Uuid::new_v4(),
            campaign_id: None,
            gers_id: None,
            geom: geom.map(str::to_string),
        }
    }

    #[test]
    fn failed_batch_does_not_stop_the_rest() {
        let addresses: Vec<_> = (0..5)
            .map(|_| unresolved(Some("SRID=4326;POINT(-79.4 43.7)")))
            .collect();
        let hits = addresses
            .iter()
            .enumerate()
            .map(|(i, x)| {
                let building = format!("08b2a100d2c64fff02000d8b2b4b5d0{i}");
                hit(x.id, &building, MatchStrategy::Containment, 1.0)
            })
            .collect();
        let store = FakeStore {
            unresolved: addresses,
            hits,
            fail_batches: vec![1],
            batches: RefCell::new(Vec::new()),
        };
        let config = LinkerConfig {
            write_batch: 2,
            ..Default::default()
        };

        let report = link_unresolved(&store, None, &config, WriteMode::Canonical).unwrap();
        assert_eq!(store.batches.borrow().len(), 3);
        assert_eq!(report.matched, 3);
        assert_eq!(report.errors, 2);
    }

    #[test]
    fn bad_geometry_and_bad_ids_are_unmatched() {
        let good = unresolved(Some(r#"{"type":"Point","coordinates":[-79.4,43.7]}"#));
        let invalid_ref = unresolved(Some("SRID=4326;POINT(-79.4 43.7)"));
        let store = FakeStore {
            hits: vec![
                hit(good.id, A, MatchStrategy::Direct, 0.0),
                hit(invalid_ref.id, "not-a-gers-id", MatchStrategy::Direct, 0.0),
            ],
            unresolved: vec![good.clone(), invalid_ref, unresolved(Some("garbage")), unresolved(None)],
            fail_batches: Vec::new(),
            batches: RefCell::new(Vec::new()),
        };

        let report =
            link_unresolved(&store, None, &LinkerConfig::default(), WriteMode::Canonical).unwrap();
        assert_eq!(report.matched, 1);
        assert_eq!(report.unmatched, 3);
        assert_eq!(
            store.batches.borrow()[0],
            vec![(good.id, GersId::normalize(A).unwrap())]
        );
    }
}
