//! Turns a polygon into addresses and buildings, preferring authoritative
//! municipal data and falling back to the snapshot service.
//!
//! Tiers are tried in order. Each one is probed for how many addresses it can
//! offer; the first tier whose coverage is sufficient ends the search, and
//! everything consulted so far is merged with the earlier tier winning.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use _model::{AddressRecord, AddressSource, BuildingRecord, GersId};
use geo::Polygon;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{config::SnapshotConfig, error::ResolveError, store::MunicipalSource};

pub mod municipal;
pub mod snapshot;

use snapshot::{race, ExtractRequest, SnapshotPayload, SnapshotSource};

#[derive(Clone, Debug)]
pub struct ResolveRequest {
    pub polygon: Polygon,
    pub region: Option<String>,
    pub campaign_id: Option<Uuid>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolveSource {
    Gold,
    Silver,
    Snapshot,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Tier {
    Authoritative,
    Snapshot,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ResolveCounts {
    pub gold: usize,
    /// Rows offered by the snapshot service.
    #[serde(rename = "lambda")]
    pub snapshot: usize,
    pub total: usize,
    pub buildings: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct ResolveResult {
    pub source: ResolveSource,
    pub addresses: Vec<AddressRecord>,
    pub buildings: Vec<BuildingRecord>,
    pub counts: ResolveCounts,
    /// Kept so callers can pull roads without extracting again.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotPayload>,
}

#[derive(Default)]
pub struct TierRows {
    pub addresses: Vec<AddressRecord>,
    pub buildings: Vec<BuildingRecord>,
    pub snapshot: Option<SnapshotPayload>,
}

pub trait Strategy {
    fn tier(&self) -> Tier;
    /// How many addresses this tier has for the request.
    fn probe(&mut self, request: &ResolveRequest) -> Result<usize, ResolveError>;
    fn fetch(&mut self, request: &ResolveRequest) -> Result<TierRows, ResolveError>;
    /// Whether `count` addresses are enough to stop here.
    fn sufficient(&self, _count: usize) -> bool {
        false
    }
}

/// The municipal dataset. Failures are logged and read as no coverage.
pub struct Authoritative<'a> {
    source: &'a dyn MunicipalSource,
    threshold: usize,
    addresses: Vec<AddressRecord>,
}

impl<'a> Authoritative<'a> {
    pub fn new(source: &'a dyn MunicipalSource, threshold: usize) -> Self {
        Self {
            source,
            threshold,
            addresses: Vec::new(),
        }
    }
}

impl Strategy for Authoritative<'_> {
    fn tier(&self) -> Tier {
        Tier::Authoritative
    }

    fn probe(&mut self, request: &ResolveRequest) -> Result<usize, ResolveError> {
        self.addresses = match self
            .source
            .addresses(&request.polygon, request.region.as_deref())
        {
            Ok(x) => x,
            Err(e) => {
                warn!("authoritative address query failed: {e:#}");
                Vec::new()
            }
        };
        Ok(self.addresses.len())
    }

    fn fetch(&mut self, request: &ResolveRequest) -> Result<TierRows, ResolveError> {
        let buildings = self.source.buildings(&request.polygon).unwrap_or_else(|e| {
            warn!("authoritative building query failed: {e:#}");
            Vec::new()
        });
        Ok(TierRows {
            addresses: std::mem::take(&mut self.addresses),
            buildings,
            snapshot: None,
        })
    }

    fn sufficient(&self, count: usize) -> bool {
        count >= self.threshold
    }
}

/// The snapshot service. Extraction and downloads together are raced against
/// the timeout. Any failure other than the buildings download is fatal for the
/// attempt.
pub struct Snapshot {
    source: Arc<dyn SnapshotSource>,
    config: SnapshotConfig,
    rows: Option<TierRows>,
}

impl Snapshot {
    pub fn new(source: Arc<dyn SnapshotSource>, config: SnapshotConfig) -> Self {
        Self {
            source,
            config,
            rows: None,
        }
    }
}

impl Strategy for Snapshot {
    fn tier(&self) -> Tier {
        Tier::Snapshot
    }

    fn probe(&mut self, request: &ResolveRequest) -> Result<usize, ResolveError> {
        let source = self.source.clone();
        let campaign = request.campaign_id;
        let extract = ExtractRequest::new(
            &self.config,
            &request.polygon,
            request.region.as_deref(),
            campaign,
        );
        let rows = race(self.config.timeout(), move || {
            let payload = source.extract(&extract)?;
            let addresses = source.addresses(&payload, campaign)?;
            let buildings = source.buildings(&payload, campaign).unwrap_or_else(|e| {
                warn!("snapshot building download failed: {e}");
                Vec::new()
            });
            Ok(TierRows {
                addresses,
                buildings,
                snapshot: Some(payload),
            })
        })?;
        let count = rows.addresses.len();
        self.rows = Some(rows);
        Ok(count)
    }

    fn fetch(&mut self, _request: &ResolveRequest) -> Result<TierRows, ResolveError> {
        self.rows.take().ok_or(ResolveError::Aborted)
    }
}

pub struct Resolver<'a> {
    strategies: Vec<Box<dyn Strategy + 'a>>,
}

impl<'a> Resolver<'a> {
    pub fn new(strategies: Vec<Box<dyn Strategy + 'a>>) -> Self {
        Self { strategies }
    }

    /// Authoritative first, then the snapshot service.
    pub fn tiered(
        municipal: &'a dyn MunicipalSource,
        snapshot: Arc<dyn SnapshotSource>,
        threshold: usize,
        config: SnapshotConfig,
    ) -> Self {
        let strategies: Vec<Box<dyn Strategy + 'a>> = vec![
            Box::new(Authoritative::new(municipal, threshold)),
            Box::new(Snapshot::new(snapshot, config)),
        ];
        Self::new(strategies)
    }

    pub fn resolve(&mut self, request: &ResolveRequest) -> Result<ResolveResult, ResolveError> {
        let mut consulted = Vec::new();
        let mut counts = ResolveCounts::default();
        let mut stopped_at_first = false;

        for (i, strategy) in self.strategies.iter_mut().enumerate() {
            let tier = strategy.tier();
            let count = strategy.probe(request)?;
            info!(?tier, count, "probed tier");
            match tier {
                Tier::Authoritative => counts.gold += count,
                Tier::Snapshot => counts.snapshot += count,
            }

            let sufficient = strategy.sufficient(count);
            if count > 0 || sufficient {
                consulted.push((tier, strategy.fetch(request)?));
            }
            if sufficient {
                stopped_at_first = i == 0;
                break;
            }
        }

        let source = if stopped_at_first {
            ResolveSource::Gold
        } else if counts.gold > 0 {
            ResolveSource::Silver
        } else {
            ResolveSource::Snapshot
        };

        let snapshot = consulted.iter_mut().find_map(|(_, x)| x.snapshot.take());
        let buildings = merge_buildings(&consulted);
        let mut addresses = merge_addresses(consulted, source);
        for x in &mut addresses {
            x.campaign_id = request.campaign_id;
        }

        counts.total = addresses.len();
        counts.buildings = buildings.len();
        info!(
            ?source,
            gold = counts.gold,
            snapshot = counts.snapshot,
            total = counts.total,
            "resolved polygon"
        );
        Ok(ResolveResult {
            source,
            addresses,
            buildings,
            counts,
            snapshot,
        })
    }
}

#[derive(PartialEq, Eq, Hash)]
enum MergeKey {
    Parts(String, String),
    Formatted(String),
}

fn merge_key(x: &AddressRecord) -> MergeKey {
    match x.merge_key() {
        Some((number, street)) => MergeKey::Parts(number, street),
        None => MergeKey::Formatted(x.formatted.to_lowercase()),
    }
}

/// Seeds with the lowest tier and lets each higher tier overwrite on a key
/// collision, then keeps one address per building: the one from the highest
/// tier, earliest on a tie.
fn merge_addresses(consulted: Vec<(Tier, TierRows)>, source: ResolveSource) -> Vec<AddressRecord> {
    // (rank, row) where rank 0 is the first tier consulted.
    let mut merged: Vec<(usize, AddressRecord)> = Vec::new();
    let mut index: HashMap<MergeKey, usize> = HashMap::new();

    for (rank, (tier, rows)) in consulted.into_iter().enumerate().rev() {
        for mut x in rows.addresses {
            if tier == Tier::Snapshot && source == ResolveSource::Silver {
                x.source = AddressSource::Merged;
            }
            match index.get(&merge_key(&x)) {
                Some(&i) => merged[i] = (rank, x),
                None => {
                    index.insert(merge_key(&x), merged.len());
                    merged.push((rank, x));
                }
            }
        }
    }

    let mut owners: HashMap<GersId, (usize, usize)> = HashMap::new();
    for (i, (rank, x)) in merged.iter().enumerate() {
        if let Some(id) = x.building_id {
            let owner = owners.entry(id).or_insert((*rank, i));
            if *rank < owner.0 {
                *owner = (*rank, i);
            }
        }
    }
    merged
        .into_iter()
        .enumerate()
        .filter(|(i, (_, x))| match x.building_id {
            Some(id) => owners.get(&id).is_some_and(|(_, owner)| owner == i),
            None => true,
        })
        .map(|(_, (_, x))| x)
        .collect()
}

fn merge_buildings(consulted: &[(Tier, TierRows)]) -> Vec<BuildingRecord> {
    let mut seen = HashSet::new();
    consulted
        .iter()
        .flat_map(|(_, x)| &x.buildings)
        .filter(|x| seen.insert(x.gers_id))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    use _model::{
        geojson::{Feature, FeatureCollection, Geometry},
        AddressComponents,
    };
    use anyhow::{bail, Result};
    use geo::{LineString, Point};
    use serde_json::json;

    use super::{snapshot::SnapshotUrls, *};

    fn square() -> Polygon {
        Polygon::new(
            LineString::from(vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0), (0.0, 0.0)]),
            vec![],
        )
    }

    fn request() -> ResolveRequest {
        ResolveRequest {
            polygon: square(),
            region: Some("ON".to_string()),
            campaign_id: Some(Uuid::new_v4()),
        }
    }

    fn gold(number: u32, street: &str) -> AddressRecord {
        AddressRecord::new(
            None,
            AddressComponents {
                house_number: Some(number.to_string()),
                street_name: Some(street.to_string()),
                ..Default::default()
            },
            Point::new(0.5, 0.5),
            AddressSource::Authoritative,
        )
    }

    struct FakeMunicipal {
        addresses: Vec<AddressRecord>,
        fail: bool,
        buildings: Vec<BuildingRecord>,
    }

    impl MunicipalSource for FakeMunicipal {
        fn addresses(&self, _: &Polygon, _: Option<&str>) -> Result<Vec<AddressRecord>> {
            if self.fail {
                bail!("connection refused");
            }
            Ok(self.addresses.clone())
        }

        fn buildings(&self, _: &Polygon) -> Result<Vec<BuildingRecord>> {
            Ok(self.buildings.clone())
        }
    }

    #[derive(Default)]
    struct FakeSnapshot {
        addresses: Vec<Feature>,
        buildings: Vec<Feature>,
        fail_buildings: bool,
        status: Option<u16>,
        delay: Option<Duration>,
        calls: AtomicUsize,
    }

    impl SnapshotSource for FakeSnapshot {
        fn extract(&self, _: &ExtractRequest) -> Result<SnapshotPayload, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(x) = self.delay {
                thread::sleep(x);
            }
            if let Some(status) = self.status {
                return Err(ResolveError::SnapshotStatus {
                    status,
                    body: "upstream failed".to_string(),
                });
            }
            Ok(SnapshotPayload {
                counts: Default::default(),
                urls: SnapshotUrls {
                    buildings: "buildings".to_string(),
                    addresses: "addresses".to_string(),
                    roads: None,
                    metadata: None,
                },
                warning: None,
            })
        }

        fn download(&self, url: &str) -> Result<FeatureCollection, ResolveError> {
            let features = match url {
                "addresses" => self.addresses.clone(),
                "buildings" if self.fail_buildings => {
                    return Err(ResolveError::SnapshotStatus {
                        status: 404,
                        body: "no such object".to_string(),
                    })
                }
                "buildings" => self.buildings.clone(),
                _ => Vec::new(),
            };
            Ok(FeatureCollection { features })
        }
    }

    fn snapshot_feature(number: u32, street: &str) -> Feature {
        serde_json::from_value(json!({
            "type": "Feature",
            "geometry": Geometry::from(Point::new(0.5, 0.5)),
            "properties": { "number": number, "street": street },
        }))
        .unwrap()
    }

    fn resolve(
        municipal: &FakeMunicipal,
        snapshot: Arc<FakeSnapshot>,
        timeout_secs: u64,
    ) -> Result<ResolveResult, ResolveError> {
        let config = SnapshotConfig {
            timeout_secs,
            ..Default::default()
        };
        Resolver::tiered(municipal, snapshot, 10, config).resolve(&request())
    }

    #[test]
    fn enough_gold_skips_snapshot() {
        let municipal = FakeMunicipal {
            addresses: (1..=15).map(|x| gold(x, "Oak St")).collect(),
            fail: false,
            buildings: Vec::new(),
        };
        let snapshot = Arc::new(FakeSnapshot {
            addresses: vec![snapshot_feature(99, "Elm St")],
            ..Default::default()
        });

        let x = resolve(&municipal, snapshot.clone(), 25).unwrap();
        assert_eq!(x.source, ResolveSource::Gold);
        assert_eq!(x.counts.gold, 15);
        assert_eq!(x.counts.snapshot, 0);
        assert_eq!(x.addresses.len(), 15);
        assert!(x.addresses.iter().all(|x| x.source == AddressSource::Authoritative));
        assert_eq!(snapshot.calls.load(Ordering::SeqCst), 0);
        assert!(x.snapshot.is_none());
        assert_eq!(serde_json::to_value(&x.counts).unwrap()["lambda"], 0);
    }

    #[test]
    fn gold_wins_collisions_in_silver_merge() {
        let municipal = FakeMunicipal {
            addresses: vec![gold(1, "Oak St"), gold(2, "Oak St"), gold(500, "Pine Rd")],
            fail: false,
            buildings: Vec::new(),
        };
        let snapshot = Arc::new(FakeSnapshot {
            addresses: (1..=50).map(|x| snapshot_feature(x, "OAK ST")).collect(),
            ..Default::default()
        });

        let x = resolve(&municipal, snapshot, 25).unwrap();
        assert_eq!(x.source, ResolveSource::Silver);
        assert_eq!(x.counts.gold, 3);
        assert_eq!(x.counts.snapshot, 50);
        assert_eq!(x.addresses.len(), 51);

        let one = x
            .addresses
            .iter()
            .filter(|x| x.merge_key() == Some(("1".to_string(), "oak st".to_string())))
            .collect::<Vec<_>>();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].source, AddressSource::Authoritative);
        assert_eq!(
            x.addresses
                .iter()
                .filter(|x| x.source == AddressSource::Merged)
                .count(),
            48
        );
        assert!(x.snapshot.is_some());
    }

    #[test]
    fn no_gold_is_snapshot() {
        let municipal = FakeMunicipal {
            addresses: Vec::new(),
            fail: false,
            buildings: Vec::new(),
        };
        let snapshot = Arc::new(FakeSnapshot {
            addresses: vec![snapshot_feature(1, "Oak St"), snapshot_feature(3, "Oak St")],
            ..Default::default()
        });

        let x = resolve(&municipal, snapshot, 25).unwrap();
        assert_eq!(x.source, ResolveSource::Snapshot);
        assert_eq!(x.addresses.len(), 2);
        assert!(x.addresses.iter().all(|x| x.source == AddressSource::Snapshot));
    }

    #[test]
    fn gold_failure_is_soft() {
        let municipal = FakeMunicipal {
            addresses: Vec::new(),
            fail: true,
            buildings: Vec::new(),
        };
        let snapshot = Arc::new(FakeSnapshot {
            addresses: vec![snapshot_feature(1, "Oak St")],
            ..Default::default()
        });

        let x = resolve(&municipal, snapshot, 25).unwrap();
        assert_eq!(x.source, ResolveSource::Snapshot);
        assert_eq!(x.counts.gold, 0);
    }

    #[test]
    fn snapshot_status_is_fatal() {
        let municipal = FakeMunicipal {
            addresses: vec![gold(1, "Oak St")],
            fail: false,
            buildings: Vec::new(),
        };
        let snapshot = Arc::new(FakeSnapshot {
            status: Some(503),
            ..Default::default()
        });

        let x = resolve(&municipal, snapshot, 25);
        assert!(matches!(x, Err(ResolveError::SnapshotStatus { status: 503, .. })));
    }

    #[test]
    fn slow_snapshot_times_out() {
        let municipal = FakeMunicipal {
            addresses: Vec::new(),
            fail: false,
            buildings: Vec::new(),
        };
        let snapshot = Arc::new(FakeSnapshot {
            delay: Some(Duration::from_secs(3)),
            ..Default::default()
        });

        let x = resolve(&municipal, snapshot, 1);
        assert!(matches!(x, Err(ResolveError::Timeout(_))));
    }

    #[test]
    fn one_address_per_building() {
        let building = GersId::normalize("08b2a100d2c64fff02000d8b2b4b5c01");
        let mut a = gold(1, "Oak St");
        a.building_id = building;
        let mut b = gold(3, "Oak St");
        b.building_id = building;

        let merged = merge_addresses(
            vec![(
                Tier::Authoritative,
                TierRows {
                    addresses: vec![a.clone(), b],
                    ..Default::default()
                },
            )],
            ResolveSource::Gold,
        );
        assert_eq!(merged, vec![a]);
    }

    #[test]
    fn odd_snapshot_shapes_are_skipped() {
        let municipal = FakeMunicipal {
            addresses: Vec::new(),
            fail: false,
            buildings: Vec::new(),
        };
        let collection: FeatureCollection = serde_json::from_str(
            r#"{"type":"FeatureCollection","features":[
                {"type":"Feature","geometry":{"type":"Point","coordinates":[0.5,0.5]},
                 "properties":{"number":7,"street":"Oak St"}},
                {"type":"Feature","geometry":{"type":"MultiPoint","coordinates":[[0.5,0.5]]},
                 "properties":{"number":9,"street":"Oak St"}}
            ]}"#,
        )
        .unwrap();
        let snapshot = Arc::new(FakeSnapshot {
            addresses: collection.features,
            ..Default::default()
        });

        let x = resolve(&municipal, snapshot, 25).unwrap();
        assert_eq!(x.source, ResolveSource::Snapshot);
        assert_eq!(x.counts.snapshot, 1);
        assert_eq!(x.addresses.len(), 1);
        assert_eq!(x.addresses[0].components.house_number.as_deref(), Some("7"));
    }

    #[test]
    fn gold_keeps_its_building_against_snapshot() {
        let building = GersId::normalize("08b2a100d2c64fff02000d8b2b4b5c01");
        let mut authoritative = gold(1, "Oak St");
        authoritative.building_id = building;
        let mut fallback = gold(1, "Oak St");
        fallback.components.house_number = Some("1A".to_string());
        fallback.source = AddressSource::Snapshot;
        fallback.building_id = building;
        let elsewhere = gold(3, "Oak St");

        let merged = merge_addresses(
            vec![
                (
                    Tier::Authoritative,
                    TierRows {
                        addresses: vec![authoritative.clone()],
                        ..Default::default()
                    },
                ),
                (
                    Tier::Snapshot,
                    TierRows {
                        addresses: vec![fallback, elsewhere],
                        ..Default::default()
                    },
                ),
            ],
            ResolveSource::Silver,
        );
        assert_eq!(merged.len(), 2);
        let owner: Vec<_> = merged.iter().filter(|x| x.building_id == building).collect();
        assert_eq!(owner, vec![&authoritative]);
    }

    #[test]
    fn gold_building_wins_over_snapshot_copy() {
        let shared = GersId::normalize("08b2a100d2c64fff02000d8b2b4b5c01").unwrap();
        let other = "08b2a100d2c64fff02000d8b2b4b5c02";
        let small = Polygon::new(
            LineString::from(vec![(0.0, 0.0), (0.5, 0.0), (0.5, 0.5), (0.0, 0.5), (0.0, 0.0)]),
            vec![],
        );
        let building = |id: &str| -> Feature {
            serde_json::from_value(json!({
                "type": "Feature",
                "id": id,
                "geometry": Geometry::from(&small),
                "properties": {},
            }))
            .unwrap()
        };

        let municipal = FakeMunicipal {
            addresses: vec![gold(1, "Oak St")],
            fail: false,
            buildings: vec![BuildingRecord::new(shared, None, square()).unwrap()],
        };
        let snapshot = Arc::new(FakeSnapshot {
            addresses: vec![snapshot_feature(5, "Oak St")],
            buildings: vec![building(&shared.to_string()), building(other)],
            ..Default::default()
        });

        let x = resolve(&municipal, snapshot, 25).unwrap();
        assert_eq!(x.source, ResolveSource::Silver);
        assert_eq!(x.counts.buildings, 2);
        let kept = x.buildings.iter().find(|x| x.gers_id == shared).unwrap();
        assert_eq!(kept.polygon, square());
    }

    #[test]
    fn failed_building_download_keeps_addresses() {
        let municipal = FakeMunicipal {
            addresses: Vec::new(),
            fail: false,
            buildings: Vec::new(),
        };
        let snapshot = Arc::new(FakeSnapshot {
            addresses: vec![snapshot_feature(1, "Oak St"), snapshot_feature(3, "Oak St")],
            fail_buildings: true,
            ..Default::default()
        });

        let x = resolve(&municipal, snapshot, 25).unwrap();
        assert_eq!(x.source, ResolveSource::Snapshot);
        assert_eq!(x.addresses.len(), 2);
        assert!(x.buildings.is_empty());
    }

    #[test]
    fn missing_parts_do_not_collapse() {
        let blank = |formatted: &str| {
            let mut x = gold(0, "");
            x.components = AddressComponents::default();
            x.formatted = formatted.to_string();
            x
        };
        let merged = merge_addresses(
            vec![(
                Tier::Snapshot,
                TierRows {
                    addresses: vec![blank("Lot 4"), blank("Lot 5")],
                    ..Default::default()
                },
            )],
            ResolveSource::Snapshot,
        );
        assert_eq!(merged.len(), 2);
    }
}
