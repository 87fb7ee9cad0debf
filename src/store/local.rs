use std::{
    collections::{BTreeSet, HashMap},
    hash::Hash,
    fs::{create_dir_all, read_to_string, write},
    path::PathBuf,
};

use _model::{AddressRecord, BridgeMapping, BuildingRecord, GersId, RoutePlan};
use anyhow::{bail, Context, Result};
use geo::{BoundingRect, Centroid, HaversineDistance, Intersects, Point, Polygon};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use super::{
    AddressStore, BridgeStore, BuildingStore, Catalog, CatalogHit, CatalogProbe, GoldStore,
    MatchStrategy, MunicipalSource, PlanStore, UnresolvedAddress, WriteMode,
};

const ADDRESSES: &str = "addresses.json";
const BUILDINGS: &str = "buildings.json";
const GOLD_ADDRESSES: &str = "gold-addresses.json";
const GOLD_BUILDINGS: &str = "gold-buildings.json";
const CATALOG_ADDRESSES: &str = "catalog-addresses.json";
const CATALOG_BUILDINGS: &str = "catalog-buildings.json";
const BRIDGE: &str = "bridge.json";

/// Address row of the global catalog. References are raw text as published.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogAddress {
    #[serde(default)]
    pub gers_id: Option<String>,
    pub point: Point,
    #[serde(default)]
    pub building_ref: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogBuilding {
    pub id: String,
    pub polygon: Polygon,
}

/// JSON files in one directory. Each call reads what it needs and rewrites
/// what it changed, so nothing is shared between calls.
pub struct LocalStore {
    dir: PathBuf,
    direct_match_radius_m: f64,
}

impl LocalStore {
    pub fn new(dir: impl Into<PathBuf>, direct_match_radius_m: f64) -> Self {
        Self {
            dir: dir.into(),
            direct_match_radius_m,
        }
    }

    fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&read_to_string(&path)?)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    fn save<T: Serialize>(&self, name: &str, rows: &[T]) -> Result<()> {
        create_dir_all(&self.dir)?;
        let mut contents = serde_json::to_string_pretty(rows)?;
        contents.push('\n');
        write(self.dir.join(name), contents)?;
        Ok(())
    }

    /// Replaces rows whose `key` matches and appends the rest.
    fn upsert_by<T, K>(&self, name: &str, rows: &[T], key: impl Fn(&T) -> K) -> Result<usize>
    where
        T: Clone + Serialize + DeserializeOwned,
        K: Eq + Hash,
    {
        let mut existing: Vec<T> = self.load(name)?;
        let mut index: HashMap<K, usize> = existing
            .iter()
            .enumerate()
            .map(|(i, x)| (key(x), i))
            .collect();

        for row in rows {
            match index.get(&key(row)) {
                Some(i) => existing[*i] = row.clone(),
                None => {
                    index.insert(key(row), existing.len());
                    existing.push(row.clone());
                }
            }
        }

        self.save(name, &existing)?;
        Ok(rows.len())
    }

    #[cfg(test)]
    pub fn seed_catalog(
        &self,
        addresses: &[CatalogAddress],
        buildings: &[CatalogBuilding],
    ) -> Result<()> {
        self.save(CATALOG_ADDRESSES, addresses)?;
        self.save(CATALOG_BUILDINGS, buildings)
    }
}

fn same_region(record: &AddressRecord, region: Option<&str>) -> bool {
    match (region, record.components.region.as_deref()) {
        (Some(wanted), Some(x)) => wanted.eq_ignore_ascii_case(x),
        (Some(_), None) => false,
        (None, _) => true,
    }
}

impl MunicipalSource for LocalStore {
    fn addresses(&self, polygon: &Polygon, region: Option<&str>) -> Result<Vec<AddressRecord>> {
        let rows: Vec<AddressRecord> = self.load(GOLD_ADDRESSES)?;
        Ok(rows
            .into_iter()
            .filter(|x| polygon.intersects(&x.point) && same_region(x, region))
            .collect())
    }

    fn buildings(&self, polygon: &Polygon) -> Result<Vec<BuildingRecord>> {
        let rows: Vec<BuildingRecord> = self.load(GOLD_BUILDINGS)?;
        Ok(rows
            .into_iter()
            .filter(|x| polygon.intersects(&x.polygon))
            .collect())
    }
}

impl GoldStore for LocalStore {
    fn upsert_gold_addresses(&self, rows: &[AddressRecord]) -> Result<usize> {
        self.upsert_by(GOLD_ADDRESSES, rows, AddressRecord::unlinked_key)
    }

    fn upsert_gold_buildings(&self, rows: &[BuildingRecord]) -> Result<usize> {
        self.upsert_by(GOLD_BUILDINGS, rows, |x| x.gers_id)
    }
}

impl AddressStore for LocalStore {
    fn upsert_addresses(&self, rows: &[AddressRecord]) -> Result<usize> {
        let mut existing: Vec<AddressRecord> = self.load(ADDRESSES)?;
        let mut index = HashMap::new();
        for (i, x) in existing.iter().enumerate() {
            index.insert(x.conflict_key(), i);
            index.insert(x.unlinked_key(), i);
        }

        for row in rows {
            let found = index
                .get(&row.conflict_key())
                .or_else(|| index.get(&row.unlinked_key()))
                .copied();
            match found {
                Some(i) => {
                    let old = &existing[i];
                    let mut row = row.clone();
                    row.id = old.id;
                    row.building_id = row.building_id.or(old.building_id);
                    row.legacy_building_ref =
                        row.legacy_building_ref.or_else(|| old.legacy_building_ref.clone());
                    index.insert(row.conflict_key(), i);
                    existing[i] = row;
                }
                None => {
                    index.insert(row.conflict_key(), existing.len());
                    index.insert(row.unlinked_key(), existing.len());
                    existing.push(row.clone());
                }
            }
        }

        self.save(ADDRESSES, &existing)?;
        Ok(rows.len())
    }

    fn unresolved(&self, campaign: Option<Uuid>) -> Result<Vec<UnresolvedAddress>> {
        let rows: Vec<AddressRecord> = self.load(ADDRESSES)?;
        Ok(rows
            .into_iter()
            .filter(|x| x.building_id.is_none())
            .filter(|x| campaign.is_none() || x.campaign_id == campaign)
            .map(|x| UnresolvedAddress {
                id: x.id,
                campaign_id: x.campaign_id,
                gers_id: x.gers_id,
                geom: Some(_model::geojson::ewkt(x.point)),
            })
            .collect())
    }

    fn campaign_addresses(&self, campaign: Uuid) -> Result<Vec<AddressRecord>> {
        let rows: Vec<AddressRecord> = self.load(ADDRESSES)?;
        Ok(rows
            .into_iter()
            .filter(|x| x.campaign_id == Some(campaign))
            .collect())
    }

    fn linked_addresses(&self, campaign: Option<Uuid>) -> Result<Vec<AddressRecord>> {
        let rows: Vec<AddressRecord> = self.load(ADDRESSES)?;
        Ok(rows
            .into_iter()
            .filter(|x| x.building_id.is_some())
            .filter(|x| campaign.is_none() || x.campaign_id == campaign)
            .collect())
    }

    fn write_building_ids(&self, rows: &[(Uuid, GersId)], mode: WriteMode) -> Result<usize> {
        let mut existing: Vec<AddressRecord> = self.load(ADDRESSES)?;
        let updates: HashMap<Uuid, GersId> = rows.iter().copied().collect();

        let mut updated = 0;
        for x in existing.iter_mut() {
            if let Some(id) = updates.get(&x.id) {
                x.building_id = Some(*id);
                if mode == WriteMode::DoubleWrite {
                    x.legacy_building_ref = Some(id.to_string());
                }
                updated += 1;
            }
        }

        self.save(ADDRESSES, &existing)?;
        Ok(updated)
    }
}

impl BuildingStore for LocalStore {
    fn upsert_buildings(&self, rows: &[BuildingRecord]) -> Result<usize> {
        self.upsert_by(BUILDINGS, rows, |x| x.gers_id)
    }

    fn campaign_buildings(&self, campaign: Uuid) -> Result<Vec<BuildingRecord>> {
        let rows: Vec<BuildingRecord> = self.load(BUILDINGS)?;
        Ok(rows
            .into_iter()
            .filter(|x| x.campaign_id == Some(campaign))
            .collect())
    }

    fn buildings_near(
        &self,
        campaign: Option<Uuid>,
        center: Point,
        radius_m: f64,
    ) -> Result<Vec<BuildingRecord>> {
        let rows: Vec<BuildingRecord> = self.load(BUILDINGS)?;
        Ok(rows
            .into_iter()
            .filter(|x| x.campaign_id == campaign)
            .filter(|x| x.centroid.haversine_distance(&center) <= radius_m)
            .collect())
    }
}

impl Catalog for LocalStore {
    fn match_points(&self, probes: &[CatalogProbe]) -> Result<Vec<CatalogHit>> {
        let addresses: Vec<CatalogAddress> = self.load(CATALOG_ADDRESSES)?;
        let buildings: Vec<CatalogBuilding> = self.load(CATALOG_BUILDINGS)?;
        let buildings: Vec<_> = buildings
            .iter()
            .filter_map(|x| Some((x, x.polygon.bounding_rect()?, x.polygon.centroid()?)))
            .collect();

        let mut hits = Vec::new();
        for probe in probes {
            for x in &addresses {
                let Some(building_ref) = &x.building_ref else {
                    continue;
                };
                let distance = probe.point.haversine_distance(&x.point);
                let same_feature = match (probe.gers_id, x.gers_id.as_deref()) {
                    (Some(a), Some(b)) => GersId::normalize(b) == Some(a),
                    _ => false,
                };
                if same_feature || distance <= self.direct_match_radius_m {
                    hits.push(CatalogHit {
                        address_id: probe.address_id,
                        building_ref: building_ref.clone(),
                        strategy: MatchStrategy::Direct,
                        distance_m: distance,
                    });
                }
            }

            for (building, rect, centroid) in &buildings {
                if rect.intersects(&probe.point) && building.polygon.intersects(&probe.point) {
                    hits.push(CatalogHit {
                        address_id: probe.address_id,
                        building_ref: building.id.clone(),
                        strategy: MatchStrategy::Containment,
                        distance_m: probe.point.haversine_distance(centroid),
                    });
                }
            }
        }

        Ok(hits)
    }
}

impl BridgeStore for LocalStore {
    fn upsert_mappings(&self, rows: &[BridgeMapping]) -> Result<usize> {
        self.upsert_by(BRIDGE, rows, BridgeMapping::key)
    }

    fn mappings_for(&self, old_ids: &[GersId]) -> Result<Vec<BridgeMapping>> {
        let wanted: BTreeSet<_> = old_ids.iter().collect();
        let rows: Vec<BridgeMapping> = self.load(BRIDGE)?;
        Ok(rows
            .into_iter()
            .filter(|x| wanted.contains(&x.old_id))
            .collect())
    }
}

impl PlanStore for LocalStore {
    fn save_plan(&self, plan: &RoutePlan) -> Result<()> {
        let dir = self.dir.join("plans");
        create_dir_all(&dir)?;
        let path = dir.join(format!("{}.json", plan.id));
        if path.exists() {
            bail!("plan {} already exists", plan.id);
        }

        let mut contents = serde_json::to_string_pretty(plan)?;
        contents.push('\n');
        write(path, contents)?;
        Ok(())
    }
}
