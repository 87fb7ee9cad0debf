use std::{env, time::Duration};

use _model::{
    geojson::{ewkt, Geometry},
    AddressComponents, AddressRecord, AddressSource, BridgeMapping, BuildingRecord, GersId,
    MappingType, RoutePlan, Sequencing,
};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use geo::{Point, Polygon};
use itertools::Itertools;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use ureq::Agent;
use uuid::Uuid;

use super::{
    AddressStore, BridgeStore, BuildingStore, Catalog, CatalogHit, CatalogProbe, GoldStore,
    MunicipalSource, PlanStore, UnresolvedAddress, WriteMode,
};
use crate::{
    config::{RestConfig, RpcFunctions},
    error::RestError,
    resolver::municipal::{with_signature_fallback, MunicipalBuildingRow, MunicipalRow},
    utils::agent,
};

const ADDRESSES: &str = "campaign_addresses";
const BUILDINGS: &str = "buildings";
const BRIDGE: &str = "gers_bridge";
const GOLD_ADDRESSES: &str = "ref_addresses_gold";
const GOLD_BUILDINGS: &str = "ref_buildings_gold";
const SAVE_PLAN: &str = "save_route_plan";

/// PostgREST endpoint of the hosted database.
pub struct RestClient {
    agent: Agent,
    url: String,
    key: String,
    functions: RpcFunctions,
}

impl RestClient {
    pub fn new(config: &RestConfig) -> Result<Self> {
        let key = env::var(&config.key_env)
            .with_context(|| format!("{} is not set", config.key_env))?;
        Ok(Self {
            agent: agent(Duration::from_secs(config.timeout_secs)),
            url: config.url.trim_end_matches('/').to_string(),
            key,
            functions: config.functions.clone(),
        })
    }

    fn request(&self, method: &str, path: &str) -> ureq::Request {
        self.agent
            .request(method, &format!("{}/rest/v1/{path}", self.url))
            .set("apikey", &self.key)
            .set("Authorization", &format!("Bearer {}", self.key))
    }

    fn rpc<T: DeserializeOwned>(&self, function: &str, body: Value) -> Result<T, RestError> {
        debug!(%function, "rpc");
        self.request("POST", &format!("rpc/{function}"))
            .send_json(body)
            .map_err(|e| RestError::from_ureq(function, e))?
            .into_json()
            .map_err(|e| RestError::Decode(e.to_string()))
    }

    fn select<T: DeserializeOwned>(&self, table: &str, query: &str) -> Result<Vec<T>, RestError> {
        self.request("GET", &format!("{table}?{query}"))
            .call()
            .map_err(|e| RestError::from_ureq(table, e))?
            .into_json()
            .map_err(|e| RestError::Decode(e.to_string()))
    }

    fn upsert<T: Serialize>(
        &self,
        table: &str,
        on_conflict: &str,
        rows: &[T],
    ) -> Result<(), RestError> {
        if rows.is_empty() {
            return Ok(());
        }
        self.request("POST", &format!("{table}?on_conflict={on_conflict}"))
            .set("Prefer", "resolution=merge-duplicates,return=minimal")
            .send_json(rows)
            .map_err(|e| RestError::from_ureq(table, e))?;
        Ok(())
    }
}

/// Wire form of an address row.
#[derive(Debug, Serialize, Deserialize)]
struct AddressRow {
    id: Uuid,
    campaign_id: Option<Uuid>,
    formatted: String,
    #[serde(flatten)]
    components: AddressComponents,
    geom: Geometry,
    source: AddressSource,
    #[serde(default)]
    source_key: Option<String>,
    #[serde(default)]
    gers_id: Option<GersId>,
    #[serde(default)]
    building_gers_id: Option<GersId>,
    #[serde(default)]
    building_id_text: Option<String>,
    #[serde(flatten)]
    sequencing: Sequencing,
}

impl From<&AddressRecord> for AddressRow {
    fn from(x: &AddressRecord) -> Self {
        Self {
            id: x.id,
            campaign_id: x.campaign_id,
            formatted: x.formatted.clone(),
            components: x.components.clone(),
            geom: Geometry::from(x.point),
            source: x.source,
            source_key: x.source_key.clone(),
            gers_id: x.gers_id,
            building_gers_id: x.building_id,
            building_id_text: x.legacy_building_ref.clone(),
            sequencing: x.sequencing.clone(),
        }
    }
}

impl AddressRow {
    fn refine(self) -> Option<AddressRecord> {
        let Some(point) = self.geom.point() else {
            warn!(id = %self.id, "address row has no point geometry");
            return None;
        };
        Some(AddressRecord {
            id: self.id,
            campaign_id: self.campaign_id,
            formatted: self.formatted,
            components: self.components,
            point,
            source: self.source,
            source_key: self.source_key,
            gers_id: self.gers_id,
            building_id: self.building_gers_id,
            legacy_building_ref: self.building_id_text,
            sequencing: self.sequencing,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BuildingRow {
    gers_id: GersId,
    campaign_id: Option<Uuid>,
    geom: Geometry,
    #[serde(default)]
    is_hidden: bool,
    #[serde(default)]
    latest_status: Option<String>,
}

impl From<&BuildingRecord> for BuildingRow {
    fn from(x: &BuildingRecord) -> Self {
        Self {
            gers_id: x.gers_id,
            campaign_id: x.campaign_id,
            geom: Geometry::from(&x.polygon),
            is_hidden: x.hidden,
            latest_status: x.status.clone(),
        }
    }
}

impl BuildingRow {
    fn refine(self) -> Option<BuildingRecord> {
        let mut x = BuildingRecord::new(self.gers_id, self.campaign_id, self.geom.polygon()?)?;
        x.hidden = self.is_hidden;
        x.status = self.latest_status;
        Some(x)
    }
}

/// Column layout of the authoritative address table, the same one the dataset
/// RPC reads back as a `MunicipalRow`.
#[derive(Debug, Serialize)]
struct GoldAddressRow {
    source_id: String,
    external_id: String,
    street_number: Option<String>,
    street_name: Option<String>,
    unit: Option<String>,
    city: Option<String>,
    zip: Option<String>,
    province: Option<String>,
    address_gers_id: Option<GersId>,
    building_gers_id: Option<GersId>,
    geom: String,
}

impl GoldAddressRow {
    /// Needs a `source:external` key to upsert on.
    fn new(x: &AddressRecord) -> Option<Self> {
        let (source_id, external_id) = x.source_key.as_deref()?.split_once(':')?;
        Some(Self {
            source_id: source_id.to_string(),
            external_id: external_id.to_string(),
            street_number: x.components.number().map(str::to_string),
            street_name: x.components.street_name.clone(),
            unit: x.components.unit.clone(),
            city: x.components.locality.clone(),
            zip: x.components.postal_code.clone(),
            province: x.components.region.clone(),
            address_gers_id: x.gers_id,
            building_gers_id: x.building_id,
            geom: ewkt(x.point),
        })
    }
}

#[derive(Debug, Serialize)]
struct GoldBuildingRow {
    gers_id: GersId,
    geom: Geometry,
}

#[derive(Debug, Serialize, Deserialize)]
struct BridgeRow {
    old_gers_id: GersId,
    new_gers_id: GersId,
    release_date: NaiveDate,
    mapping_type: MappingType,
}

fn refine_addresses(rows: Vec<AddressRow>) -> Vec<AddressRecord> {
    rows.into_iter().filter_map(AddressRow::refine).collect()
}

fn polygon_text(polygon: &Polygon) -> Result<String> {
    Ok(serde_json::to_string(&Geometry::from(polygon))?)
}

impl MunicipalSource for RestClient {
    fn addresses(&self, polygon: &Polygon, region: Option<&str>) -> Result<Vec<AddressRecord>> {
        let function = &self.functions.gold_addresses;
        let rows: Vec<MunicipalRow> =
            with_signature_fallback(&polygon_text(polygon)?, region, |args| {
                self.rpc(function, args)
            })?;
        Ok(rows
            .into_iter()
            .filter_map(|x| x.refine(None, AddressSource::Authoritative))
            .collect())
    }

    fn buildings(&self, polygon: &Polygon) -> Result<Vec<BuildingRecord>> {
        let rows: Vec<MunicipalBuildingRow> = self.rpc(
            &self.functions.gold_buildings,
            json!({ "p_polygon_geojson": polygon_text(polygon)? }),
        )?;
        Ok(rows.into_iter().filter_map(MunicipalBuildingRow::refine).collect())
    }
}

impl GoldStore for RestClient {
    fn upsert_gold_addresses(&self, rows: &[AddressRecord]) -> Result<usize> {
        let keyed: Vec<GoldAddressRow> = rows.iter().filter_map(GoldAddressRow::new).collect();
        if keyed.len() < rows.len() {
            warn!(
                skipped = rows.len() - keyed.len(),
                "authoritative rows without a source key"
            );
        }
        self.upsert(GOLD_ADDRESSES, "source_id,external_id", &keyed)?;
        Ok(keyed.len())
    }

    fn upsert_gold_buildings(&self, rows: &[BuildingRecord]) -> Result<usize> {
        let rows: Vec<GoldBuildingRow> = rows
            .iter()
            .map(|x| GoldBuildingRow {
                gers_id: x.gers_id,
                geom: Geometry::from(&x.polygon),
            })
            .collect();
        self.upsert(GOLD_BUILDINGS, "gers_id", &rows)?;
        Ok(rows.len())
    }
}

impl AddressStore for RestClient {
    fn upsert_addresses(&self, rows: &[AddressRecord]) -> Result<usize> {
        let (linked, unlinked): (Vec<_>, Vec<_>) =
            rows.iter().partition(|x| x.building_id.is_some());
        let (keyed, loose): (Vec<_>, Vec<_>) =
            unlinked.into_iter().partition(|x| x.source_key.is_some());

        for (on_conflict, group) in [
            ("campaign_id,building_gers_id", linked),
            ("campaign_id,source_key", keyed),
            ("campaign_id,formatted", loose),
        ] {
            let group: Vec<AddressRow> = group.into_iter().map(AddressRow::from).collect();
            self.upsert(ADDRESSES, on_conflict, &group)?;
        }
        Ok(rows.len())
    }

    fn unresolved(&self, campaign: Option<Uuid>) -> Result<Vec<UnresolvedAddress>> {
        Ok(self.rpc(
            &self.functions.unresolved_addresses,
            json!({ "p_campaign_id": campaign }),
        )?)
    }

    fn campaign_addresses(&self, campaign: Uuid) -> Result<Vec<AddressRecord>> {
        let rows = self.select(ADDRESSES, &format!("campaign_id=eq.{campaign}&select=*"))?;
        Ok(refine_addresses(rows))
    }

    fn linked_addresses(&self, campaign: Option<Uuid>) -> Result<Vec<AddressRecord>> {
        let mut query = "building_gers_id=not.is.null&select=*".to_string();
        if let Some(x) = campaign {
            query.push_str(&format!("&campaign_id=eq.{x}"));
        }
        Ok(refine_addresses(self.select(ADDRESSES, &query)?))
    }

    fn write_building_ids(&self, rows: &[(Uuid, GersId)], mode: WriteMode) -> Result<usize> {
        let rows: Vec<Value> = rows
            .iter()
            .map(|(id, gers)| json!({ "id": id, "building_gers_id": gers }))
            .collect();
        let updated: i64 = self.rpc(
            &self.functions.write_building_ids,
            json!({ "p_rows": rows, "p_double_write": mode == WriteMode::DoubleWrite }),
        )?;
        Ok(updated.max(0) as usize)
    }
}

impl BuildingStore for RestClient {
    fn upsert_buildings(&self, rows: &[BuildingRecord]) -> Result<usize> {
        let rows: Vec<BuildingRow> = rows.iter().map(BuildingRow::from).collect();
        self.upsert(BUILDINGS, "gers_id", &rows)?;
        Ok(rows.len())
    }

    fn campaign_buildings(&self, campaign: Uuid) -> Result<Vec<BuildingRecord>> {
        let rows: Vec<BuildingRow> =
            self.select(BUILDINGS, &format!("campaign_id=eq.{campaign}&select=*"))?;
        Ok(rows.into_iter().filter_map(BuildingRow::refine).collect())
    }

    fn buildings_near(
        &self,
        campaign: Option<Uuid>,
        center: Point,
        radius_m: f64,
    ) -> Result<Vec<BuildingRecord>> {
        let rows: Vec<BuildingRow> = self.rpc(
            &self.functions.buildings_near,
            json!({
                "p_campaign_id": campaign,
                "p_lon": center.x(),
                "p_lat": center.y(),
                "p_radius_m": radius_m,
            }),
        )?;
        Ok(rows.into_iter().filter_map(BuildingRow::refine).collect())
    }
}

impl Catalog for RestClient {
    fn match_points(&self, probes: &[CatalogProbe]) -> Result<Vec<CatalogHit>> {
        let probes: Vec<Value> = probes
            .iter()
            .map(|x| {
                json!({
                    "address_id": x.address_id,
                    "gers_id": x.gers_id,
                    "lon": x.point.x(),
                    "lat": x.point.y(),
                })
            })
            .collect();
        Ok(self.rpc(&self.functions.link_candidates, json!({ "p_probes": probes }))?)
    }
}

impl BridgeStore for RestClient {
    fn upsert_mappings(&self, rows: &[BridgeMapping]) -> Result<usize> {
        let rows: Vec<BridgeRow> = rows
            .iter()
            .map(|x| BridgeRow {
                old_gers_id: x.old_id,
                new_gers_id: x.new_id,
                release_date: x.release_date,
                mapping_type: x.mapping_type,
            })
            .collect();
        self.upsert(BRIDGE, "old_gers_id,release_date", &rows)?;
        Ok(rows.len())
    }

    fn mappings_for(&self, old_ids: &[GersId]) -> Result<Vec<BridgeMapping>> {
        let mut output = Vec::new();
        for chunk in old_ids.chunks(100) {
            let rows: Vec<BridgeRow> = self.select(
                BRIDGE,
                &format!("old_gers_id=in.({})&select=*", chunk.iter().join(",")),
            )?;
            output.extend(rows.into_iter().map(|x| BridgeMapping {
                old_id: x.old_gers_id,
                new_id: x.new_gers_id,
                release_date: x.release_date,
                mapping_type: x.mapping_type,
            }));
        }
        Ok(output)
    }
}

impl PlanStore for RestClient {
    fn save_plan(&self, plan: &RoutePlan) -> Result<()> {
        let _: Value = self.rpc(SAVE_PLAN, json!({ "p_plan": plan }))?;
        Ok(())
    }
}
