//! Seams between the pipeline and wherever addresses, buildings and plans
//! live. Every method is a single round trip.

use _model::{AddressRecord, BridgeMapping, BuildingRecord, GersId, RoutePlan};
use anyhow::Result;
use geo::{Point, Polygon};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod local;
mod rest;

pub use local::LocalStore;
pub use rest::RestClient;

pub trait MunicipalSource {
    fn addresses(&self, polygon: &Polygon, region: Option<&str>) -> Result<Vec<AddressRecord>>;
    fn buildings(&self, polygon: &Polygon) -> Result<Vec<BuildingRecord>>;
}

/// An address still lacking a building. `geom` is passed through untouched so
/// the linker can decide what to do with rows it cannot parse.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnresolvedAddress {
    pub id: Uuid,
    #[serde(default)]
    pub campaign_id: Option<Uuid>,
    #[serde(default)]
    pub gers_id: Option<GersId>,
    #[serde(default)]
    pub geom: Option<String>,
}

/// How building identifiers are written back. `DoubleWrite` also fills the
/// legacy textual column while readers migrate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WriteMode {
    Canonical,
    DoubleWrite,
}

/// The authoritative municipal tables the resolver reads as gold.
pub trait GoldStore {
    /// Rows replace earlier ones with the same source key.
    fn upsert_gold_addresses(&self, rows: &[AddressRecord]) -> Result<usize>;
    fn upsert_gold_buildings(&self, rows: &[BuildingRecord]) -> Result<usize>;
}

pub trait AddressStore {
    fn upsert_addresses(&self, rows: &[AddressRecord]) -> Result<usize>;
    fn unresolved(&self, campaign: Option<Uuid>) -> Result<Vec<UnresolvedAddress>>;
    fn campaign_addresses(&self, campaign: Uuid) -> Result<Vec<AddressRecord>>;
    fn linked_addresses(&self, campaign: Option<Uuid>) -> Result<Vec<AddressRecord>>;
    /// Returns how many rows were updated.
    fn write_building_ids(&self, rows: &[(Uuid, GersId)], mode: WriteMode) -> Result<usize>;
}

pub trait BuildingStore {
    fn upsert_buildings(&self, rows: &[BuildingRecord]) -> Result<usize>;
    fn campaign_buildings(&self, campaign: Uuid) -> Result<Vec<BuildingRecord>>;
    /// Buildings of `campaign` whose centroid may lie within `radius_m` of
    /// `center`. Callers still filter by exact distance.
    fn buildings_near(
        &self,
        campaign: Option<Uuid>,
        center: Point,
        radius_m: f64,
    ) -> Result<Vec<BuildingRecord>>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogProbe {
    pub address_id: Uuid,
    pub gers_id: Option<GersId>,
    pub point: Point,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    /// The catalog's address already names its parent building.
    Direct,
    /// A building polygon contains the address point.
    Containment,
}

/// One candidate building for one probed address. `building_ref` is raw
/// catalog text and has not been normalized.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogHit {
    pub address_id: Uuid,
    pub building_ref: String,
    pub strategy: MatchStrategy,
    pub distance_m: f64,
}

pub trait Catalog {
    /// Every direct and containment candidate for all probes, in one query.
    fn match_points(&self, probes: &[CatalogProbe]) -> Result<Vec<CatalogHit>>;
}

pub trait BridgeStore {
    fn upsert_mappings(&self, rows: &[BridgeMapping]) -> Result<usize>;
    fn mappings_for(&self, old_ids: &[GersId]) -> Result<Vec<BridgeMapping>>;
}

pub trait PlanStore {
    /// Fails if a plan with the same id already exists.
    fn save_plan(&self, plan: &RoutePlan) -> Result<()>;
}

pub trait Backend:
    MunicipalSource
    + GoldStore
    + AddressStore
    + BuildingStore
    + Catalog
    + BridgeStore
    + PlanStore
    + Sync
{
}

impl<T> Backend for T where
    T: MunicipalSource
        + GoldStore
        + AddressStore
        + BuildingStore
        + Catalog
        + BridgeStore
        + PlanStore
        + Sync
{
}
