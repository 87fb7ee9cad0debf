//! The remote tiled-snapshot service: request and response shapes, the HTTP
//! client, and the parsers that turn its feature files into records.

use std::{
    collections::BTreeMap,
    sync::mpsc::{self, RecvTimeoutError},
    thread,
    time::Duration,
};

use _model::{
    geojson::{Feature, FeatureCollection, Geometry},
    normalize_postal_code, AddressComponents, AddressRecord, AddressSource, BuildingRecord,
    GersId,
};
use geo::{LineString, Polygon};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use ureq::Agent;
use uuid::Uuid;

use crate::{config::SnapshotConfig, error::ResolveError, utils::agent};

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractRequest {
    pub polygon: Geometry,
    pub region: Option<String>,
    pub campaign_id: Option<Uuid>,
    pub limit_buildings: u32,
    pub limit_addresses: u32,
    pub limit_roads: u32,
    pub include_roads: bool,
}

impl ExtractRequest {
    pub fn new(
        config: &SnapshotConfig,
        polygon: &Polygon,
        region: Option<&str>,
        campaign_id: Option<Uuid>,
    ) -> Self {
        Self {
            polygon: Geometry::from(polygon),
            region: region.map(str::to_string),
            campaign_id,
            limit_buildings: config.limit_buildings,
            limit_addresses: config.limit_addresses,
            limit_roads: config.limit_roads,
            include_roads: config.include_roads,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotCounts {
    #[serde(default)]
    pub buildings: usize,
    #[serde(default)]
    pub addresses: usize,
    #[serde(default)]
    pub roads: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotUrls {
    pub buildings: String,
    pub addresses: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roads: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

/// What the extraction call answers with. The feature files themselves are
/// downloaded separately.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub counts: SnapshotCounts,
    pub urls: SnapshotUrls,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

pub trait SnapshotSource: Send + Sync {
    fn extract(&self, request: &ExtractRequest) -> Result<SnapshotPayload, ResolveError>;
    fn download(&self, url: &str) -> Result<FeatureCollection, ResolveError>;

    fn addresses(
        &self,
        payload: &SnapshotPayload,
        campaign_id: Option<Uuid>,
    ) -> Result<Vec<AddressRecord>, ResolveError> {
        let features = self.download(&payload.urls.addresses)?.features;
        Ok(validate("address", &features, |x| parse_address(x, campaign_id)))
    }

    fn buildings(
        &self,
        payload: &SnapshotPayload,
        campaign_id: Option<Uuid>,
    ) -> Result<Vec<BuildingRecord>, ResolveError> {
        let features = self.download(&payload.urls.buildings)?.features;
        Ok(validate("building", &features, |x| parse_building(x, campaign_id)))
    }

    fn roads(&self, payload: &SnapshotPayload) -> Result<Vec<LineString>, ResolveError> {
        let Some(url) = &payload.urls.roads else {
            return Ok(Vec::new());
        };
        let features = self.download(url)?.features;
        Ok(validate("road", &features, parse_road).into_iter().flatten().collect())
    }
}

pub struct HttpSnapshot {
    agent: Agent,
    url: String,
}

impl HttpSnapshot {
    pub fn new(config: &SnapshotConfig) -> Self {
        Self {
            agent: agent(config.timeout()),
            url: config.url.clone(),
        }
    }
}

impl SnapshotSource for HttpSnapshot {
    fn extract(&self, request: &ExtractRequest) -> Result<SnapshotPayload, ResolveError> {
        let payload: SnapshotPayload = self.agent.post(&self.url).send_json(request)?.into_json()?;
        if let Some(x) = &payload.warning {
            warn!(warning = %x, "snapshot service warning");
        }
        debug!(counts = ?payload.counts, "snapshot extracted");
        Ok(payload)
    }

    fn download(&self, url: &str) -> Result<FeatureCollection, ResolveError> {
        Ok(self.agent.get(url).call()?.into_json()?)
    }
}

/// Runs `work` on its own thread and gives up on it after `timeout`. The
/// worker is abandoned rather than cancelled.
pub fn race<T: Send + 'static>(
    timeout: Duration,
    work: impl FnOnce() -> Result<T, ResolveError> + Send + 'static,
) -> Result<T, ResolveError> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(work());
    });
    match rx.recv_timeout(timeout) {
        Ok(x) => x,
        Err(RecvTimeoutError::Timeout) => Err(ResolveError::Timeout(timeout)),
        Err(RecvTimeoutError::Disconnected) => Err(ResolveError::Aborted),
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Rejected {
    #[error("missing geometry")]
    NoGeometry,
    #[error("not a point")]
    NotPoint,
    #[error("no house number or street")]
    NoAddressParts,
    #[error("not a polygon")]
    NotPolygon,
    #[error("invalid identifier")]
    BadIdentifier,
    #[error("no line")]
    NotLine,
}

/// Keeps features that parse and logs one warning per rejection reason.
fn validate<T>(
    kind: &str,
    features: &[Feature],
    parse: impl Fn(&Feature) -> Result<T, Rejected>,
) -> Vec<T> {
    let mut rejected: BTreeMap<Rejected, usize> = BTreeMap::new();
    let mut output = Vec::with_capacity(features.len());
    for feature in features {
        match parse(feature) {
            Ok(x) => output.push(x),
            Err(e) => *rejected.entry(e).or_default() += 1,
        }
    }
    for (reason, count) in rejected {
        warn!(%kind, %reason, count, "rejected snapshot features");
    }
    output
}

fn feature_id(feature: &Feature, keys: &[&str]) -> Option<String> {
    feature.text(keys).or_else(|| match &feature.id {
        Some(Value::String(x)) => Some(x.clone()),
        _ => None,
    })
}

pub fn parse_address(
    feature: &Feature,
    campaign_id: Option<Uuid>,
) -> Result<AddressRecord, Rejected> {
    let geometry = feature.geometry.as_ref().ok_or(Rejected::NoGeometry)?;
    let point = geometry.point().ok_or(Rejected::NotPoint)?;
    let components = AddressComponents {
        house_number: feature.text(&["house_number", "number", "housenumber"]),
        street_number: feature.text(&["street_number"]),
        street_name: feature.text(&["street_name", "street"]),
        unit: feature.text(&["unit"]),
        locality: feature.text(&["locality", "city"]),
        region: feature.text(&["region", "province"]).map(|x| x.to_uppercase()),
        postal_code: feature
            .text(&["postal_code", "postcode", "zip"])
            .and_then(|x| normalize_postal_code(&x)),
    };
    if components.number().is_none() && components.street().is_none() {
        return Err(Rejected::NoAddressParts);
    }

    let mut record = AddressRecord::new(campaign_id, components, point, AddressSource::Snapshot);
    record.gers_id = feature_id(feature, &["gers_id", "id"]).and_then(|x| GersId::normalize(&x));
    record.building_id = feature
        .text(&["building_gers_id", "building_id"])
        .and_then(|x| GersId::normalize(&x));
    record.source_key = record.gers_id.map(|x| format!("snapshot:{x}"));
    Ok(record)
}

pub fn parse_building(
    feature: &Feature,
    campaign_id: Option<Uuid>,
) -> Result<BuildingRecord, Rejected> {
    let geometry = feature.geometry.as_ref().ok_or(Rejected::NoGeometry)?;
    let polygon = geometry.polygon().ok_or(Rejected::NotPolygon)?;
    let id = feature_id(feature, &["gers_id", "id"])
        .and_then(|x| GersId::normalize(&x))
        .ok_or(Rejected::BadIdentifier)?;
    BuildingRecord::new(id, campaign_id, polygon).ok_or(Rejected::NotPolygon)
}

pub fn parse_road(feature: &Feature) -> Result<Vec<LineString>, Rejected> {
    let geometry = feature.geometry.as_ref().ok_or(Rejected::NoGeometry)?;
    let lines = geometry.lines();
    if lines.is_empty() {
        return Err(Rejected::NotLine);
    }
    Ok(lines)
}
