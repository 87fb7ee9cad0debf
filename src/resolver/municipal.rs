use _model::{
    geojson::{self, Geometry},
    normalize_postal_code, AddressComponents, AddressRecord, AddressSource, BuildingRecord,
    GersId,
};
use geo::Point;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::{error::RestError, utils::title_case};

/// A cleaned municipal address row, as served by the dataset RPC and as found
/// in the bulk NDJSON exports.
#[derive(Debug, Deserialize)]
pub struct MunicipalRow {
    #[serde(default, alias = "external_id", alias = "source_key")]
    pub id: Option<Value>,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default, alias = "house_number")]
    pub street_number: Option<Value>,
    #[serde(default)]
    pub street_name: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default, alias = "locality")]
    pub city: Option<String>,
    #[serde(default, alias = "postal_code")]
    pub zip: Option<String>,
    #[serde(default, alias = "region")]
    pub province: Option<String>,
    #[serde(default, alias = "gers_id")]
    pub address_gers_id: Option<String>,
    #[serde(default, alias = "building_gers_id")]
    pub building_id: Option<String>,
    #[serde(default)]
    pub geom: Option<Value>,
    #[serde(default, alias = "latitude")]
    pub lat: Option<f64>,
    #[serde(default, alias = "longitude", alias = "lng")]
    pub lon: Option<f64>,
}

fn text(x: &Value) -> Option<String> {
    match x {
        Value::String(x) if !x.trim().is_empty() => Some(x.trim().to_string()),
        Value::Number(x) => Some(x.to_string()),
        _ => None,
    }
}

fn point_of(geom: Option<&Value>, lat: Option<f64>, lon: Option<f64>) -> Option<Point> {
    let from_geom = match geom {
        Some(Value::String(x)) => geojson::parse_point(x),
        Some(x @ Value::Object(_)) => serde_json::from_value::<Geometry>(x.clone())
            .ok()
            .and_then(|x| x.point()),
        _ => None,
    };
    from_geom.or_else(|| match (lat, lon) {
        (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => Some(Point::new(lon, lat)),
        _ => None,
    })
}

impl MunicipalRow {
    /// Rows without a location or without both number and street are dropped.
    pub fn refine(self, campaign_id: Option<Uuid>, source: AddressSource) -> Option<AddressRecord> {
        let point = point_of(self.geom.as_ref(), self.lat, self.lon)?;
        let components = AddressComponents {
            house_number: self.street_number.as_ref().and_then(text),
            street_number: None,
            street_name: self.street_name.as_deref().map(|x| title_case(x.trim())),
            unit: self.unit.filter(|x| !x.trim().is_empty()),
            locality: self.city.as_deref().map(|x| title_case(x.trim())),
            region: self.province.map(|x| x.trim().to_uppercase()),
            postal_code: self.zip.as_deref().and_then(normalize_postal_code),
        };
        components.number()?;
        components.street()?;

        let mut record = AddressRecord::new(campaign_id, components, point, source);
        record.source_key = self.id.as_ref().and_then(text).map(|x| match &self.source_id {
            Some(source) => format!("{source}:{x}"),
            None => x,
        });
        record.gers_id = self.address_gers_id.as_deref().and_then(GersId::normalize);
        record.building_id = self.building_id.as_deref().and_then(GersId::normalize);
        Some(record)
    }
}

#[derive(Debug, Deserialize)]
pub struct MunicipalBuildingRow {
    #[serde(alias = "id")]
    pub gers_id: String,
    pub geom: Value,
}

impl MunicipalBuildingRow {
    pub fn refine(self) -> Option<BuildingRecord> {
        let Some(id) = GersId::normalize(&self.gers_id) else {
            warn!(raw = %self.gers_id, "authoritative building has an invalid identifier");
            return None;
        };
        let geometry: Geometry = match self.geom {
            Value::String(x) => serde_json::from_str(&x).ok()?,
            x => serde_json::from_value(x).ok()?,
        };
        BuildingRecord::new(id, None, geometry.polygon()?)
    }
}

/// Calls the dataset RPC with `(polygon, region)` and, when the deployed
/// function only takes the polygon, repeats the call with that signature.
pub fn with_signature_fallback<T>(
    polygon_geojson: &str,
    region: Option<&str>,
    mut call: impl FnMut(Value) -> Result<T, RestError>,
) -> Result<T, RestError> {
    let Some(region) = region else {
        return call(json!({ "p_polygon_geojson": polygon_geojson }));
    };

    match call(json!({ "p_polygon_geojson": polygon_geojson, "p_province_code": region })) {
        Err(RestError::FunctionNotFound { function }) => {
            warn!(%function, "two-argument signature unavailable, retrying without region");
            call(json!({ "p_polygon_geojson": polygon_geojson }))
        }
        x => x,
    }
}
