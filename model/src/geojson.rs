//! The slice of GeoJSON (and EWKT points) that crosses our boundaries.
//!
//! Positions are `[lon, lat]`, which maps onto `geo`'s `x`/`y`.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use geo::{Area, Coord, LineString, Point, Polygon};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub type Properties = BTreeMap<String, Value>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Point {
        coordinates: Vec<f64>,
    },
    LineString {
        coordinates: Vec<Vec<f64>>,
    },
    MultiLineString {
        coordinates: Vec<Vec<Vec<f64>>>,
    },
    Polygon {
        coordinates: Vec<Vec<Vec<f64>>>,
    },
    MultiPolygon {
        coordinates: Vec<Vec<Vec<Vec<f64>>>>,
    },
    /// Any other shape, or a known one with malformed coordinates.
    #[serde(other)]
    Unsupported,
}

fn coord(x: &[f64]) -> Option<Coord> {
    match x {
        [x, y, ..] if x.is_finite() && y.is_finite() => Some(Coord { x: *x, y: *y }),
        _ => None,
    }
}

fn line(x: &[Vec<f64>]) -> Option<LineString> {
    x.iter()
        .map(|x| coord(x))
        .collect::<Option<Vec<_>>>()
        .map(LineString::new)
}

fn polygon(rings: &[Vec<Vec<f64>>]) -> Option<Polygon> {
    let mut rings = rings.iter().map(|x| line(x));
    let exterior = rings.next()??;
    if exterior.0.len() < 3 {
        return None;
    }
    let interiors = rings.collect::<Option<Vec<_>>>()?;
    Some(Polygon::new(exterior, interiors))
}

fn positions(x: &LineString) -> Vec<Vec<f64>> {
    x.coords().map(|c| vec![c.x, c.y]).collect()
}

impl Geometry {
    pub fn point(&self) -> Option<Point> {
        match self {
            Self::Point { coordinates } => coord(coordinates).map(Point::from),
            _ => None,
        }
    }

    pub fn lines(&self) -> Vec<LineString> {
        let lines: Vec<LineString> = match self {
            Self::LineString { coordinates } => line(coordinates).into_iter().collect(),
            Self::MultiLineString { coordinates } => {
                coordinates.iter().flat_map(|x| line(x)).collect()
            }
            _ => Vec::new(),
        };
        lines.into_iter().filter(|x| x.0.len() >= 2).collect()
    }

    /// The footprint polygon. For a multipolygon this is its largest part.
    pub fn polygon(&self) -> Option<Polygon> {
        match self {
            Self::Polygon { coordinates } => polygon(coordinates),
            Self::MultiPolygon { coordinates } => coordinates
                .iter()
                .flat_map(|x| polygon(x))
                .max_by(|a, b| a.unsigned_area().total_cmp(&b.unsigned_area())),
            _ => None,
        }
    }
}

impl From<Point> for Geometry {
    fn from(x: Point) -> Self {
        Self::Point {
            coordinates: vec![x.x(), x.y()],
        }
    }
}

impl From<&LineString> for Geometry {
    fn from(x: &LineString) -> Self {
        Self::LineString {
            coordinates: positions(x),
        }
    }
}

impl From<&Polygon> for Geometry {
    fn from(x: &Polygon) -> Self {
        let mut coordinates = vec![positions(x.exterior())];
        coordinates.extend(x.interiors().iter().map(positions));
        Self::Polygon { coordinates }
    }
}

/// A geometry that fails to parse becomes `Unsupported` instead of failing the
/// whole document.
fn lenient<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Geometry>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.map(|x| serde_json::from_value(x).unwrap_or(Geometry::Unsupported)))
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Feature {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default, deserialize_with = "lenient")]
    pub geometry: Option<Geometry>,
    #[serde(default)]
    pub properties: Option<Properties>,
}

impl Feature {
    /// First non-empty property among `keys`, with numbers rendered as text.
    pub fn text(&self, keys: &[&str]) -> Option<String> {
        let props = self.properties.as_ref()?;
        keys.iter().find_map(|k| match props.get(*k)? {
            Value::String(x) if !x.trim().is_empty() => Some(x.trim().to_string()),
            Value::Number(x) => Some(x.to_string()),
            _ => None,
        })
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(default)]
    pub features: Vec<Feature>,
}

/// Reads a polygon from a bare geometry, a feature, or the first feature of a
/// collection.
pub fn read_polygon(text: &str) -> Result<Polygon> {
    let value: Value = serde_json::from_str(text).context("polygon is not JSON")?;
    let geometry = match value.get("type").and_then(Value::as_str) {
        Some("FeatureCollection") => value
            .get("features")
            .and_then(|x| x.get(0))
            .and_then(|x| x.get("geometry"))
            .cloned()
            .context("feature collection has no features")?,
        Some("Feature") => value
            .get("geometry")
            .cloned()
            .context("feature has no geometry")?,
        _ => value,
    };
    let geometry: Geometry = serde_json::from_value(geometry)?;
    match geometry.polygon() {
        Some(x) => Ok(x),
        None => bail!("geometry is not a usable polygon"),
    }
}

/// Parses a point from GeoJSON text or EWKT (`SRID=4326;POINT(x y)`).
pub fn parse_point(raw: &str) -> Option<Point> {
    let raw = raw.trim();
    if raw.starts_with('{') {
        return serde_json::from_str::<Geometry>(raw).ok()?.point();
    }

    let wkt = match raw.split_once(';') {
        Some((srid, rest)) if srid.to_uppercase().starts_with("SRID=") => rest.trim(),
        _ => raw,
    };
    let upper = wkt.to_uppercase();
    let body = upper
        .strip_prefix("POINT")?
        .trim()
        .strip_prefix('(')?
        .strip_suffix(')')?;
    let mut parts = body.split_whitespace().map(|x| x.parse::<f64>().ok());
    let x = parts.next()??;
    let y = parts.next()??;
    coord(&[x, y]).map(Point::from)
}

pub fn ewkt(point: Point) -> String {
    format!("SRID=4326;POINT({} {})", point.x(), point.y())
}
