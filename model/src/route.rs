use core::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{geojson::Geometry, GersId};

/// Which side of the street a house number falls on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Parity {
    Even,
    Odd,
    Unknown,
}

impl Parity {
    pub fn of(number: Option<u32>) -> Self {
        match number {
            Some(x) if x % 2 == 0 => Self::Even,
            Some(_) => Self::Odd,
            None => Self::Unknown,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Even => write!(f, "even"),
            Self::Odd => write!(f, "odd"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanStatus {
    Draft,
    Assigned,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentSummary {
    pub street_name: String,
    pub side: Parity,
    pub from_house: Option<u32>,
    pub to_house: Option<u32>,
    pub stop_count: usize,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_geo_json: Option<Geometry>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStop {
    pub stop_order: u32,
    pub address_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gers_id: Option<GersId>,
    pub lat: f64,
    pub lng: f64,
    pub display_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub building_id: Option<GersId>,
}

/// Saved walking plan. Never edited in place: a revision is a new plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePlan {
    pub id: Uuid,
    pub workspace_id: Option<Uuid>,
    pub campaign_id: Uuid,
    pub name: String,
    pub status: PlanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<Uuid>,
    pub est_minutes: f64,
    pub distance_meters: f64,
    pub segments: Vec<SegmentSummary>,
    pub stops: Vec<RouteStop>,
}
