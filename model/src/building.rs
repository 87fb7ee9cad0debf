use geo::{Centroid, Point, Polygon};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::GersId;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BuildingRecord {
    pub gers_id: GersId,
    /// `None` for buildings in a campaign-independent catalog.
    pub campaign_id: Option<Uuid>,
    pub polygon: Polygon,
    pub centroid: Point,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl BuildingRecord {
    /// Returns `None` for an empty footprint, which has no centroid.
    pub fn new(gers_id: GersId, campaign_id: Option<Uuid>, polygon: Polygon) -> Option<Self> {
        let centroid = polygon.centroid()?;
        Some(Self {
            gers_id,
            campaign_id,
            polygon,
            centroid,
            hidden: false,
            status: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use geo::{polygon, LineString};

    use super::*;

    #[test]
    fn centroid_of_square() {
        let id = GersId::normalize("08b2a100d2c64fff02000d8b2b4b5c01").unwrap();
        let square = polygon![
            (x: 0.0, y: 0.0),
            (x: 2.0, y: 0.0),
            (x: 2.0, y: 2.0),
            (x: 0.0, y: 2.0),
        ];
        let x = BuildingRecord::new(id, None, square).unwrap();
        assert_eq!(x.centroid, Point::new(1.0, 1.0));
        assert!(!x.hidden);
    }

    #[test]
    fn empty_footprint() {
        let id = GersId::normalize("08b2a100d2c64fff02000d8b2b4b5c01").unwrap();
        let empty = Polygon::new(LineString::new(vec![]), vec![]);
        assert!(BuildingRecord::new(id, None, empty).is_none());
    }
}
