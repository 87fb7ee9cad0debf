//! Where a building sits and how big it is drawn: facing the nearest road,
//! pulled back from it by a setback, and shrunk when neighbours are close.

use _model::{BuildingRecord, GersId};
use geo::{
    Closest, ClosestPoint, HaversineBearing, HaversineDestination, HaversineDistance, LineString,
    Point,
};
use indicatif::ParallelProgressIterator;
use rayon::prelude::*;
use serde::Serialize;
use tracing::warn;

use crate::{config::PlacementConfig, store::BuildingStore, utils::progress_style};

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct Orientation {
    /// Degrees clockwise from north, in `[0, 360)`.
    pub bearing: f64,
    pub road_point: Point,
    pub setback_point: Point,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct Neighbor {
    pub gers_id: GersId,
    pub distance_m: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct Scale {
    pub scale_factor: f64,
    pub width_meters: f64,
    pub min_distance: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Placement {
    pub gers_id: GersId,
    pub orientation: Option<Orientation>,
    pub scale: Scale,
    pub neighbors: Vec<Neighbor>,
}

fn normalize_bearing(degrees: f64) -> f64 {
    let x = degrees.rem_euclid(360.0);
    if x >= 360.0 {
        0.0
    } else {
        x
    }
}

/// Faces `building` toward the closest point of `road` and moves that point
/// `setback_m` back toward the building along the great circle.
pub fn orient(building: &BuildingRecord, road: &LineString, setback_m: f64) -> Option<Orientation> {
    let centroid = building.centroid;
    let road_point = match road.closest_point(&centroid) {
        Closest::SinglePoint(x) | Closest::Intersection(x) => x,
        Closest::Indeterminate => return None,
    };

    let bearing = normalize_bearing(centroid.haversine_bearing(road_point));
    let inward = road_point.haversine_bearing(centroid);
    let setback_point = road_point.haversine_destination(inward, setback_m);
    Some(Orientation {
        bearing,
        road_point,
        setback_point,
    })
}

/// Orients against whichever road comes closest to the centroid.
pub fn orient_to_roads(
    building: &BuildingRecord,
    roads: &[LineString],
    setback_m: f64,
) -> Option<Orientation> {
    roads
        .iter()
        .filter_map(|x| orient(building, x, setback_m))
        .min_by(|a, b| {
            let a = building.centroid.haversine_distance(&a.road_point);
            let b = building.centroid.haversine_distance(&b.road_point);
            a.total_cmp(&b)
        })
}

/// Up to `n` visible buildings of the same campaign within `radius_m`,
/// nearest first. A failed query yields no neighbours.
pub fn neighbors<S: BuildingStore + ?Sized>(
    store: &S,
    building: &BuildingRecord,
    radius_m: f64,
    n: usize,
) -> Vec<Neighbor> {
    let nearby = match store.buildings_near(building.campaign_id, building.centroid, radius_m) {
        Ok(x) => x,
        Err(e) => {
            warn!(building = %building.gers_id, "neighbour query failed: {e:#}");
            return Vec::new();
        }
    };

    let mut output: Vec<Neighbor> = nearby
        .iter()
        .filter(|x| !x.hidden && x.gers_id != building.gers_id)
        .filter(|x| x.campaign_id == building.campaign_id)
        .map(|x| Neighbor {
            gers_id: x.gers_id,
            distance_m: building.centroid.haversine_distance(&x.centroid),
        })
        .filter(|x| x.distance_m <= radius_m)
        .collect();
    output.sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m));
    output.truncate(n);
    output
}

pub fn scale(neighbors: &[Neighbor], config: &PlacementConfig) -> Scale {
    let min_distance = neighbors
        .iter()
        .map(|x| x.distance_m)
        .min_by(|a, b| a.total_cmp(b));

    match min_distance {
        Some(d) => {
            let width_meters = (config.spacing_ratio * d).min(config.max_width_m);
            Scale {
                scale_factor: (width_meters / config.base_width_m).max(config.min_scale),
                width_meters,
                min_distance,
            }
        }
        None => Scale {
            scale_factor: 1.0,
            width_meters: config.base_width_m.min(config.max_width_m),
            min_distance: None,
        },
    }
}

pub fn place<S: BuildingStore + ?Sized>(
    store: &S,
    building: &BuildingRecord,
    roads: &[LineString],
    config: &PlacementConfig,
) -> Placement {
    let neighbors = neighbors(store, building, config.neighbor_radius_m, config.neighbor_count);
    Placement {
        gers_id: building.gers_id,
        orientation: orient_to_roads(building, roads, config.setback_m),
        scale: scale(&neighbors, config),
        neighbors,
    }
}

/// Places every building independently across the rayon pool.
pub fn place_all<S: BuildingStore + Sync + ?Sized>(
    store: &S,
    buildings: &[BuildingRecord],
    roads: &[LineString],
    config: &PlacementConfig,
) -> Vec<Placement> {
    buildings
        .par_iter()
        .progress_with_style(progress_style())
        .map(|x| place(store, x, roads, config))
        .collect()
}
