use _model::{
    geojson::Geometry, AddressRecord, PlanStatus, RoutePlan, RouteStop, SegmentSummary,
};
use geo::{HaversineDistance, LineString, Point};
use uuid::Uuid;

use crate::sequencer::Sequence;

#[derive(Clone, Debug)]
pub struct PlanRequest {
    pub campaign_id: Uuid,
    pub workspace_id: Option<Uuid>,
    pub name: String,
    pub assignee: Option<Uuid>,
}

/// Meters per second at `kmh`.
fn speed(kmh: f64) -> f64 {
    kmh * 1000.0 / 3600.0
}

/// Builds the plan and returns the addresses with their walking fields
/// stamped, in stop order.
pub fn build_plan(
    addresses: &[AddressRecord],
    sequence: &Sequence,
    request: PlanRequest,
    walking_speed_kmh: f64,
) -> (RoutePlan, Vec<AddressRecord>) {
    let speed = speed(walking_speed_kmh);
    let mut stops = Vec::new();
    let mut stamped = Vec::new();
    let mut previous: Option<Point> = None;
    let mut total = 0.0;

    for (cluster, segment) in sequence.segments.iter().enumerate() {
        for stop in &segment.stops {
            let x = &addresses[stop.index];
            let leg = previous.map_or(0.0, |p| p.haversine_distance(&x.point));
            previous = Some(x.point);
            total += leg;

            let order = stops.len() as u32 + 1;
            stops.push(RouteStop {
                stop_order: order,
                address_id: x.id,
                gers_id: x.gers_id,
                lat: x.point.y(),
                lng: x.point.x(),
                display_address: x.formatted.clone(),
                building_id: x.building_id,
            });

            let mut x = x.clone();
            x.sequencing.cluster_id = Some(cluster as u32);
            x.sequencing.stop_sequence = Some(order);
            x.sequencing.distance_m = Some(leg);
            x.sequencing.walk_time_sec = Some(if speed > 0.0 { leg / speed } else { 0.0 });
            stamped.push(x);
        }
    }

    let segments = sequence
        .segments
        .iter()
        .map(|segment| {
            let line = LineString::from(
                segment
                    .stops
                    .iter()
                    .map(|x| addresses[x.index].point)
                    .collect::<Vec<_>>(),
            );
            SegmentSummary {
                street_name: segment.street_name.clone(),
                side: segment.parity,
                from_house: segment.from_house(),
                to_house: segment.to_house(),
                stop_count: segment.stops.len(),
                color: segment.color.clone(),
                line_geo_json: (line.0.len() >= 2).then(|| Geometry::from(&line)),
            }
        })
        .collect();

    let plan = RoutePlan {
        id: Uuid::new_v4(),
        workspace_id: request.workspace_id,
        campaign_id: request.campaign_id,
        name: request.name,
        status: match request.assignee {
            Some(_) => PlanStatus::Assigned,
            None => PlanStatus::Draft,
        },
        assignee: request.assignee,
        est_minutes: if speed > 0.0 { total / speed / 60.0 } else { 0.0 },
        distance_meters: total,
        segments,
        stops,
    };
    (plan, stamped)
}
