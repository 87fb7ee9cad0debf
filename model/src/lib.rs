mod address;
mod bridge;
mod building;
pub mod geojson;
mod id;
mod route;

pub use address::{
    normalize_postal_code, AddressComponents, AddressRecord, AddressSource, ConflictKey,
    Sequencing,
};
pub use bridge::{classify, BridgeMapping, MappingType};
pub use building::BuildingRecord;
pub use id::GersId;
pub use route::{Parity, PlanStatus, RoutePlan, RouteStop, SegmentSummary};
