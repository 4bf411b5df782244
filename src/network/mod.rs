pub mod area;
pub mod osm_parser;
pub mod overpass_fetcher;
pub mod segment_index;

pub use area::{
    load_area_for, AreaLoadOutcome, AreaRequests, AreaTicket, BoundingBox, StreetNetworkProvider,
};
pub use osm_parser::{parse_osm_json, parse_osm_value, RoadClass, StreetSegment};
pub use overpass_fetcher::OverpassFetcher;
pub use segment_index::{IndexedSegment, SegmentIndex};
