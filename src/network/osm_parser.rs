use crate::error::{CoverageError, Result};
use geo::{Coord, LineString};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Vehicle-traversable OSM road classes. Anything else is never tracked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoadClass {
    Motorway,
    Trunk,
    Primary,
    Secondary,
    Tertiary,
    Unclassified,
    Residential,
    LivingStreet,
}

impl RoadClass {
    /// Parse from OSM highway tag; `None` for footways, service roads, links, etc.
    pub fn from_highway_tag(tag: &str) -> Option<Self> {
        match tag {
            "motorway" => Some(RoadClass::Motorway),
            "trunk" => Some(RoadClass::Trunk),
            "primary" => Some(RoadClass::Primary),
            "secondary" => Some(RoadClass::Secondary),
            "tertiary" => Some(RoadClass::Tertiary),
            "unclassified" => Some(RoadClass::Unclassified),
            "residential" => Some(RoadClass::Residential),
            "living_street" => Some(RoadClass::LivingStreet),
            _ => None,
        }
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            RoadClass::Motorway => "motorway",
            RoadClass::Trunk => "trunk",
            RoadClass::Primary => "primary",
            RoadClass::Secondary => "secondary",
            RoadClass::Tertiary => "tertiary",
            RoadClass::Unclassified => "unclassified",
            RoadClass::Residential => "residential",
            RoadClass::LivingStreet => "living_street",
        }
    }
}

/// One coverage-trackable street, built from a single OSM way
#[derive(Clone, Debug, PartialEq)]
pub struct StreetSegment {
    /// Source feature id, e.g. `way/42`
    pub id: String,
    /// geo convention: x = lng, y = lat
    pub geometry: LineString<f64>,
    pub road_class: RoadClass,
    /// OSM tags of the way
    pub properties: BTreeMap<String, String>,
    /// Some node references could not be resolved
    pub tainted: bool,
    pub visited: bool,
}

impl StreetSegment {
    /// Build an unvisited segment from `(lat, lng)` pairs
    pub fn from_lat_lng(
        id: impl Into<String>,
        points: &[(f64, f64)],
        road_class: RoadClass,
    ) -> Self {
        let coords: Vec<Coord<f64>> = points
            .iter()
            .map(|&(lat, lng)| Coord { x: lng, y: lat })
            .collect();

        let mut properties = BTreeMap::new();
        properties.insert("highway".to_string(), road_class.as_tag().to_string());

        StreetSegment {
            id: id.into(),
            geometry: LineString::new(coords),
            road_class,
            properties,
            tainted: false,
            visited: false,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.properties.get("name").map(|s| s.as_str())
    }

    pub fn point_count(&self) -> usize {
        self.geometry.0.len()
    }
}

// Overpass JSON deserialization structures
#[derive(Debug, Deserialize)]
struct OsmResponse {
    elements: Vec<OsmElement>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum OsmElement {
    #[serde(rename = "node")]
    Node { id: u64, lat: f64, lon: f64 },
    #[serde(rename = "way")]
    Way {
        id: u64,
        #[serde(default)]
        nodes: Vec<u64>,
        #[serde(default)]
        tags: HashMap<String, String>,
    },
    #[serde(other)]
    Other,
}

/// Parse an Overpass JSON response into street segments
///
/// Zero matching ways is not an error; only undecodable input is.
pub fn parse_osm_json(json: &str) -> Result<Vec<StreetSegment>> {
    let response: OsmResponse = serde_json::from_str(json)
        .map_err(|e| CoverageError::MalformedNetwork(format!("Failed to parse OSM JSON: {}", e)))?;
    Ok(segments_from_elements(&response.elements))
}

/// Same as [`parse_osm_json`] for an already-decoded JSON value
pub fn parse_osm_value(value: serde_json::Value) -> Result<Vec<StreetSegment>> {
    let response: OsmResponse = serde_json::from_value(value)
        .map_err(|e| CoverageError::MalformedNetwork(format!("Failed to decode OSM JSON: {}", e)))?;
    Ok(segments_from_elements(&response.elements))
}

fn segments_from_elements(elements: &[OsmElement]) -> Vec<StreetSegment> {
    // Build node lookup table
    let mut nodes: HashMap<u64, Coord<f64>> = HashMap::new();
    for element in elements {
        if let OsmElement::Node { id, lat, lon } = element {
            nodes.insert(*id, Coord { x: *lon, y: *lat });
        }
    }

    let mut seen_ways: HashSet<u64> = HashSet::new();
    let mut segments = Vec::new();
    let mut skipped = 0usize;

    for element in elements {
        let (id, node_ids, tags) = match element {
            OsmElement::Way { id, nodes, tags } => (*id, nodes, tags),
            _ => continue,
        };

        let road_class = match tags.get("highway").and_then(|h| RoadClass::from_highway_tag(h)) {
            Some(class) => class,
            None => {
                skipped += 1;
                continue;
            }
        };

        // Closed ways explicitly marked as areas are polygons, not streets
        let closed = node_ids.len() > 2 && node_ids.first() == node_ids.last();
        if closed && tags.get("area").map(|s| s.as_str()) == Some("yes") {
            skipped += 1;
            continue;
        }

        if !seen_ways.insert(id) {
            log::debug!("Duplicate way {} ignored", id);
            continue;
        }

        let mut coords = Vec::with_capacity(node_ids.len());
        let mut tainted = false;
        for node_id in node_ids {
            match nodes.get(node_id) {
                Some(coord) => coords.push(*coord),
                None => {
                    log::debug!("Way {} references missing node {}", id, node_id);
                    tainted = true;
                }
            }
        }

        if coords.len() < 2 {
            skipped += 1;
            continue;
        }

        segments.push(StreetSegment {
            id: format!("way/{}", id),
            geometry: LineString::new(coords),
            road_class,
            properties: tags.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            tainted,
            visited: false,
        });
    }

    log::debug!(
        "Ingested {} street segments ({} ways skipped)",
        segments.len(),
        skipped
    );

    segments
}
