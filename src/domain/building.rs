// src/domain/building.rs
use chrono::NaiveDateTime;

/// A physical apartment building (spec §3). Attributes other than the
/// name/canonical pair are the majority-vote winner across the
/// listings attached through its properties (C3, invariant in §3).
#[derive(Debug, Clone, PartialEq)]
pub struct Building {
    pub id: i64,
    pub normalized_name: String,
    pub canonical_name: String,
    pub address: Option<String>,
    pub normalized_address: Option<String>,
    pub total_floors: Option<i64>,
    pub basement_floors: Option<i64>,
    pub total_units: Option<i64>,
    pub built_year: Option<i64>,
    pub built_month: Option<i64>,
    pub construction_type: Option<String>,
    pub land_rights: Option<String>,
    pub station_info: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub geocoded_at: Option<NaiveDateTime>,
    pub is_valid_name: bool,
}

/// Every distinct name under which a building has appeared across
/// sources (spec §3); the union of these plus the building's current
/// `normalized_name` is its searchable-alias set.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildingListingName {
    pub id: i64,
    pub building_id: i64,
    pub normalized_name: String,
    pub canonical_name: String,
    pub source_sites: Vec<String>,
    pub occurrence_count: i64,
    pub first_seen_at: NaiveDateTime,
    pub last_seen_at: NaiveDateTime,
}

impl BuildingListingName {
    pub fn source_sites_joined(&self) -> String {
        self.source_sites.join(",")
    }

    pub fn parse_source_sites(joined: &str) -> Vec<String> {
        if joined.is_empty() {
            Vec::new()
        } else {
            joined.split(',').map(|s| s.to_string()).collect()
        }
    }
}
