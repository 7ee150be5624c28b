// src/domain/raw_listing.rs
//
// The producer-of-truth contract for everything downstream (spec §6).
// A `Scraper` implementation yields these; nothing past this struct
// should need to know which site it came from beyond `source_site`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceSite {
    Suumo,
    Homes,
    Rehouse,
    Nomu,
    Livable,
}

impl SourceSite {
    /// Priority order low→high preference, spec §4.3 rule 4:
    /// `[suumo, homes, rehouse, nomu, livable]`, lower index = higher priority.
    pub const PRIORITY_ORDER: [SourceSite; 5] = [
        SourceSite::Suumo,
        SourceSite::Homes,
        SourceSite::Rehouse,
        SourceSite::Nomu,
        SourceSite::Livable,
    ];

    pub fn priority_index(self) -> usize {
        Self::PRIORITY_ORDER
            .iter()
            .position(|s| *s == self)
            .expect("SourceSite::PRIORITY_ORDER is exhaustive")
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceSite::Suumo => "suumo",
            SourceSite::Homes => "homes",
            SourceSite::Rehouse => "rehouse",
            SourceSite::Nomu => "nomu",
            SourceSite::Livable => "livable",
        }
    }
}

impl std::fmt::Display for SourceSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SourceSite {
    type Err = crate::errors::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "suumo" => Ok(SourceSite::Suumo),
            "homes" => Ok(SourceSite::Homes),
            "rehouse" => Ok(SourceSite::Rehouse),
            "nomu" => Ok(SourceSite::Nomu),
            "livable" => Ok(SourceSite::Livable),
            other => Err(crate::errors::Error::BadInput(format!(
                "unknown source site '{other}'"
            ))),
        }
    }
}

/// The number of distinct sources in `PRIORITY_ORDER`, used by the
/// weighting formula in spec §4.3 rule 4.
pub const PRIORITY_RANK_COUNT: i64 = SourceSite::PRIORITY_ORDER.len() as i64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawListing {
    pub source_site: SourceSite,
    pub site_property_id: String,
    pub url: String,
    pub building_name: String,
    /// Stable per-building id some sources expose distinct from the
    /// per-listing id (SPEC_FULL §B); lets C2 short-circuit name/address
    /// matching when present.
    pub building_external_id: Option<String>,
    pub listing_address: Option<String>,
    pub listing_floor_number: Option<i64>,
    pub listing_area: Option<f64>,
    pub listing_balcony_area: Option<f64>,
    pub listing_layout: Option<String>,
    pub listing_direction: Option<String>,
    pub listing_total_floors: Option<i64>,
    pub listing_basement_floors: Option<i64>,
    pub listing_total_units: Option<i64>,
    pub listing_built_year: Option<i64>,
    pub listing_built_month: Option<i64>,
    pub listing_land_rights: Option<String>,
    pub listing_building_structure: Option<String>,
    pub listing_station_info: Option<String>,
    /// Dropped from the spec's §3/§6 distillation but present on the
    /// original's `Listing.listing_parking_info` (SPEC_FULL §B);
    /// carried through so `parking_info`'s vote in §4.3 has an input.
    pub listing_parking_info: Option<String>,
    pub current_price: Option<i64>,
    pub management_fee: Option<i64>,
    pub repair_fund: Option<i64>,
    pub agency_name: Option<String>,
    pub agency_tel: Option<String>,
    pub first_published_at: Option<chrono::NaiveDate>,
    pub published_at: Option<chrono::NaiveDate>,
    pub has_update_mark: bool,
    pub room_number: Option<String>,
}
