// src/domain/listing.rs
//
// One source's advertisement for a `MasterProperty` (spec §3). Raw
// per-source attributes are kept alongside the property's own
// majority-voted fields so C3 can re-tally votes without re-fetching.

use chrono::NaiveDateTime;

use super::raw_listing::SourceSite;

#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    pub id: i64,
    pub master_property_id: i64,
    pub source_site: SourceSite,
    pub site_property_id: String,
    pub url: String,
    pub listing_building_name: String,
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
    pub listing_station_info: Option<String>,
    pub listing_building_structure: Option<String>,
    pub listing_parking_info: Option<String>,
    pub current_price: Option<i64>,
    pub management_fee: Option<i64>,
    pub repair_fund: Option<i64>,
    pub agency_name: Option<String>,
    pub agency_tel: Option<String>,
    pub is_active: bool,
    pub first_seen_at: NaiveDateTime,
    pub first_published_at: Option<chrono::NaiveDate>,
    pub published_at: Option<chrono::NaiveDate>,
    pub last_scraped_at: NaiveDateTime,
    pub last_confirmed_at: NaiveDateTime,
    pub last_fetched_at: Option<NaiveDateTime>,
    pub price_updated_at: Option<NaiveDateTime>,
    pub delisted_at: Option<NaiveDateTime>,
    pub detail_fetched_at: Option<NaiveDateTime>,
    pub has_update_mark: bool,
}

/// Appended on every observed price change for a listing (spec §3);
/// the input C5 tallies per-day majority votes from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ListingPriceHistory {
    pub id: i64,
    pub listing_id: i64,
    pub recorded_at: NaiveDateTime,
    pub price: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn price_history_row_carries_listing_id_and_price() {
        let row = ListingPriceHistory {
            id: 1,
            listing_id: 42,
            recorded_at: NaiveDate::from_ymd_opt(2026, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            price: 5000,
        };
        assert_eq!(row.listing_id, 42);
        assert_eq!(row.price, 5000);
    }
}
