// src/domain/property.rs
use chrono::NaiveDateTime;

/// A unit within a building — the deduplicated identity across sources
/// (spec §3). Identity key is `(building_id, floor_number, area, layout,
/// direction)` when `room_number` is null; otherwise `room_number`
/// participates instead, enforced by the two partial unique indexes in
/// `db::schema`.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterProperty {
    pub id: i64,
    pub building_id: i64,
    pub room_number: Option<String>,
    pub floor_number: Option<i64>,
    pub area: Option<f64>,
    pub balcony_area: Option<f64>,
    pub layout: Option<String>,
    pub direction: Option<String>,
    pub display_building_name: Option<String>,
    pub current_price: Option<i64>,
    pub sold_at: Option<NaiveDateTime>,
    pub final_price: Option<i64>,
    pub final_price_updated_at: Option<NaiveDateTime>,
    pub earliest_listing_date: Option<NaiveDateTime>,
    pub management_fee: Option<i64>,
    pub repair_fund: Option<i64>,
    pub station_info: Option<String>,
    pub parking_info: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: i64) -> MasterProperty {
        MasterProperty {
            id,
            building_id: 1,
            room_number: None,
            floor_number: Some(10),
            area: Some(55.3),
            balcony_area: None,
            layout: Some("1LDK".to_string()),
            direction: Some("South".to_string()),
            display_building_name: None,
            current_price: Some(5000),
            sold_at: None,
            final_price: None,
            final_price_updated_at: None,
            earliest_listing_date: None,
            management_fee: None,
            repair_fund: None,
            station_info: None,
            parking_info: None,
        }
    }

    #[test]
    fn sample_property_roundtrips_fields() {
        let p = sample(1);
        assert_eq!(p.floor_number, Some(10));
        assert_eq!(p.layout.as_deref(), Some("1LDK"));
    }
}
