// src/lifecycle/mod.rs
//
// C4 — Listing Lifecycle Manager (spec §4.4). Retires stale listings,
// marks properties sold once their last listing goes inactive, and
// derives `final_price` by majority vote over the pre-sale window.

use std::collections::HashMap;

use chrono::{Duration, Utc};
use rusqlite::Connection;

use crate::db::{listings, price_changes, properties};
use crate::errors::Result;

pub const STALE_HOURS: i64 = 24;
pub const SOLD_PRICE_VOTE_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Default, Clone)]
pub struct LifecycleReport {
    pub retired_listings: usize,
    pub sold_properties: usize,
    pub affected_property_ids: Vec<i64>,
    pub affected_building_ids: Vec<i64>,
}

/// Majority price over the `SOLD_PRICE_VOTE_WINDOW_DAYS` before
/// `sold_at`; ties broken by the higher price (spec §4.4 step 2).
fn vote_final_price(conn: &Connection, property_id: i64, sold_at: chrono::NaiveDateTime) -> Result<Option<i64>> {
    let window_start = sold_at - Duration::days(SOLD_PRICE_VOTE_WINDOW_DAYS);
    let listing_rows = listings::for_property(conn, property_id)?;

    let mut counts: HashMap<i64, i64> = HashMap::new();
    for l in &listing_rows {
        let history = listings::price_history_for_listing(conn, l.id)?;
        for h in history.iter().filter(|h| h.recorded_at >= window_start && h.recorded_at <= sold_at) {
            *counts.entry(h.price).or_insert(0) += 1;
        }
    }
    if counts.is_empty() {
        return Ok(None);
    }
    let winner = counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
        .map(|(price, _)| price);
    Ok(winner)
}

/// Runs one full C4 pass: retires stale listings, marks newly-sold
/// properties, and returns what downstream jobs (C3 refresh, C10
/// invalidation) need to act on.
pub fn run(conn: &Connection) -> Result<LifecycleReport> {
    let now = Utc::now().naive_utc();
    let cutoff = now - Duration::hours(STALE_HOURS);

    let affected_properties = listings::retire_stale(conn, cutoff)?;
    let mut report = LifecycleReport {
        retired_listings: affected_properties.len(),
        ..Default::default()
    };

    let mut affected_buildings = std::collections::HashSet::new();
    for property_id in &affected_properties {
        if let Some(property) = properties::find_by_id(conn, *property_id)? {
            affected_buildings.insert(property.building_id);
        }
    }

    for property_id in &affected_properties {
        let property = match properties::find_by_id(conn, *property_id)? {
            Some(p) => p,
            None => continue,
        };
        if property.sold_at.is_some() {
            continue;
        }
        let no_active = properties::properties_with_no_active_listings(conn, property.building_id)?;
        if !no_active.contains(property_id) {
            continue;
        }

        let sold_at = listings::for_property(conn, *property_id)?
            .into_iter()
            .filter_map(|l| l.delisted_at)
            .max()
            .unwrap_or(now);
        let final_price = vote_final_price(conn, *property_id, sold_at)?;
        properties::mark_sold(conn, *property_id, sold_at, final_price)?;
        price_changes::enqueue(conn, *property_id, "sold", 3)?;
        report.sold_properties += 1;
    }

    report.affected_property_ids = affected_properties;
    report.affected_building_ids = affected_buildings.into_iter().collect();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::test_db;
    use crate::domain::{RawListing, SourceSite};
    use crate::identity;

    fn raw() -> RawListing {
        RawListing {
            source_site: SourceSite::Suumo,
            site_property_id: "P1".to_string(),
            url: "https://example.test/p1".to_string(),
            building_name: "白金ザ・スカイ".to_string(),
            building_external_id: None,
            listing_address: None,
            listing_floor_number: Some(10),
            listing_area: Some(55.0),
            listing_balcony_area: None,
            listing_layout: Some("1LDK".to_string()),
            listing_direction: Some("S".to_string()),
            listing_total_floors: None,
            listing_basement_floors: None,
            listing_total_units: None,
            listing_built_year: None,
            listing_built_month: None,
            listing_land_rights: None,
            listing_building_structure: None,
            listing_station_info: None,
            listing_parking_info: None,
            current_price: Some(8000),
            management_fee: None,
            repair_fund: None,
            agency_name: None,
            agency_tel: None,
            first_published_at: None,
            published_at: None,
            has_update_mark: false,
            room_number: None,
        }
    }

    #[test]
    fn s5_stale_listing_retirement_marks_property_sold() {
        let db = test_db();
        db.with_conn(|conn| {
            let resolved = identity::resolve(conn, &raw())?;
            let old = Utc::now().naive_utc() - Duration::hours(25);
            conn.execute(
                "UPDATE listings SET last_confirmed_at = ?2 WHERE id = ?1",
                rusqlite::params![resolved.listing_id, old],
            )?;

            let report = run(conn)?;
            assert_eq!(report.retired_listings, 1);
            assert_eq!(report.sold_properties, 1);

            let property = properties::find_by_id(conn, resolved.master_property_id)?.unwrap();
            assert!(property.sold_at.is_some());
            Ok(())
        })
        .unwrap();
    }
}
