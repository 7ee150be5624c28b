// src/db/listings.rs
//
// Persistence for `Listing` and `ListingPriceHistory` (C2/C4, spec
// §3/§4.2/§4.4).

use chrono::{NaiveDate, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::domain::{Listing, ListingPriceHistory, SourceSite};
use crate::errors::{Error, Result};

const SELECT_COLUMNS: &str = "id, master_property_id, source_site, site_property_id, url, \
    listing_building_name, listing_address, listing_floor_number, listing_area, \
    listing_balcony_area, listing_layout, listing_direction, listing_total_floors, \
    listing_basement_floors, listing_total_units, listing_built_year, listing_built_month, \
    listing_land_rights, listing_station_info, listing_building_structure, listing_parking_info, \
    current_price, management_fee, repair_fund, agency_name, agency_tel, is_active, first_seen_at, \
    first_published_at, published_at, last_scraped_at, last_confirmed_at, last_fetched_at, \
    price_updated_at, delisted_at, detail_fetched_at, has_update_mark";

fn row_to_listing(row: &rusqlite::Row) -> rusqlite::Result<Listing> {
    let source_site: String = row.get(2)?;
    Ok(Listing {
        id: row.get(0)?,
        master_property_id: row.get(1)?,
        source_site: source_site.parse().unwrap_or(SourceSite::Suumo),
        site_property_id: row.get(3)?,
        url: row.get(4)?,
        listing_building_name: row.get(5)?,
        listing_address: row.get(6)?,
        listing_floor_number: row.get(7)?,
        listing_area: row.get(8)?,
        listing_balcony_area: row.get(9)?,
        listing_layout: row.get(10)?,
        listing_direction: row.get(11)?,
        listing_total_floors: row.get(12)?,
        listing_basement_floors: row.get(13)?,
        listing_total_units: row.get(14)?,
        listing_built_year: row.get(15)?,
        listing_built_month: row.get(16)?,
        listing_land_rights: row.get(17)?,
        listing_station_info: row.get(18)?,
        listing_building_structure: row.get(19)?,
        listing_parking_info: row.get(20)?,
        current_price: row.get(21)?,
        management_fee: row.get(22)?,
        repair_fund: row.get(23)?,
        agency_name: row.get(24)?,
        agency_tel: row.get(25)?,
        is_active: row.get(26)?,
        first_seen_at: row.get(27)?,
        first_published_at: row.get(28)?,
        published_at: row.get(29)?,
        last_scraped_at: row.get(30)?,
        last_confirmed_at: row.get(31)?,
        last_fetched_at: row.get(32)?,
        price_updated_at: row.get(33)?,
        delisted_at: row.get(34)?,
        detail_fetched_at: row.get(35)?,
        has_update_mark: row.get(36)?,
    })
}

pub fn find_by_source_key(
    conn: &Connection,
    source_site: SourceSite,
    site_property_id: &str,
) -> Result<Option<Listing>> {
    conn.query_row(
        &format!("SELECT {SELECT_COLUMNS} FROM listings WHERE source_site = ?1 AND site_property_id = ?2"),
        params![source_site.as_str(), site_property_id],
        row_to_listing,
    )
    .optional()
    .map_err(Error::from)
}

pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Listing>> {
    conn.query_row(
        &format!("SELECT {SELECT_COLUMNS} FROM listings WHERE id = ?1"),
        params![id],
        row_to_listing,
    )
    .optional()
    .map_err(Error::from)
}

pub fn for_property(conn: &Connection, master_property_id: i64) -> Result<Vec<Listing>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM listings WHERE master_property_id = ?1"
    ))?;
    let rows = stmt.query_map(params![master_property_id], row_to_listing)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn active_for_property(conn: &Connection, master_property_id: i64) -> Result<Vec<Listing>> {
    Ok(for_property(conn, master_property_id)?
        .into_iter()
        .filter(|l| l.is_active)
        .collect())
}

/// Inserts the first observation of a listing (spec §4.2 step 5).
#[allow(clippy::too_many_arguments)]
pub fn insert(conn: &Connection, master_property_id: i64, raw: &crate::domain::RawListing, now: NaiveDateTime) -> Result<i64> {
    conn.execute(
        "INSERT INTO listings (\
            master_property_id, source_site, site_property_id, url, listing_building_name, \
            listing_address, listing_floor_number, listing_area, listing_balcony_area, \
            listing_layout, listing_direction, listing_total_floors, listing_basement_floors, \
            listing_total_units, listing_built_year, listing_built_month, listing_land_rights, \
            listing_station_info, listing_building_structure, listing_parking_info, current_price, \
            management_fee, repair_fund, agency_name, agency_tel, is_active, has_update_mark, \
            first_seen_at, first_published_at, published_at, last_scraped_at, last_confirmed_at \
         ) VALUES (\
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, \
            ?20, ?21, ?22, ?23, ?24, ?25, 1, ?26, ?27, ?28, ?29, ?27, ?27 \
         )",
        params![
            master_property_id,
            raw.source_site.as_str(),
            raw.site_property_id,
            raw.url,
            raw.building_name,
            raw.listing_address,
            raw.listing_floor_number,
            raw.listing_area,
            raw.listing_balcony_area,
            raw.listing_layout,
            raw.listing_direction,
            raw.listing_total_floors,
            raw.listing_basement_floors,
            raw.listing_total_units,
            raw.listing_built_year,
            raw.listing_built_month,
            raw.listing_land_rights,
            raw.listing_station_info,
            raw.listing_building_structure,
            raw.listing_parking_info,
            raw.current_price,
            raw.management_fee,
            raw.repair_fund,
            raw.agency_name,
            raw.agency_tel,
            raw.has_update_mark,
            now,
            raw.first_published_at,
            raw.published_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Re-observes an existing listing: upserts raw attributes, bumps
/// freshness timestamps, and reactivates it (spec §4.2 step 5).
#[allow(clippy::too_many_arguments)]
pub fn refresh_observation(conn: &Connection, listing_id: i64, raw: &crate::domain::RawListing, now: NaiveDateTime) -> Result<()> {
    conn.execute(
        "UPDATE listings SET \
            listing_building_name = ?2, listing_address = ?3, listing_floor_number = ?4, \
            listing_area = ?5, listing_balcony_area = ?6, listing_layout = ?7, listing_direction = ?8, \
            listing_total_floors = ?9, listing_basement_floors = ?10, listing_total_units = ?11, \
            listing_built_year = ?12, listing_built_month = ?13, listing_land_rights = ?14, \
            listing_station_info = ?15, listing_building_structure = ?16, listing_parking_info = ?17, \
            management_fee = ?18, repair_fund = ?19, agency_name = ?20, agency_tel = ?21, \
            has_update_mark = ?22, published_at = ?23, is_active = 1, last_scraped_at = ?24, \
            last_confirmed_at = ?24, delisted_at = NULL \
         WHERE id = ?1",
        params![
            listing_id,
            raw.building_name,
            raw.listing_address,
            raw.listing_floor_number,
            raw.listing_area,
            raw.listing_balcony_area,
            raw.listing_layout,
            raw.listing_direction,
            raw.listing_total_floors,
            raw.listing_basement_floors,
            raw.listing_total_units,
            raw.listing_built_year,
            raw.listing_built_month,
            raw.listing_land_rights,
            raw.listing_station_info,
            raw.listing_building_structure,
            raw.listing_parking_info,
            raw.management_fee,
            raw.repair_fund,
            raw.agency_name,
            raw.agency_tel,
            raw.has_update_mark,
            raw.published_at,
            now,
        ],
    )?;
    Ok(())
}

pub fn update_price(conn: &Connection, listing_id: i64, new_price: i64, now: NaiveDateTime) -> Result<()> {
    conn.execute(
        "UPDATE listings SET current_price = ?2, price_updated_at = ?3 WHERE id = ?1",
        params![listing_id, new_price, now],
    )?;
    Ok(())
}

pub fn set_detail_fetched(conn: &Connection, listing_id: i64, now: NaiveDateTime) -> Result<()> {
    conn.execute(
        "UPDATE listings SET detail_fetched_at = ?2, last_fetched_at = ?2 WHERE id = ?1",
        params![listing_id, now],
    )?;
    Ok(())
}

pub fn reassign_property(conn: &Connection, listing_id: i64, master_property_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE listings SET master_property_id = ?2 WHERE id = ?1",
        params![listing_id, master_property_id],
    )?;
    Ok(())
}

/// Retires stale listings (C4 step 1): `is_active AND last_confirmed_at
/// < cutoff`. Returns the affected property ids so the caller can
/// enqueue C3/C4-downstream work.
pub fn retire_stale(conn: &Connection, cutoff: NaiveDateTime) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT id, master_property_id, last_confirmed_at FROM listings \
         WHERE is_active = 1 AND last_confirmed_at < ?1",
    )?;
    let rows = stmt.query_map(params![cutoff], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, NaiveDateTime>(2)?,
        ))
    })?;
    let mut affected_properties = Vec::new();
    let mut to_retire = Vec::new();
    for r in rows {
        let (listing_id, property_id, last_confirmed_at) = r?;
        to_retire.push((listing_id, last_confirmed_at));
        affected_properties.push(property_id);
    }
    for (listing_id, last_confirmed_at) in to_retire {
        conn.execute(
            "UPDATE listings SET is_active = 0, delisted_at = ?2 WHERE id = ?1",
            params![listing_id, last_confirmed_at],
        )?;
    }
    affected_properties.sort_unstable();
    affected_properties.dedup();
    Ok(affected_properties)
}

pub fn insert_price_history(conn: &Connection, listing_id: i64, price: i64, recorded_at: NaiveDateTime) -> Result<i64> {
    conn.execute(
        "INSERT INTO listing_price_history (listing_id, recorded_at, price) VALUES (?1, ?2, ?3)",
        params![listing_id, recorded_at, price],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn price_history_for_listing(conn: &Connection, listing_id: i64) -> Result<Vec<ListingPriceHistory>> {
    let mut stmt = conn.prepare(
        "SELECT id, listing_id, recorded_at, price FROM listing_price_history \
         WHERE listing_id = ?1 ORDER BY recorded_at ASC",
    )?;
    let rows = stmt.query_map(params![listing_id], |row| {
        Ok(ListingPriceHistory {
            id: row.get(0)?,
            listing_id: row.get(1)?,
            recorded_at: row.get(2)?,
            price: row.get(3)?,
        })
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn earliest_observed_date(conn: &Connection, master_property_id: i64) -> Result<Option<NaiveDate>> {
    conn.query_row(
        "SELECT MIN(DATE(first_seen_at)) FROM listings WHERE master_property_id = ?1",
        params![master_property_id],
        |row| row.get::<_, Option<NaiveDate>>(0),
    )
    .map_err(Error::from)
}

pub fn reparent_price_history(conn: &Connection, from_listing_id: i64, to_listing_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE listing_price_history SET listing_id = ?2 WHERE listing_id = ?1",
        params![from_listing_id, to_listing_id],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, listing_id: i64) -> Result<()> {
    conn.execute("DELETE FROM listings WHERE id = ?1", params![listing_id])?;
    Ok(())
}

pub fn touch_price(conn: &Connection, listing_id: i64) -> Result<()> {
    let now = Utc::now().naive_utc();
    conn.execute(
        "UPDATE listings SET price_updated_at = ?2 WHERE id = ?1",
        params![listing_id, now],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::test_db;
    use crate::domain::RawListing;

    fn sample_raw() -> RawListing {
        RawListing {
            source_site: SourceSite::Suumo,
            site_property_id: "P1".to_string(),
            url: "https://example.test/p1".to_string(),
            building_name: "白金ザ・スカイ".to_string(),
            building_external_id: None,
            listing_address: None,
            listing_floor_number: Some(15),
            listing_area: Some(70.2),
            listing_balcony_area: None,
            listing_layout: Some("2LDK".to_string()),
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
            current_price: Some(12000),
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
    fn insert_then_find_by_source_key() {
        let db = test_db();
        db.with_conn(|conn| {
            let bid = crate::db::buildings::insert(conn, "X", "X", true)?;
            let pid = crate::db::properties::insert(conn, bid, None, Some(15), Some(70.2), Some("2LDK"), Some("S"))?;
            let now = Utc::now().naive_utc();
            let raw = sample_raw();
            let id = insert(conn, pid, &raw, now)?;
            let found = find_by_source_key(conn, SourceSite::Suumo, "P1")?.unwrap();
            assert_eq!(found.id, id);
            assert_eq!(found.current_price, Some(12000));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn retire_stale_flags_old_listings() {
        let db = test_db();
        db.with_conn(|conn| {
            let bid = crate::db::buildings::insert(conn, "X", "X", true)?;
            let pid = crate::db::properties::insert(conn, bid, None, Some(15), Some(70.2), Some("2LDK"), Some("S"))?;
            let old = Utc::now().naive_utc() - chrono::Duration::hours(25);
            let raw = sample_raw();
            let id = insert(conn, pid, &raw, old)?;
            conn.execute(
                "UPDATE listings SET last_confirmed_at = ?2 WHERE id = ?1",
                params![id, old],
            )?;
            let cutoff = Utc::now().naive_utc() - chrono::Duration::hours(24);
            let affected = retire_stale(conn, cutoff)?;
            assert_eq!(affected, vec![pid]);
            let listing = find_by_id(conn, id)?.unwrap();
            assert!(!listing.is_active);
            assert!(listing.delisted_at.is_some());
            Ok(())
        })
        .unwrap();
    }
}
