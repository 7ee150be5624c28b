// src/db/properties.rs
//
// Persistence for `MasterProperty` (C2/C3/C4, spec §3/§4.2-§4.4).

use chrono::{NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::domain::MasterProperty;
use crate::errors::{Error, Result};

const SELECT_COLUMNS: &str = "id, building_id, room_number, floor_number, area, balcony_area, \
    layout, direction, display_building_name, current_price, sold_at, final_price, \
    final_price_updated_at, earliest_listing_date, management_fee, repair_fund, station_info, \
    parking_info";

fn row_to_property(row: &rusqlite::Row) -> rusqlite::Result<MasterProperty> {
    Ok(MasterProperty {
        id: row.get(0)?,
        building_id: row.get(1)?,
        room_number: row.get(2)?,
        floor_number: row.get(3)?,
        area: row.get(4)?,
        balcony_area: row.get(5)?,
        layout: row.get(6)?,
        direction: row.get(7)?,
        display_building_name: row.get(8)?,
        current_price: row.get(9)?,
        sold_at: row.get(10)?,
        final_price: row.get(11)?,
        final_price_updated_at: row.get(12)?,
        earliest_listing_date: row.get(13)?,
        management_fee: row.get(14)?,
        repair_fund: row.get(15)?,
        station_info: row.get(16)?,
        parking_info: row.get(17)?,
    })
}

pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<MasterProperty>> {
    conn.query_row(
        &format!("SELECT {SELECT_COLUMNS} FROM master_properties WHERE id = ?1"),
        params![id],
        row_to_property,
    )
    .optional()
    .map_err(Error::from)
}

pub fn find_by_room_number(
    conn: &Connection,
    building_id: i64,
    room_number: &str,
) -> Result<Option<MasterProperty>> {
    conn.query_row(
        &format!("SELECT {SELECT_COLUMNS} FROM master_properties WHERE building_id = ?1 AND room_number = ?2"),
        params![building_id, room_number],
        row_to_property,
    )
    .optional()
    .map_err(Error::from)
}

/// Composite-key candidates within `area_tolerance` m² of `area` (spec
/// §4.2 step 3a: `area ± 0.5m²`). Exact match on `floor_number`;
/// `layout`/`direction` are compared by the caller after normalization
/// since SQL equality here would miss equivalence-class members.
pub fn find_candidates_by_composite_key(
    conn: &Connection,
    building_id: i64,
    floor_number: Option<i64>,
    area: Option<f64>,
    area_tolerance: f64,
) -> Result<Vec<MasterProperty>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM master_properties \
         WHERE building_id = ?1 AND room_number IS NULL \
         AND (?2 IS NULL OR floor_number = ?2) \
         AND (?3 IS NULL OR area IS NULL OR ABS(area - ?3) <= ?4)"
    ))?;
    let rows = stmt.query_map(
        params![building_id, floor_number, area, area_tolerance],
        row_to_property,
    )?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn insert(
    conn: &Connection,
    building_id: i64,
    room_number: Option<&str>,
    floor_number: Option<i64>,
    area: Option<f64>,
    layout: Option<&str>,
    direction: Option<&str>,
) -> Result<i64> {
    let now = Utc::now().naive_utc();
    conn.execute(
        "INSERT INTO master_properties \
            (building_id, room_number, floor_number, area, layout, direction, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![building_id, room_number, floor_number, area, layout, direction, now],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn delete(conn: &Connection, property_id: i64) -> Result<()> {
    conn.execute("DELETE FROM master_properties WHERE id = ?1", params![property_id])?;
    Ok(())
}

pub fn resolve_redirect(conn: &Connection, property_id: i64) -> Result<i64> {
    conn.query_row(
        "SELECT final_primary_property_id FROM property_merge_history WHERE merged_property_id = ?1",
        params![property_id],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map(|opt| opt.unwrap_or(property_id))
    .map_err(Error::from)
}

/// Attributes voted by C3. Key-participating fields (`floor_number,
/// area, layout, direction`) are written only when the caller has
/// already verified they won't collide with a sibling property's
/// composite key (spec §4.3: "update the remaining ones" otherwise).
#[allow(clippy::too_many_arguments)]
pub fn update_voted_attributes(
    conn: &Connection,
    property_id: i64,
    key_fields: Option<(Option<i64>, Option<f64>, Option<&str>, Option<&str>)>,
    balcony_area: Option<f64>,
    display_building_name: Option<&str>,
    management_fee: Option<i64>,
    repair_fund: Option<i64>,
    station_info: Option<&str>,
    parking_info: Option<&str>,
) -> Result<()> {
    let now = Utc::now().naive_utc();
    if let Some((floor_number, area, layout, direction)) = key_fields {
        conn.execute(
            "UPDATE master_properties SET floor_number = ?2, area = ?3, layout = ?4, direction = ?5, updated_at = ?6 \
             WHERE id = ?1",
            params![property_id, floor_number, area, layout, direction, now],
        )?;
    }
    conn.execute(
        "UPDATE master_properties SET \
            balcony_area = COALESCE(?2, balcony_area), \
            display_building_name = COALESCE(?3, display_building_name), \
            management_fee = COALESCE(?4, management_fee), \
            repair_fund = COALESCE(?5, repair_fund), \
            station_info = COALESCE(?6, station_info), \
            parking_info = COALESCE(?7, parking_info), \
            updated_at = ?8 \
         WHERE id = ?1",
        params![
            property_id,
            balcony_area,
            display_building_name,
            management_fee,
            repair_fund,
            station_info,
            parking_info,
            now
        ],
    )?;
    Ok(())
}

pub fn update_current_price(conn: &Connection, property_id: i64, price: Option<i64>) -> Result<()> {
    conn.execute(
        "UPDATE master_properties SET current_price = ?2 WHERE id = ?1",
        params![property_id, price],
    )?;
    Ok(())
}

pub fn mark_sold(
    conn: &Connection,
    property_id: i64,
    sold_at: NaiveDateTime,
    final_price: Option<i64>,
) -> Result<()> {
    let now = Utc::now().naive_utc();
    conn.execute(
        "UPDATE master_properties SET sold_at = ?2, final_price = ?3, final_price_updated_at = ?4, current_price = NULL \
         WHERE id = ?1",
        params![property_id, sold_at, final_price, now],
    )?;
    Ok(())
}

pub fn update_earliest_listing_date(conn: &Connection, property_id: i64, date: NaiveDateTime) -> Result<()> {
    conn.execute(
        "UPDATE master_properties SET earliest_listing_date = MIN(COALESCE(earliest_listing_date, ?2), ?2) \
         WHERE id = ?1",
        params![property_id, date],
    )?;
    Ok(())
}

pub fn reassign_building(conn: &Connection, property_id: i64, building_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE master_properties SET building_id = ?2 WHERE id = ?1",
        params![property_id, building_id],
    )?;
    Ok(())
}

pub fn properties_for_building(conn: &Connection, building_id: i64) -> Result<Vec<MasterProperty>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM master_properties WHERE building_id = ?1"
    ))?;
    let rows = stmt.query_map(params![building_id], row_to_property)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

/// Properties with zero remaining active listings, for C4 step 2.
pub fn properties_with_no_active_listings(conn: &Connection, building_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT p.id FROM master_properties p \
         WHERE p.building_id = ?1 AND p.sold_at IS NULL \
         AND NOT EXISTS (SELECT 1 FROM listings l WHERE l.master_property_id = p.id AND l.is_active = 1)",
    )?;
    let rows = stmt.query_map(params![building_id], |row| row.get::<_, i64>(0))?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::test_db;

    #[test]
    fn insert_then_find_candidates_by_composite_key() {
        let db = test_db();
        db.with_conn(|conn| {
            let bid = crate::db::buildings::insert(conn, "X", "X", true)?;
            let pid = insert(conn, bid, None, Some(15), Some(70.2), Some("2LDK"), Some("S"))?;
            let found = find_candidates_by_composite_key(conn, bid, Some(15), Some(70.4), 0.5)?;
            assert_eq!(found.len(), 1);
            assert_eq!(found[0].id, pid);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn key_fields_untouched_when_not_supplied() {
        let db = test_db();
        db.with_conn(|conn| {
            let bid = crate::db::buildings::insert(conn, "X", "X", true)?;
            let pid = insert(conn, bid, None, Some(15), Some(70.2), Some("2LDK"), Some("S"))?;
            update_voted_attributes(conn, pid, None, Some(12.0), None, None, None, None, None)?;
            let p = find_by_id(conn, pid)?.unwrap();
            assert_eq!(p.floor_number, Some(15));
            assert_eq!(p.balcony_area, Some(12.0));
            Ok(())
        })
        .unwrap();
    }
}
