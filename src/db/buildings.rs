// src/db/buildings.rs
//
// Persistence for `Building` and `BuildingListingName` (C2/C3, spec
// §4.2/§4.3).

use chrono::{NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::domain::Building;
use crate::errors::{Error, Result};

fn row_to_building(row: &rusqlite::Row) -> rusqlite::Result<Building> {
    Ok(Building {
        id: row.get(0)?,
        normalized_name: row.get(1)?,
        canonical_name: row.get(2)?,
        address: row.get(3)?,
        normalized_address: row.get(4)?,
        total_floors: row.get(5)?,
        basement_floors: row.get(6)?,
        total_units: row.get(7)?,
        built_year: row.get(8)?,
        built_month: row.get(9)?,
        construction_type: row.get(10)?,
        land_rights: row.get(11)?,
        station_info: row.get(12)?,
        latitude: row.get(13)?,
        longitude: row.get(14)?,
        geocoded_at: row.get(15)?,
        is_valid_name: row.get(16)?,
    })
}

const SELECT_COLUMNS: &str = "id, normalized_name, canonical_name, address, normalized_address, \
    total_floors, basement_floors, total_units, built_year, built_month, construction_type, \
    land_rights, station_info, latitude, longitude, geocoded_at, is_valid_name";

pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Building>> {
    conn.query_row(
        &format!("SELECT {SELECT_COLUMNS} FROM buildings WHERE id = ?1"),
        params![id],
        row_to_building,
    )
    .optional()
    .map_err(Error::from)
}

/// Step 2a: exact canonical-name match with an address-prefix guard.
/// `address_prefix` is None when the listing carries no address, in
/// which case the match is accepted on name alone (a prefix guard
/// can't be tighter than the data allows).
pub fn find_by_canonical_name(
    conn: &Connection,
    canonical_name: &str,
    address_prefix: Option<&str>,
) -> Result<Vec<Building>> {
    let mut stmt =
        conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM buildings WHERE canonical_name = ?1"))?;
    let rows = stmt.query_map(params![canonical_name], row_to_building)?;
    let mut out = Vec::new();
    for r in rows {
        let b = r?;
        if matches_address_prefix(&b, address_prefix) {
            out.push(b);
        }
    }
    Ok(out)
}

fn matches_address_prefix(building: &Building, prefix: Option<&str>) -> bool {
    match (prefix, &building.normalized_address) {
        (None, _) => true,
        (Some(p), Some(addr)) => addr.starts_with(p),
        (Some(_), None) => false,
    }
}

/// Step 2b: via `BuildingListingName` alias table.
pub fn find_by_alias_canonical_name(
    conn: &Connection,
    canonical_name: &str,
    address_prefix: Option<&str>,
) -> Result<Vec<Building>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {cols} FROM buildings b \
         JOIN building_listing_names n ON n.building_id = b.id \
         WHERE n.canonical_name = ?1",
        cols = SELECT_COLUMNS
            .split(", ")
            .map(|c| format!("b.{c}"))
            .collect::<Vec<_>>()
            .join(", ")
    ))?;
    let rows = stmt.query_map(params![canonical_name], row_to_building)?;
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for r in rows {
        let b = r?;
        if matches_address_prefix(&b, address_prefix) && seen.insert(b.id) {
            out.push(b);
        }
    }
    Ok(out)
}

pub fn insert(
    conn: &Connection,
    normalized_name: &str,
    canonical_name: &str,
    is_valid_name: bool,
) -> Result<i64> {
    let now = Utc::now().naive_utc();
    conn.execute(
        "INSERT INTO buildings (normalized_name, canonical_name, is_valid_name, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![normalized_name, canonical_name, is_valid_name, now],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Recreates a building from a full attribute snapshot (spec §4.6.1
/// revert: "Restore the Building row from merge_details"). Always
/// issues a fresh surrogate id — see DESIGN.md, "Building-merge-revert
/// identity".
#[allow(clippy::too_many_arguments)]
pub fn insert_snapshot(
    conn: &Connection,
    normalized_name: &str,
    canonical_name: &str,
    address: Option<&str>,
    normalized_address: Option<&str>,
    total_floors: Option<i64>,
    basement_floors: Option<i64>,
    total_units: Option<i64>,
    built_year: Option<i64>,
    built_month: Option<i64>,
    construction_type: Option<&str>,
    land_rights: Option<&str>,
    station_info: Option<&str>,
    is_valid_name: bool,
) -> Result<i64> {
    let now = Utc::now().naive_utc();
    conn.execute(
        "INSERT INTO buildings (normalized_name, canonical_name, address, normalized_address, \
            total_floors, basement_floors, total_units, built_year, built_month, \
            construction_type, land_rights, station_info, is_valid_name, created_at, updated_at) \
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?14)",
        params![
            normalized_name,
            canonical_name,
            address,
            normalized_address,
            total_floors,
            basement_floors,
            total_units,
            built_year,
            built_month,
            construction_type,
            land_rights,
            station_info,
            is_valid_name,
            now
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Applies building-merge redirection: follows `final_primary_building_id`
/// directly since it's kept materialized (spec §9 "Arena for merge
/// redirection" — redirection is always one hop once final_primary is
/// correctly maintained).
pub fn resolve_redirect(conn: &Connection, building_id: i64) -> Result<i64> {
    conn.query_row(
        "SELECT final_primary_building_id FROM building_merge_history WHERE merged_building_id = ?1",
        params![building_id],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map(|opt| opt.unwrap_or(building_id))
    .map_err(Error::from)
}

#[allow(clippy::too_many_arguments)]
pub fn update_voted_attributes(
    conn: &Connection,
    building_id: i64,
    normalized_name: Option<&str>,
    address: Option<&str>,
    normalized_address: Option<&str>,
    total_floors: Option<i64>,
    basement_floors: Option<i64>,
    total_units: Option<i64>,
    built_year: Option<i64>,
    built_month: Option<i64>,
    construction_type: Option<&str>,
    land_rights: Option<&str>,
    station_info: Option<&str>,
) -> Result<()> {
    let now = Utc::now().naive_utc();
    conn.execute(
        "UPDATE buildings SET \
            normalized_name = COALESCE(?2, normalized_name), \
            address = COALESCE(?3, address), \
            normalized_address = COALESCE(?4, normalized_address), \
            total_floors = COALESCE(?5, total_floors), \
            basement_floors = COALESCE(?6, basement_floors), \
            total_units = COALESCE(?7, total_units), \
            built_year = COALESCE(?8, built_year), \
            built_month = COALESCE(?9, built_month), \
            construction_type = COALESCE(?10, construction_type), \
            land_rights = COALESCE(?11, land_rights), \
            station_info = COALESCE(?12, station_info), \
            updated_at = ?13 \
         WHERE id = ?1",
        params![
            building_id,
            normalized_name,
            address,
            normalized_address,
            total_floors,
            basement_floors,
            total_units,
            built_year,
            built_month,
            construction_type,
            land_rights,
            station_info,
            now
        ],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, building_id: i64) -> Result<()> {
    conn.execute("DELETE FROM buildings WHERE id = ?1", params![building_id])?;
    Ok(())
}

/// Upserts the alias row for a name observed against `building_id`,
/// merging `source_site` into the stored comma-joined set (spec §4.3:
/// "upsert BuildingListingName ... source_sites += source_site").
pub fn upsert_listing_name(
    conn: &Connection,
    building_id: i64,
    normalized_name: &str,
    canonical_name: &str,
    source_site: &str,
    occurrence_delta: i64,
) -> Result<()> {
    let now = Utc::now().naive_utc();
    let existing: Option<(i64, String, i64)> = conn
        .query_row(
            "SELECT id, source_sites, occurrence_count FROM building_listing_names \
             WHERE building_id = ?1 AND normalized_name = ?2",
            params![building_id, normalized_name],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    match existing {
        Some((id, sites_joined, occurrence_count)) => {
            let mut sites = crate::domain::BuildingListingName::parse_source_sites(&sites_joined);
            if !sites.iter().any(|s| s == source_site) {
                sites.push(source_site.to_string());
            }
            conn.execute(
                "UPDATE building_listing_names SET source_sites = ?2, occurrence_count = ?3, last_seen_at = ?4 \
                 WHERE id = ?1",
                params![id, sites.join(","), occurrence_count + occurrence_delta, now],
            )?;
        }
        None => {
            conn.execute(
                "INSERT INTO building_listing_names \
                    (building_id, normalized_name, canonical_name, source_sites, occurrence_count, first_seen_at, last_seen_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![building_id, normalized_name, canonical_name, source_site, occurrence_delta, now],
            )?;
        }
    }
    Ok(())
}

/// Building-name vote input rows: `(listing_building_name, source_site,
/// count)` grouped across all listings attached to the building's
/// properties (spec §4.3).
pub fn name_vote_candidates(conn: &Connection, building_id: i64) -> Result<Vec<(String, String, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT l.listing_building_name, l.source_site, COUNT(*) \
         FROM listings l JOIN master_properties p ON p.id = l.master_property_id \
         WHERE p.building_id = ?1 AND l.is_active = 1 \
         GROUP BY l.listing_building_name, l.source_site",
    )?;
    let rows = stmt.query_map(params![building_id], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

/// Looks up a building by a source's stable external id (SPEC_FULL §B),
/// short-circuiting name/address matching when a source provides one.
pub fn find_by_external_id(conn: &Connection, source_site: &str, external_id: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT building_id FROM building_external_ids WHERE source_site = ?1 AND external_id = ?2",
        params![source_site, external_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(Error::from)
}

/// Records the `(source_site, external_id) -> building_id` link the
/// first time a listing carrying one resolves to a building, so later
/// listings from the same source skip straight past name matching.
pub fn link_external_id(conn: &Connection, source_site: &str, external_id: &str, building_id: i64) -> Result<()> {
    let now = Utc::now().naive_utc();
    conn.execute(
        "INSERT OR IGNORE INTO building_external_ids (source_site, external_id, building_id, created_at) \
         VALUES (?1, ?2, ?3, ?4)",
        params![source_site, external_id, building_id, now],
    )?;
    Ok(())
}

#[allow(dead_code)]
pub fn touch(conn: &Connection, building_id: i64, now: NaiveDateTime) -> Result<()> {
    conn.execute(
        "UPDATE buildings SET updated_at = ?2 WHERE id = ?1",
        params![building_id, now],
    )?;
    Ok(())
}

/// Buildings with a known address but no `geocoded_at` yet, oldest
/// first. Feeds the geocoding backfill worker (spec §5).
pub fn ungeocoded(conn: &Connection, limit: i64) -> Result<Vec<Building>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM buildings \
         WHERE geocoded_at IS NULL AND address IS NOT NULL \
         ORDER BY id ASC LIMIT ?1"
    ))?;
    let rows = stmt.query_map(params![limit], row_to_building)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn set_geocoded(conn: &Connection, building_id: i64, latitude: f64, longitude: f64, at: NaiveDateTime) -> Result<()> {
    conn.execute(
        "UPDATE buildings SET latitude = ?2, longitude = ?3, geocoded_at = ?4 WHERE id = ?1",
        params![building_id, latitude, longitude, at],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::test_db;

    #[test]
    fn insert_and_find_by_canonical_name_roundtrip() {
        let db = test_db();
        db.with_conn(|conn| {
            let id = insert(conn, "シロカネザスカイ", "シロカネザスカイ", true)?;
            let found = find_by_canonical_name(conn, "シロカネザスカイ", None)?;
            assert_eq!(found.len(), 1);
            assert_eq!(found[0].id, id);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn alias_upsert_accumulates_source_sites() {
        let db = test_db();
        db.with_conn(|conn| {
            let id = insert(conn, "X", "X", true)?;
            upsert_listing_name(conn, id, "X", "X", "suumo", 1)?;
            upsert_listing_name(conn, id, "X", "X", "homes", 2)?;
            let (sites, count): (String, i64) = conn.query_row(
                "SELECT source_sites, occurrence_count FROM building_listing_names WHERE building_id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            assert!(sites.contains("suumo") && sites.contains("homes"));
            assert_eq!(count, 3);
            Ok(())
        })
        .unwrap();
    }
}
