// src/db/merges.rs
//
// Persistence for the merge/revert audit trail, exclusions, and
// ambiguous-match records (C6, spec §3/§4.6).

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::domain::merge::{BuildingMergeHistory, MergeExclusion, PropertyMergeHistory};
use crate::errors::{Error, Result};

pub fn insert_building_merge(
    conn: &Connection,
    direct_primary_building_id: i64,
    final_primary_building_id: i64,
    merged_building_id: i64,
    merge_depth: i64,
    merge_details: &Value,
) -> Result<i64> {
    let now = Utc::now().naive_utc();
    conn.execute(
        "INSERT INTO building_merge_history \
            (direct_primary_building_id, final_primary_building_id, merged_building_id, merge_depth, merge_details, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            direct_primary_building_id,
            final_primary_building_id,
            merged_building_id,
            merge_depth,
            merge_details.to_string(),
            now
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn row_to_building_merge(row: &rusqlite::Row) -> rusqlite::Result<BuildingMergeHistory> {
    let details_raw: String = row.get(5)?;
    Ok(BuildingMergeHistory {
        id: row.get(0)?,
        merged_building_id: row.get(1)?,
        direct_primary_building_id: row.get(2)?,
        final_primary_building_id: row.get(3)?,
        merge_depth: row.get(4)?,
        merge_details: serde_json::from_str(&details_raw).unwrap_or(Value::Null),
        merged_at: row.get(6)?,
    })
}

pub fn building_merge_by_id(conn: &Connection, id: i64) -> Result<Option<BuildingMergeHistory>> {
    conn.query_row(
        "SELECT id, merged_building_id, direct_primary_building_id, final_primary_building_id, \
                merge_depth, merge_details, created_at \
         FROM building_merge_history WHERE id = ?1",
        params![id],
        row_to_building_merge,
    )
    .optional()
    .map_err(Error::from)
}

/// Rows whose chain currently ends at `secondary`, redirected to
/// `primary` with `merge_depth` bumped (spec §4.6.1 step 2).
pub fn redirect_building_chain(conn: &Connection, secondary: i64, primary: i64) -> Result<()> {
    conn.execute(
        "UPDATE building_merge_history SET final_primary_building_id = ?2, merge_depth = merge_depth + 1 \
         WHERE final_primary_building_id = ?1",
        params![secondary, primary],
    )?;
    Ok(())
}

pub fn delete_building_merge(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM building_merge_history WHERE id = ?1", params![id])?;
    Ok(())
}

/// Rewrites rows whose chain passed through the building being
/// reverted (spec §4.6.1 revert: "rewrite dependent BuildingMergeHistory
/// rows whose final_primary was the primary"). A row's
/// `direct_primary_building_id` never changes after it's written, so
/// rows anchored directly at `reverted_merged_id` are exactly the ones
/// whose `final_primary_building_id` was carried through the merge now
/// being undone; they're repointed at `restored_id` with one fewer hop.
pub fn rewrite_building_dependents_on_revert(conn: &Connection, reverted_merged_id: i64, restored_id: i64) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE building_merge_history SET final_primary_building_id = ?2, merge_depth = merge_depth - 1 \
         WHERE direct_primary_building_id = ?1",
        params![reverted_merged_id, restored_id],
    )?)
}

pub fn insert_property_merge(
    conn: &Connection,
    direct_primary_property_id: i64,
    final_primary_property_id: i64,
    merged_property_id: i64,
    merge_depth: i64,
    merge_details: &Value,
) -> Result<i64> {
    let now = Utc::now().naive_utc();
    conn.execute(
        "INSERT INTO property_merge_history \
            (direct_primary_property_id, final_primary_property_id, merged_property_id, merge_depth, merge_details, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            direct_primary_property_id,
            final_primary_property_id,
            merged_property_id,
            merge_depth,
            merge_details.to_string(),
            now
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn row_to_property_merge(row: &rusqlite::Row) -> rusqlite::Result<PropertyMergeHistory> {
    let details_raw: String = row.get(5)?;
    Ok(PropertyMergeHistory {
        id: row.get(0)?,
        merged_property_id: row.get(1)?,
        direct_primary_property_id: row.get(2)?,
        final_primary_property_id: row.get(3)?,
        merge_depth: row.get(4)?,
        merge_details: serde_json::from_str(&details_raw).unwrap_or(Value::Null),
        merged_at: row.get(6)?,
    })
}

pub fn property_merge_by_id(conn: &Connection, id: i64) -> Result<Option<PropertyMergeHistory>> {
    conn.query_row(
        "SELECT id, merged_property_id, direct_primary_property_id, final_primary_property_id, \
                merge_depth, merge_details, created_at \
         FROM property_merge_history WHERE id = ?1",
        params![id],
        row_to_property_merge,
    )
    .optional()
    .map_err(Error::from)
}

pub fn redirect_property_chain(conn: &Connection, secondary: i64, primary: i64) -> Result<()> {
    conn.execute(
        "UPDATE property_merge_history SET final_primary_property_id = ?2, merge_depth = merge_depth + 1 \
         WHERE final_primary_property_id = ?1",
        params![secondary, primary],
    )?;
    Ok(())
}

pub fn delete_property_merge(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM property_merge_history WHERE id = ?1", params![id])?;
    Ok(())
}

/// Property-merge analogue of `rewrite_building_dependents_on_revert`
/// (spec §4.6.2 revert: "rewrite dependent histories").
pub fn rewrite_property_dependents_on_revert(conn: &Connection, reverted_merged_id: i64, restored_id: i64) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE property_merge_history SET final_primary_property_id = ?2, merge_depth = merge_depth - 1 \
         WHERE direct_primary_property_id = ?1",
        params![reverted_merged_id, restored_id],
    )?)
}

/// Prior merges in this building, exposed so C2 can learn
/// layout/direction equivalence classes (spec §4.2 step 3b / §9 S6).
pub fn property_merge_pairs_for_building(conn: &Connection, building_id: i64) -> Result<Vec<(i64, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT pmh.direct_primary_property_id, pmh.merged_property_id \
         FROM property_merge_history pmh \
         JOIN master_properties p ON p.id = pmh.direct_primary_property_id \
         WHERE p.building_id = ?1",
    )?;
    let rows = stmt.query_map(params![building_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn insert_building_exclusion(conn: &Connection, exclusion: MergeExclusion) -> Result<()> {
    let now = Utc::now().naive_utc();
    conn.execute(
        "INSERT OR IGNORE INTO building_merge_exclusions (id1, id2, created_at) VALUES (?1, ?2, ?3)",
        params![exclusion.id1, exclusion.id2, now],
    )?;
    Ok(())
}

pub fn is_building_excluded(conn: &Connection, a: i64, b: i64) -> Result<bool> {
    let exclusion = MergeExclusion::new(a, b);
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM building_merge_exclusions WHERE id1 = ?1 AND id2 = ?2",
        params![exclusion.id1, exclusion.id2],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn delete_building_exclusions_involving(conn: &Connection, id: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM building_merge_exclusions WHERE id1 = ?1 OR id2 = ?1",
        params![id],
    )?;
    Ok(())
}

pub fn insert_property_exclusion(conn: &Connection, exclusion: MergeExclusion) -> Result<()> {
    let now = Utc::now().naive_utc();
    conn.execute(
        "INSERT OR IGNORE INTO property_merge_exclusions (id1, id2, created_at) VALUES (?1, ?2, ?3)",
        params![exclusion.id1, exclusion.id2, now],
    )?;
    Ok(())
}

pub fn insert_ambiguous_match(
    conn: &Connection,
    building_id: i64,
    listing_key: &str,
    candidate_property_ids: &[i64],
    selected_property_id: i64,
    confidence: f64,
) -> Result<i64> {
    let now = Utc::now().naive_utc();
    let candidates_json = serde_json::to_string(candidate_property_ids).unwrap_or_default();
    conn.execute(
        "INSERT INTO ambiguous_property_matches \
            (building_id, listing_key, candidate_property_ids, selected_property_id, confidence, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![building_id, listing_key, candidates_json, selected_property_id, confidence, now],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Rewrites references from `secondary` to `primary` after a property
/// merge (spec §4.6.2 step 4).
pub fn reassign_ambiguous_match_references(conn: &Connection, secondary: i64, primary: i64) -> Result<()> {
    conn.execute(
        "UPDATE ambiguous_property_matches SET selected_property_id = ?2 WHERE selected_property_id = ?1",
        params![secondary, primary],
    )?;
    let mut stmt = conn.prepare("SELECT id, candidate_property_ids FROM ambiguous_property_matches")?;
    let rows: Vec<(i64, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for (id, raw) in rows {
        let mut ids: Vec<i64> = serde_json::from_str(&raw).unwrap_or_default();
        let mut changed = false;
        for v in ids.iter_mut() {
            if *v == secondary {
                *v = primary;
                changed = true;
            }
        }
        if changed {
            let new_raw = serde_json::to_string(&ids).unwrap_or_default();
            conn.execute(
                "UPDATE ambiguous_property_matches SET candidate_property_ids = ?2 WHERE id = ?1",
                params![id, new_raw],
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::test_db;

    #[test]
    fn exclusion_roundtrip_is_order_independent() {
        let db = test_db();
        db.with_conn(|conn| {
            insert_building_exclusion(conn, MergeExclusion::new(5, 2))?;
            assert!(is_building_excluded(conn, 2, 5)?);
            assert!(is_building_excluded(conn, 5, 2)?);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn redirect_chain_bumps_depth() {
        let db = test_db();
        db.with_conn(|conn| {
            let bid1 = crate::db::buildings::insert(conn, "A", "A", true)?;
            let bid2 = crate::db::buildings::insert(conn, "B", "B", true)?;
            let bid3 = crate::db::buildings::insert(conn, "C", "C", true)?;
            insert_building_merge(conn, bid1, bid2, bid2, 0, &Value::Null)?;
            redirect_building_chain(conn, bid2, bid3)?;
            let row = building_merge_by_id(conn, 1)?.unwrap();
            assert_eq!(row.final_primary_building_id, bid3);
            assert_eq!(row.merge_depth, 1);
            Ok(())
        })
        .unwrap();
    }
}
