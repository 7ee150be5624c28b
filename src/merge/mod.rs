// src/merge/mod.rs
//
// C6 — Merge/Split Controller (spec §4.6). Performs and reverts
// building/property merges through the hybrid redirect-pointer scheme,
// and proposes duplicate-building candidates by ward-bucketed name
// similarity.

use std::collections::HashMap;

use rusqlite::Connection;
use serde_json::json;

use crate::db::{buildings, listings, merges, price_changes, properties};
use crate::domain::normalize::canonicalize;
use crate::domain::Building;
use crate::errors::{Error, Result};
use crate::voting;

/// Finds the primary-building property, if any, whose composite key
/// would collide with `p` once `p` is reassigned into `primary_id`
/// (spec §4.6.1 step 1).
fn colliding_property(conn: &Connection, primary_id: i64, p: &crate::domain::MasterProperty) -> Result<Option<i64>> {
    if let Some(room_number) = &p.room_number {
        return Ok(properties::find_by_room_number(conn, primary_id, room_number)?.map(|c| c.id));
    }
    let candidates = properties::find_candidates_by_composite_key(conn, primary_id, p.floor_number, p.area, 0.0)?;
    Ok(candidates
        .into_iter()
        .find(|c| c.room_number.is_none() && c.layout.as_deref() == p.layout.as_deref() && c.direction.as_deref() == p.direction.as_deref())
        .map(|c| c.id))
}

/// Merges `secondary` into `primary` (spec §4.6.1):
/// 1. reassign every property from `secondary` to `primary`, first
///    merging away (§4.6.2) any property that would collide with an
///    existing primary property under the composite key,
/// 2. redirect any merge chain that currently ends at `secondary`,
/// 3. record the merge row,
/// 4. drop the now-empty secondary building,
/// 5. refresh the primary's voted attributes,
/// 6. enqueue price-change recomputation for every moved property.
pub fn merge_buildings(conn: &Connection, primary_id: i64, secondary_id: i64) -> Result<i64> {
    if primary_id == secondary_id {
        return Err(Error::BadInput("cannot merge a building into itself".to_string()));
    }
    buildings::find_by_id(conn, primary_id)?.ok_or_else(|| Error::NotFound(format!("building {primary_id}")))?;
    let secondary = buildings::find_by_id(conn, secondary_id)?
        .ok_or_else(|| Error::NotFound(format!("building {secondary_id}")))?;

    let moved_properties = properties::properties_for_building(conn, secondary_id)?;
    // Only properties reassigned directly (not merged away into a
    // colliding primary property) are recoverable on revert — a merged
    // property no longer exists under its own id (spec §4.6.1 step 4:
    // "moved_property_ids").
    let mut moved_property_ids = Vec::new();
    for p in &moved_properties {
        match colliding_property(conn, primary_id, p)? {
            Some(collides_with) => {
                merge_properties_unchecked(conn, collides_with, p.id)?;
            }
            None => {
                properties::reassign_building(conn, p.id, primary_id)?;
                moved_property_ids.push(p.id);
            }
        }
    }

    merges::redirect_building_chain(conn, secondary_id, primary_id)?;

    let merge_details = json!({
        "normalized_name": secondary.normalized_name,
        "canonical_name": secondary.canonical_name,
        "address": secondary.address,
        "normalized_address": secondary.normalized_address,
        "total_floors": secondary.total_floors,
        "basement_floors": secondary.basement_floors,
        "total_units": secondary.total_units,
        "built_year": secondary.built_year,
        "built_month": secondary.built_month,
        "construction_type": secondary.construction_type,
        "land_rights": secondary.land_rights,
        "station_info": secondary.station_info,
        "is_valid_name": secondary.is_valid_name,
        "moved_property_ids": moved_property_ids,
    });
    let merge_id = merges::insert_building_merge(conn, primary_id, primary_id, secondary_id, 0, &merge_details)?;

    buildings::delete(conn, secondary_id)?;

    voting::refresh_building(conn, primary_id)?;
    for p in &moved_properties {
        price_changes::enqueue(conn, p.id, "merge", 2)?;
    }

    Ok(merge_id)
}

pub struct BuildingRevertReport {
    pub restored_building_id: i64,
    pub properties_moved_back: usize,
    pub properties_skipped: usize,
}

/// Reverts a building merge (spec §4.6.1 revert): recreates the
/// secondary building from the stored attribute snapshot, moves back
/// every property this merge actually reassigned (skipping ones since
/// consumed by a property merge — reported, not failed), and records a
/// permanent exclusion so the duplicate detector never proposes the
/// same pair again.
pub fn revert_building_merge(conn: &Connection, merge_id: i64) -> Result<BuildingRevertReport> {
    let record = merges::building_merge_by_id(conn, merge_id)?
        .ok_or_else(|| Error::NotFound(format!("building merge {merge_id}")))?;
    if record.merge_depth != 0 {
        return Err(Error::Precondition(
            "can only revert a merge at the head of its chain".to_string(),
        ));
    }

    let snapshot = &record.merge_details;
    let str_field = |key: &str| snapshot.get(key).and_then(|v| v.as_str()).map(|s| s.to_string());
    let i64_field = |key: &str| snapshot.get(key).and_then(|v| v.as_i64());
    let normalized_name = str_field("normalized_name").unwrap_or_else(|| "unknown".to_string());
    let canonical_name = str_field("canonical_name").unwrap_or_else(|| canonicalize(&normalized_name));
    let is_valid_name = snapshot.get("is_valid_name").and_then(|v| v.as_bool()).unwrap_or(true);

    let new_secondary_id = buildings::insert_snapshot(
        conn,
        &normalized_name,
        &canonical_name,
        str_field("address").as_deref(),
        str_field("normalized_address").as_deref(),
        i64_field("total_floors"),
        i64_field("basement_floors"),
        i64_field("total_units"),
        i64_field("built_year"),
        i64_field("built_month"),
        str_field("construction_type").as_deref(),
        str_field("land_rights").as_deref(),
        str_field("station_info").as_deref(),
        is_valid_name,
    )?;

    let moved_property_ids: Vec<i64> = snapshot
        .get("moved_property_ids")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_i64()).collect())
        .unwrap_or_default();

    let mut moved_back = 0;
    let mut skipped = 0;
    for property_id in moved_property_ids {
        if properties::find_by_id(conn, property_id)?.is_some() {
            properties::reassign_building(conn, property_id, new_secondary_id)?;
            voting::refresh_property(conn, property_id)?;
            moved_back += 1;
        } else {
            // Since deleted by a property merge that consumed it into a
            // primary-building sibling — left in place (spec §4.6.1 revert).
            skipped += 1;
        }
    }

    merges::insert_building_exclusion(conn, crate::domain::MergeExclusion::new(record.direct_primary_building_id, new_secondary_id))?;
    merges::rewrite_building_dependents_on_revert(conn, record.merged_building_id, new_secondary_id)?;
    merges::delete_building_merge(conn, merge_id)?;
    voting::refresh_building(conn, record.direct_primary_building_id)?;
    voting::refresh_building(conn, new_secondary_id)?;
    Ok(BuildingRevertReport {
        restored_building_id: new_secondary_id,
        properties_moved_back: moved_back,
        properties_skipped: skipped,
    })
}

/// Merges a property into another within the same building (spec
/// §4.6.2): reassigns listings, reparents price history, redirects the
/// chain, records the merge, deletes the secondary property, then
/// refreshes and recomputes prices for the survivor.
pub fn merge_properties(conn: &Connection, primary_id: i64, secondary_id: i64) -> Result<i64> {
    let primary = properties::find_by_id(conn, primary_id)?
        .ok_or_else(|| Error::NotFound(format!("property {primary_id}")))?;
    let secondary = properties::find_by_id(conn, secondary_id)?
        .ok_or_else(|| Error::NotFound(format!("property {secondary_id}")))?;
    if primary.building_id != secondary.building_id {
        return Err(Error::Precondition(
            "properties must belong to the same building to merge".to_string(),
        ));
    }
    merge_properties_unchecked(conn, primary_id, secondary_id)
}

/// Core of a property merge, without the same-building precondition.
/// `merge_buildings` calls this directly for a property collision it
/// discovers mid-reassignment: at that point the two properties are
/// about to share a building by virtue of the very merge in progress,
/// so the ordinary precondition doesn't apply (spec §4.6.1 step 1).
fn merge_properties_unchecked(conn: &Connection, primary_id: i64, secondary_id: i64) -> Result<i64> {
    if primary_id == secondary_id {
        return Err(Error::BadInput("cannot merge a property into itself".to_string()));
    }
    let primary = properties::find_by_id(conn, primary_id)?
        .ok_or_else(|| Error::NotFound(format!("property {primary_id}")))?;
    let secondary = properties::find_by_id(conn, secondary_id)?
        .ok_or_else(|| Error::NotFound(format!("property {secondary_id}")))?;

    // Spec §4.6.2 step 1: a secondary listing whose (source_site,
    // site_property_id) the primary already carries is a duplicate, not
    // a move — keep whichever copy was scraped more recently, folding
    // the other's price history into the survivor first.
    let primary_listings = listings::for_property(conn, primary_id)?;
    let secondary_listings = listings::for_property(conn, secondary_id)?;
    let mut moved_listing_ids: Vec<i64> = Vec::new();
    for l in &secondary_listings {
        match primary_listings
            .iter()
            .find(|p| p.source_site == l.source_site && p.site_property_id == l.site_property_id)
        {
            Some(existing) if l.last_scraped_at > existing.last_scraped_at => {
                listings::reparent_price_history(conn, existing.id, l.id)?;
                listings::delete(conn, existing.id)?;
                listings::reassign_property(conn, l.id, primary_id)?;
                moved_listing_ids.push(l.id);
            }
            Some(existing) => {
                listings::reparent_price_history(conn, l.id, existing.id)?;
                listings::delete(conn, l.id)?;
            }
            None => {
                listings::reassign_property(conn, l.id, primary_id)?;
                moved_listing_ids.push(l.id);
            }
        }
    }

    merges::redirect_property_chain(conn, secondary_id, primary_id)?;
    merges::reassign_ambiguous_match_references(conn, secondary_id, primary_id)?;

    let merge_details = json!({
        "primary_room": primary.room_number,
        "secondary_room": secondary.room_number,
        "moved_listing_ids": moved_listing_ids,
    });
    let merge_id = merges::insert_property_merge(conn, primary_id, primary_id, secondary_id, 0, &merge_details)?;

    properties::delete(conn, secondary_id)?;

    voting::refresh_property(conn, primary_id)?;
    price_changes::enqueue(conn, primary_id, "merge", 2)?;

    Ok(merge_id)
}

/// Reverts a property merge (spec §4.6.2 revert / §9 open question): the
/// exact listings recorded as moved off the secondary at merge time are
/// moved back. A listing that no longer points at the primary (it was
/// folded into some other property by a merge since this one) is left
/// where it is, and the caller is told how many so it can surface a
/// warning.
pub struct PropertyRevertReport {
    pub restored_property_id: i64,
    pub listings_moved_back: usize,
    pub listings_left_on_primary: usize,
}

pub fn revert_property_merge(conn: &Connection, merge_id: i64) -> Result<PropertyRevertReport> {
    let record = merges::property_merge_by_id(conn, merge_id)?
        .ok_or_else(|| Error::NotFound(format!("property merge {merge_id}")))?;
    if record.merge_depth != 0 {
        return Err(Error::Precondition(
            "can only revert a merge at the head of its chain".to_string(),
        ));
    }

    let primary = properties::find_by_id(conn, record.direct_primary_property_id)?
        .ok_or_else(|| Error::NotFound("primary property no longer exists".to_string()))?;

    let restored_id = properties::insert(
        conn,
        primary.building_id,
        record
            .merge_details
            .get("secondary_room")
            .and_then(|v| v.as_str()),
        None,
        None,
        None,
        None,
    )?;

    let moved_listing_ids: Vec<i64> = record
        .merge_details
        .get("moved_listing_ids")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_i64()).collect())
        .unwrap_or_default();

    // A listing can only be moved back if it's still on the primary —
    // a later merge or manual reassignment since this merge may have
    // moved it elsewhere, in which case it's left alone (spec §9 open
    // question) and counted as skipped.
    let mut moved_back = 0;
    let mut later_merged_count = 0;
    for id in &moved_listing_ids {
        match listings::find_by_id(conn, *id)? {
            Some(l) if l.master_property_id == primary.id => {
                listings::reassign_property(conn, l.id, restored_id)?;
                moved_back += 1;
            }
            _ => later_merged_count += 1,
        }
    }

    merges::insert_property_exclusion(conn, crate::domain::MergeExclusion::new(primary.id, restored_id))?;
    merges::rewrite_property_dependents_on_revert(conn, record.merged_property_id, restored_id)?;
    merges::delete_property_merge(conn, merge_id)?;

    voting::refresh_property(conn, primary.id)?;
    voting::refresh_property(conn, restored_id)?;
    price_changes::enqueue(conn, primary.id, "merge_revert", 2)?;
    price_changes::enqueue(conn, restored_id, "merge_revert", 2)?;

    Ok(PropertyRevertReport {
        restored_property_id: restored_id,
        listings_moved_back: moved_back,
        listings_left_on_primary: later_merged_count,
    })
}

#[derive(Debug, Clone)]
pub struct DuplicateCandidate {
    pub building_a: i64,
    pub building_b: i64,
    pub exact_name_match: bool,
    pub matched_attribute_count: u8,
}

fn canonical_bucket(building: &Building) -> String {
    building.canonical_name.chars().take(3).collect()
}

/// Address-prefix plus 2-of-3-attribute match (spec §4.6.3's second
/// emission criterion). `normalized_address` is already chō-me-stripped
/// (spec §3), so comparing it directly *is* the address-prefix match.
fn attribute_match_count(a: &Building, b: &Building) -> Option<u8> {
    let prefix_matches = matches!(
        (a.normalized_address.as_deref(), b.normalized_address.as_deref()),
        (Some(x), Some(y)) if !x.is_empty() && x == y
    );
    if !prefix_matches {
        return None;
    }
    let mut matched = 0u8;
    if a.built_year.is_some() && a.built_year == b.built_year {
        matched += 1;
    }
    if a.total_floors.is_some() && a.total_floors == b.total_floors {
        matched += 1;
    }
    if a.total_units.is_some() && a.total_units == b.total_units {
        matched += 1;
    }
    if matched >= 2 {
        Some(matched)
    } else {
        None
    }
}

/// Proposes duplicate-building candidates per spec §4.6.3: bucketed by
/// `canonical_name[:3]` so comparison is cheap, a pair is emitted when
/// the canonical names match exactly, or when their address prefixes
/// match and at least two of `{built_year, total_floors, total_units}`
/// agree. Excludes pairs already merged or explicitly excluded.
pub fn find_duplicate_candidates(conn: &Connection, all_buildings: &[Building]) -> Result<Vec<DuplicateCandidate>> {
    let mut buckets: HashMap<String, Vec<&Building>> = HashMap::new();
    for b in all_buildings {
        buckets.entry(canonical_bucket(b)).or_default().push(b);
    }

    let mut out = Vec::new();
    for bucket in buckets.values() {
        for i in 0..bucket.len() {
            for j in (i + 1)..bucket.len() {
                let a = bucket[i];
                let b = bucket[j];
                if merges::is_building_excluded(conn, a.id, b.id)? {
                    continue;
                }
                let exact_name_match = a.canonical_name == b.canonical_name;
                let matched_attribute_count = attribute_match_count(a, b).unwrap_or(0);
                if exact_name_match || matched_attribute_count >= 2 {
                    out.push(DuplicateCandidate {
                        building_a: a.id,
                        building_b: b.id,
                        exact_name_match,
                        matched_attribute_count,
                    });
                }
            }
        }
    }
    out.sort_by(|x, y| {
        y.exact_name_match
            .cmp(&x.exact_name_match)
            .then_with(|| y.matched_attribute_count.cmp(&x.matched_attribute_count))
    });
    Ok(out)
}

/// TTL-cached wrapper per spec §4.6.3 ("cache duplicate candidates for
/// 5 minutes"); the cache itself lives in C10 (`crate::cache`), this
/// just names the cache key the orchestrator/CLI should use.
pub fn duplicate_candidates_cache_key() -> &'static str {
    "duplicate_building_candidates"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::test_db;

    fn dup_raw() -> crate::domain::RawListing {
        crate::domain::RawListing {
            source_site: crate::domain::SourceSite::Suumo,
            site_property_id: "P1".to_string(),
            url: "https://example.test/p1".to_string(),
            building_name: "X".to_string(),
            building_external_id: None,
            listing_address: None,
            listing_floor_number: None,
            listing_area: None,
            listing_balcony_area: None,
            listing_layout: None,
            listing_direction: None,
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
    fn merge_buildings_moves_properties_and_deletes_secondary() {
        let db = test_db();
        db.with_conn(|conn| {
            let primary = buildings::insert(conn, "A", "A", true)?;
            let secondary = buildings::insert(conn, "B", "B", true)?;
            let pid = properties::insert(conn, secondary, None, Some(3), Some(40.0), None, None)?;

            merge_buildings(conn, primary, secondary)?;

            assert!(buildings::find_by_id(conn, secondary)?.is_none());
            let moved = properties::find_by_id(conn, pid)?.unwrap();
            assert_eq!(moved.building_id, primary);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn s3_building_merge_then_revert_restores_secondary_and_properties() {
        let db = test_db();
        db.with_conn(|conn| {
            let primary = buildings::insert(conn, "A", "A", true)?;
            let secondary = buildings::insert(conn, "B", "B", true)?;
            let pid = properties::insert(conn, secondary, None, Some(3), Some(40.0), None, None)?;

            let merge_id = merge_buildings(conn, primary, secondary)?;
            assert_eq!(properties::properties_for_building(conn, primary)?.len(), 1);

            let report = revert_building_merge(conn, merge_id)?;
            assert_eq!(report.properties_moved_back, 1);
            assert_eq!(report.properties_skipped, 0);

            let restored = buildings::find_by_id(conn, report.restored_building_id)?.unwrap();
            assert_eq!(restored.canonical_name, "B");
            let moved_back = properties::find_by_id(conn, pid)?.unwrap();
            assert_eq!(moved_back.building_id, report.restored_building_id);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn merge_buildings_collapses_colliding_properties_instead_of_erroring() {
        let db = test_db();
        db.with_conn(|conn| {
            let primary = buildings::insert(conn, "A", "A", true)?;
            let secondary = buildings::insert(conn, "B", "B", true)?;
            let primary_prop = properties::insert(conn, primary, None, Some(5), Some(60.0), Some("2LDK"), Some("S"))?;
            let secondary_prop = properties::insert(conn, secondary, None, Some(5), Some(60.0), Some("2LDK"), Some("S"))?;

            merge_buildings(conn, primary, secondary)?;

            // The colliding property was merged away, not reassigned —
            // only one survivor remains in the primary building.
            assert!(properties::find_by_id(conn, secondary_prop)?.is_none());
            let survivor = properties::find_by_id(conn, primary_prop)?.unwrap();
            assert_eq!(survivor.building_id, primary);
            assert_eq!(properties::properties_for_building(conn, primary)?.len(), 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn revert_rewrites_upstream_chain_members() {
        let db = test_db();
        db.with_conn(|conn| {
            let x = buildings::insert(conn, "X", "X", true)?;
            let y = buildings::insert(conn, "Y", "Y", true)?;
            let z = buildings::insert(conn, "Z", "Z", true)?;

            // X -> Y, then Y -> Z chains X's history through Z.
            merge_buildings(conn, y, x)?;
            let yz_merge_id = merge_buildings(conn, z, y)?;

            let x_row = merges::building_merge_by_id(conn, 1)?.unwrap();
            assert_eq!(x_row.final_primary_building_id, z);
            assert_eq!(x_row.merge_depth, 1);

            // Reverting Y -> Z must repoint X's row at restored Y, not
            // leave it dangling on Z.
            let report = revert_building_merge(conn, yz_merge_id)?;
            let restored_y = report.restored_building_id;

            let x_row_after = merges::building_merge_by_id(conn, 1)?.unwrap();
            assert_eq!(x_row_after.final_primary_building_id, restored_y);
            assert_eq!(x_row_after.merge_depth, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn merge_properties_dedupes_same_source_listing_keeping_most_recent() {
        let db = test_db();
        db.with_conn(|conn| {
            let bid = buildings::insert(conn, "X", "X", true)?;
            let primary_id = properties::insert(conn, bid, None, Some(1), Some(40.0), None, None)?;
            let secondary_id = properties::insert(conn, bid, None, Some(2), Some(41.0), None, None)?;

            let old_time = chrono::Utc::now().naive_utc() - chrono::Duration::hours(2);
            let new_time = chrono::Utc::now().naive_utc();

            let mut raw = dup_raw();
            raw.site_property_id = "DUP1".to_string();
            let primary_listing_id = listings::insert(conn, primary_id, &raw, old_time)?;
            let secondary_listing_id = listings::insert(conn, secondary_id, &raw, new_time)?;
            listings::insert_price_history(conn, primary_listing_id, 12000, old_time)?;
            listings::insert_price_history(conn, secondary_listing_id, 11800, new_time)?;

            merge_properties(conn, primary_id, secondary_id)?;

            // The older duplicate (on primary) is gone; the newer survives,
            // reparented, carrying both listings' price history.
            assert!(listings::find_by_id(conn, primary_listing_id)?.is_none());
            let survivor = listings::find_by_id(conn, secondary_listing_id)?.unwrap();
            assert_eq!(survivor.master_property_id, primary_id);
            let history = listings::price_history_for_listing(conn, secondary_listing_id)?;
            assert_eq!(history.len(), 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn merge_properties_requires_same_building() {
        let db = test_db();
        db.with_conn(|conn| {
            let b1 = buildings::insert(conn, "A", "A", true)?;
            let b2 = buildings::insert(conn, "B", "B", true)?;
            let p1 = properties::insert(conn, b1, None, Some(1), Some(40.0), None, None)?;
            let p2 = properties::insert(conn, b2, None, Some(2), Some(41.0), None, None)?;
            let result = merge_properties(conn, p1, p2);
            assert!(matches!(result, Err(Error::Precondition(_))));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn revert_property_merge_moves_back_only_the_originally_merged_listings() {
        let db = test_db();
        db.with_conn(|conn| {
            let bid = buildings::insert(conn, "X", "X", true)?;
            let primary_id = properties::insert(conn, bid, None, Some(1), Some(40.0), None, None)?;
            let secondary_id = properties::insert(conn, bid, Some("201"), Some(2), Some(41.0), None, None)?;

            let now = chrono::Utc::now().naive_utc();
            let mut already_on_primary = dup_raw();
            already_on_primary.site_property_id = "ONPRIMARY".to_string();
            let pre_existing_listing_id = listings::insert(conn, primary_id, &already_on_primary, now)?;

            let mut moved = dup_raw();
            moved.site_property_id = "MOVED".to_string();
            let moved_listing_id = listings::insert(conn, secondary_id, &moved, now)?;

            let merge_id = merge_properties(conn, primary_id, secondary_id)?;
            assert_eq!(
                listings::find_by_id(conn, moved_listing_id)?.unwrap().master_property_id,
                primary_id
            );

            let report = revert_property_merge(conn, merge_id)?;
            assert_eq!(report.listings_moved_back, 1);
            assert_eq!(report.listings_left_on_primary, 0);

            let restored = properties::find_by_id(conn, report.restored_property_id)?.unwrap();
            assert_eq!(restored.room_number.as_deref(), Some("201"));

            // The listing that originated on the secondary moves back...
            let moved_back = listings::find_by_id(conn, moved_listing_id)?.unwrap();
            assert_eq!(moved_back.master_property_id, report.restored_property_id);

            // ...but the listing that was always on the primary stays put,
            // even though an unordered `for_property` scan would have put
            // it first in line for a count-based restore.
            let stayed = listings::find_by_id(conn, pre_existing_listing_id)?.unwrap();
            assert_eq!(stayed.master_property_id, primary_id);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn revert_property_merge_skips_listings_moved_elsewhere_since() {
        let db = test_db();
        db.with_conn(|conn| {
            let bid = buildings::insert(conn, "X", "X", true)?;
            let primary_id = properties::insert(conn, bid, None, Some(1), Some(40.0), None, None)?;
            let secondary_id = properties::insert(conn, bid, None, Some(2), Some(41.0), None, None)?;
            let elsewhere_id = properties::insert(conn, bid, None, Some(3), Some(42.0), None, None)?;

            let now = chrono::Utc::now().naive_utc();
            let mut moved = dup_raw();
            moved.site_property_id = "MOVED".to_string();
            let moved_listing_id = listings::insert(conn, secondary_id, &moved, now)?;

            let merge_id = merge_properties(conn, primary_id, secondary_id)?;

            // A later, unrelated merge reassigns the listing away from the
            // primary before the first merge is reverted.
            listings::reassign_property(conn, moved_listing_id, elsewhere_id)?;

            let report = revert_property_merge(conn, merge_id)?;
            assert_eq!(report.listings_moved_back, 0);
            assert_eq!(report.listings_left_on_primary, 1);
            assert_eq!(
                listings::find_by_id(conn, moved_listing_id)?.unwrap().master_property_id,
                elsewhere_id
            );
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn duplicate_candidates_skip_excluded_pairs() {
        let db = test_db();
        db.with_conn(|conn| {
            let b1 = buildings::insert(conn, "白金タワー", "白金タワー", true)?;
            let b2 = buildings::insert(conn, "白金タワー", "白金タワー", true)?;
            let all = vec![
                buildings::find_by_id(conn, b1)?.unwrap(),
                buildings::find_by_id(conn, b2)?.unwrap(),
            ];
            let found = find_duplicate_candidates(conn, &all)?;
            assert_eq!(found.len(), 1);
            assert!(found[0].exact_name_match);

            merges::insert_building_exclusion(conn, crate::domain::MergeExclusion::new(b1, b2))?;
            let found_after = find_duplicate_candidates(conn, &all)?;
            assert!(found_after.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn duplicate_candidates_match_on_address_and_two_attributes_despite_different_names() {
        let db = test_db();
        db.with_conn(|conn| {
            // Share the first three canonical-name characters so both
            // buildings land in the same §4.6.3 bucket, but keep the
            // full canonical names different — only the address-prefix
            // plus 2-of-3-attribute branch should catch this pair.
            let b1 = buildings::insert(conn, "TOWAONE", "TOWAONE", true)?;
            let b2 = buildings::insert(conn, "TOWATWO", "TOWATWO", true)?;
            conn.execute(
                "UPDATE buildings SET normalized_address = '港区白金1', built_year = 2005, total_floors = 20 WHERE id IN (?1, ?2)",
                rusqlite::params![b1, b2],
            )?;

            let all = vec![
                buildings::find_by_id(conn, b1)?.unwrap(),
                buildings::find_by_id(conn, b2)?.unwrap(),
            ];
            let found = find_duplicate_candidates(conn, &all)?;
            assert_eq!(found.len(), 1);
            assert!(!found[0].exact_name_match);
            assert_eq!(found[0].matched_attribute_count, 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn duplicate_candidates_require_shared_canonical_bucket() {
        let db = test_db();
        db.with_conn(|conn| {
            // Identical address and attributes, but different first-3
            // canonical-name characters: spec §4.6.3 buckets by
            // `canonical_name[:3]` first, so this pair is never compared.
            let b1 = buildings::insert(conn, "AAATOWER", "AAATOWER", true)?;
            let b2 = buildings::insert(conn, "ZZZTOWER", "ZZZTOWER", true)?;
            conn.execute(
                "UPDATE buildings SET normalized_address = '港区白金1', built_year = 2005, total_floors = 20 WHERE id IN (?1, ?2)",
                rusqlite::params![b1, b2],
            )?;

            let all = vec![
                buildings::find_by_id(conn, b1)?.unwrap(),
                buildings::find_by_id(conn, b2)?.unwrap(),
            ];
            let found = find_duplicate_candidates(conn, &all)?;
            assert!(found.is_empty());
            Ok(())
        })
        .unwrap();
    }
}
