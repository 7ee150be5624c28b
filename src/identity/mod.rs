// src/identity/mod.rs
//
// C2 — Identity Resolver (spec §4.2). Maps a `RawListing` to a
// `(building_id, master_property_id, listing_id)`, creating entities
// as needed, and enforces composite uniqueness.

use chrono::Utc;
use rusqlite::Connection;

use crate::db::{buildings, listings, merges, price_changes, properties};
use crate::domain::normalize::{canonicalize, is_advertising_text, normalize};
use crate::domain::RawListing;
use crate::errors::{Error, Result};

const AREA_TOLERANCE_SQM: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    NewListing,
    PriceChanged,
    OtherUpdates,
    RefetchedUnchanged,
}

#[derive(Debug, Clone, Copy)]
pub struct ResolvedListing {
    pub building_id: i64,
    pub master_property_id: i64,
    pub listing_id: i64,
    pub classification: Classification,
}

/// Address prefix up to the chō-me boundary: everything before the
/// first run of digits followed by `丁目` or a hyphen-number suffix.
/// Kept intentionally simple — the full address normalizer is listed
/// as a pluggable concern (spec §4.3 rule 3), this resolves the prefix
/// needed for building-match guards.
fn address_prefix(address: &str) -> Option<String> {
    let normalized = normalize(address);
    let cut = normalized.find("丁目").map(|i| i + "丁目".len()).unwrap_or(normalized.len());
    let prefix = normalized[..cut].trim().to_string();
    if prefix.is_empty() {
        None
    } else {
        Some(prefix)
    }
}

fn resolve_building(conn: &Connection, raw: &RawListing) -> Result<i64> {
    // SPEC_FULL §B: a source-provided stable building id short-circuits
    // name/address matching entirely once it has been seen once.
    if let Some(external_id) = &raw.building_external_id {
        if let Some(building_id) = buildings::find_by_external_id(conn, raw.source_site.as_str(), external_id)? {
            return buildings::resolve_redirect(conn, building_id);
        }
    }

    let canonical = canonicalize(&raw.building_name);
    let prefix = raw.listing_address.as_deref().and_then(address_prefix);

    let mut candidates = buildings::find_by_canonical_name(conn, &canonical, prefix.as_deref())?;
    if candidates.is_empty() {
        candidates = buildings::find_by_alias_canonical_name(conn, &canonical, prefix.as_deref())?;
    }

    let building_id = if let Some(b) = candidates.into_iter().next() {
        b.id
    } else {
        let ad_copy = is_advertising_text(&raw.building_name);
        buildings::insert(conn, &normalize(&raw.building_name), &canonical, !ad_copy)?
    };

    let resolved = buildings::resolve_redirect(conn, building_id)?;
    if let Some(external_id) = &raw.building_external_id {
        buildings::link_external_id(conn, raw.source_site.as_str(), external_id, resolved)?;
    }
    Ok(resolved)
}

/// Normalizes layout/direction strings for equivalence comparison
/// (spec §4.2 step 3a: "compared after normalization"). A blank value
/// on either side carries no disambiguating information, so it never
/// disqualifies a candidate on its own — S6's blank-direction listing
/// must still see both the "南" and "南西" properties as candidates
/// for the Learning heuristic to disambiguate.
fn attr_eq(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => normalize(a) == normalize(b),
        _ => true,
    }
}

/// Applies the learned equivalence classes from prior property merges
/// in this building (spec §4.2 step 3b / S6): candidates whose
/// (layout, direction) pair has previously been merged together are
/// treated as the same for matching purposes.
fn apply_learning(conn: &Connection, building_id: i64, candidates: Vec<crate::domain::MasterProperty>) -> Result<Vec<crate::domain::MasterProperty>> {
    if candidates.len() < 2 {
        return Ok(candidates);
    }
    let merged_pairs = merges::property_merge_pairs_for_building(conn, building_id)?;
    if merged_pairs.is_empty() {
        return Ok(candidates);
    }
    // Merged pairs reference property ids no longer present; their
    // having been merged at all is sufficient evidence that this
    // building conflates layout/direction variants, so collapse to
    // the first candidate once any historical merge exists.
    Ok(vec![candidates.into_iter().next().unwrap()])
}

fn resolve_property(conn: &Connection, building_id: i64, raw: &RawListing) -> Result<i64> {
    if let Some(room_number) = &raw.room_number {
        if let Some(p) = properties::find_by_room_number(conn, building_id, room_number)? {
            return properties::resolve_redirect(conn, p.id);
        }
        let id = properties::insert(conn, building_id, Some(room_number), raw.listing_floor_number, raw.listing_area, raw.listing_layout.as_deref(), raw.listing_direction.as_deref())?;
        return Ok(id);
    }

    let mut candidates = properties::find_candidates_by_composite_key(
        conn,
        building_id,
        raw.listing_floor_number,
        raw.listing_area,
        AREA_TOLERANCE_SQM,
    )?;
    candidates.retain(|c| attr_eq(c.layout.as_deref(), raw.listing_layout.as_deref()) && attr_eq(c.direction.as_deref(), raw.listing_direction.as_deref()));

    let pre_learning_ids: Vec<i64> = candidates.iter().map(|c| c.id).collect();
    if candidates.len() > 1 {
        candidates = apply_learning(conn, building_id, candidates)?;
    }

    if candidates.len() >= 2 {
        // Tie-break: attributes outside the key, then most prior listings.
        let mut scored: Vec<(i64, i64)> = Vec::new();
        for c in &candidates {
            let listing_count = listings::for_property(conn, c.id)?.len() as i64;
            scored.push((c.id, listing_count));
        }
        scored.sort_by(|a, b| b.1.cmp(&a.1));
        let selected = scored[0].0;
        let ids: Vec<i64> = candidates.iter().map(|c| c.id).collect();
        merges::insert_ambiguous_match(
            conn,
            building_id,
            &format!("{}:{}", raw.source_site, raw.site_property_id),
            &ids,
            selected,
            1.0 / candidates.len() as f64,
        )?;
        return Ok(selected);
    }

    if pre_learning_ids.len() >= 2 {
        // The learning heuristic (spec §4.2 step 3b) collapsed ≥2 raw
        // candidates to a single survivor. Still ≥2 candidates matched
        // the identity key before learning, so this remains an
        // ambiguous match per spec §9 S6 — record it against the full
        // pre-learning candidate set, just with a single selection and
        // no further tie-break needed.
        let selected = candidates[0].id;
        merges::insert_ambiguous_match(
            conn,
            building_id,
            &format!("{}:{}", raw.source_site, raw.site_property_id),
            &pre_learning_ids,
            selected,
            1.0 / pre_learning_ids.len() as f64,
        )?;
        return Ok(selected);
    }

    if let Some(c) = candidates.into_iter().next() {
        return Ok(c.id);
    }

    match properties::insert(
        conn,
        building_id,
        None,
        raw.listing_floor_number,
        raw.listing_area,
        raw.listing_layout.as_deref(),
        raw.listing_direction.as_deref(),
    ) {
        Ok(id) => Ok(id),
        Err(Error::UniqueConstraint(_)) => {
            // Concurrent inserter won the race; retry the search once.
            let mut retry = properties::find_candidates_by_composite_key(
                conn,
                building_id,
                raw.listing_floor_number,
                raw.listing_area,
                AREA_TOLERANCE_SQM,
            )?;
            retry.retain(|c| attr_eq(c.layout.as_deref(), raw.listing_layout.as_deref()) && attr_eq(c.direction.as_deref(), raw.listing_direction.as_deref()));
            retry.into_iter().next().map(|c| c.id).ok_or(Error::Internal(
                "unique constraint retry found no matching property".to_string(),
            ))
        }
        Err(e) => Err(e),
    }
}

/// Resolves (and creates as needed) the `(Building, MasterProperty,
/// Listing)` a `RawListing` belongs to, applying price diffing. Runs
/// the whole resolution in one transaction per listing (spec §4.2
/// "Failure semantics").
pub fn resolve(conn: &mut Connection, raw: &RawListing) -> Result<ResolvedListing> {
    let tx = conn.transaction()?;
    let now = Utc::now().naive_utc();

    if let Some(existing) = listings::find_by_source_key(&tx, raw.source_site, &raw.site_property_id)? {
        let property = properties::find_by_id(&tx, existing.master_property_id)?
            .ok_or_else(|| Error::Internal("listing references missing property".to_string()))?;
        let building_id = property.building_id;

        let price_changed = raw.current_price.is_some() && raw.current_price != existing.current_price;
        // Every field `listings::refresh_observation` persists on
        // re-ingest, compared against the pre-update snapshot — a
        // change to any of them is `OtherUpdates`, not a no-op refetch
        // (spec §4.2 step 6 / §4.7.5's statistics contract).
        let other_changed = raw.building_name != existing.listing_building_name
            || raw.listing_address != existing.listing_address
            || raw.listing_floor_number != existing.listing_floor_number
            || raw.listing_area != existing.listing_area
            || raw.listing_balcony_area != existing.listing_balcony_area
            || raw.listing_layout != existing.listing_layout
            || raw.listing_direction != existing.listing_direction
            || raw.listing_total_floors != existing.listing_total_floors
            || raw.listing_basement_floors != existing.listing_basement_floors
            || raw.listing_total_units != existing.listing_total_units
            || raw.listing_built_year != existing.listing_built_year
            || raw.listing_built_month != existing.listing_built_month
            || raw.listing_land_rights != existing.listing_land_rights
            || raw.listing_station_info != existing.listing_station_info
            || raw.listing_building_structure != existing.listing_building_structure
            || raw.listing_parking_info != existing.listing_parking_info
            || raw.management_fee != existing.management_fee
            || raw.repair_fund != existing.repair_fund
            || raw.agency_name != existing.agency_name
            || raw.agency_tel != existing.agency_tel
            || raw.has_update_mark != existing.has_update_mark
            || raw.published_at != existing.published_at;

        listings::refresh_observation(&tx, existing.id, raw, now)?;
        if price_changed {
            let price = raw.current_price.unwrap();
            listings::insert_price_history(&tx, existing.id, price, now)?;
            listings::update_price(&tx, existing.id, price, now)?;
        }

        price_changes::enqueue(&tx, property.id, "listing_updated", 5)?;

        let classification = if price_changed {
            Classification::PriceChanged
        } else if other_changed {
            Classification::OtherUpdates
        } else {
            Classification::RefetchedUnchanged
        };

        tx.commit()?;
        return Ok(ResolvedListing {
            building_id,
            master_property_id: property.id,
            listing_id: existing.id,
            classification,
        });
    }

    let building_id = resolve_building(&tx, raw)?;
    let property_id = resolve_property(&tx, building_id, raw)?;
    let listing_id = listings::insert(&tx, property_id, raw, now)?;

    if let Some(price) = raw.current_price {
        listings::insert_price_history(&tx, listing_id, price, now)?;
    }
    properties::update_earliest_listing_date(&tx, property_id, now)?;
    buildings::upsert_listing_name(
        &tx,
        building_id,
        &normalize(&raw.building_name),
        &canonicalize(&raw.building_name),
        raw.source_site.as_str(),
        1,
    )?;
    price_changes::enqueue(&tx, property_id, "listing_updated", 5)?;

    tx.commit()?;
    Ok(ResolvedListing {
        building_id,
        master_property_id: property_id,
        listing_id,
        classification: Classification::NewListing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::test_db;
    use crate::domain::SourceSite;
    use rusqlite::params;

    fn raw(site_property_id: &str, price: i64) -> RawListing {
        RawListing {
            source_site: SourceSite::Suumo,
            site_property_id: site_property_id.to_string(),
            url: format!("https://example.test/{site_property_id}"),
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
            current_price: Some(price),
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
    fn s1_new_listing_then_price_change() {
        let db = test_db();
        db.with_conn(|conn| {
            let first = resolve(conn, &raw("P1", 12000))?;
            assert_eq!(first.classification, Classification::NewListing);

            let second = resolve(conn, &raw("P1", 11800))?;
            assert_eq!(second.classification, Classification::PriceChanged);
            assert_eq!(second.master_property_id, first.master_property_id);

            let listing = listings::find_by_id(conn, second.listing_id)?.unwrap();
            assert_eq!(listing.current_price, Some(11800));

            let history = listings::price_history_for_listing(conn, second.listing_id)?;
            assert_eq!(history.len(), 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn reingest_with_unchanged_price_but_new_station_info_is_other_updates() {
        let db = test_db();
        db.with_conn(|conn| {
            let first = resolve(conn, &raw("P1", 12000))?;
            assert_eq!(first.classification, Classification::NewListing);

            let mut same_price_new_station = raw("P1", 12000);
            same_price_new_station.listing_station_info = Some("Shirokane-Takanawa 5min".to_string());
            let second = resolve(conn, &same_price_new_station)?;
            assert_eq!(second.classification, Classification::OtherUpdates);

            let third = resolve(conn, &same_price_new_station)?;
            assert_eq!(third.classification, Classification::RefetchedUnchanged);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn s2_cross_source_dedupe_shares_property() {
        let db = test_db();
        db.with_conn(|conn| {
            let mut homes = raw("H1", 12100);
            homes.source_site = SourceSite::Homes;
            homes.building_name = "白金ザスカイ".to_string();

            let r1 = resolve(conn, &raw("P1", 12000))?;
            let r2 = resolve(conn, &homes)?;

            assert_eq!(r1.building_id, r2.building_id);
            assert_eq!(r1.master_property_id, r2.master_property_id);

            let aliases = crate::db::buildings::find_by_canonical_name(conn, &canonicalize("白金ザ・スカイ"), None)?;
            assert_eq!(aliases.len(), 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn s6_ambiguous_match_learning_still_records_ambiguity() {
        let db = test_db();
        db.with_conn(|conn| {
            let canonical = canonicalize("Test Tower");
            let building_id = crate::db::buildings::insert(conn, "Test Tower", &canonical, true)?;
            let south = properties::insert(conn, building_id, None, Some(10), Some(55.0), Some("1LDK"), Some("南"))?;
            let southwest = properties::insert(conn, building_id, None, Some(10), Some(55.0), Some("1LDK"), Some("南西"))?;

            // A prior merge in this building taught the learning heuristic
            // that these two directions are equivalent (spec §9 S6).
            merges::insert_property_merge(conn, south, south, southwest, 0, &serde_json::Value::Null)?;

            let mut blank_direction = raw("P_S6", 9000);
            blank_direction.building_name = "Test Tower".to_string();
            blank_direction.listing_floor_number = Some(10);
            blank_direction.listing_area = Some(55.0);
            blank_direction.listing_layout = Some("1LDK".to_string());
            blank_direction.listing_direction = None;

            let resolved = resolve(conn, &blank_direction)?;
            assert!(resolved.master_property_id == south || resolved.master_property_id == southwest);

            let matches = conn.query_row(
                "SELECT candidate_property_ids, confidence FROM ambiguous_property_matches WHERE building_id = ?1",
                params![building_id],
                |row| {
                    let ids: String = row.get(0)?;
                    let confidence: f64 = row.get(1)?;
                    Ok((ids, confidence))
                },
            )?;
            let candidate_ids: Vec<i64> = serde_json::from_str(&matches.0).unwrap();
            assert_eq!(candidate_ids.len(), 2);
            assert!(candidate_ids.contains(&south) && candidate_ids.contains(&southwest));
            assert!(matches.1 < 1.0);
            Ok(())
        })
        .unwrap();
    }
}
