// src/voting/mod.rs
//
// C3 — Majority-Vote Updater (spec §4.3). Recomputes building and
// property attributes from their listings by weighted, source-
// prioritized voting.

use std::collections::HashMap;

use chrono::Duration;
use rusqlite::Connection;

use crate::db::{buildings, listings, properties};
use crate::domain::normalize::{canonicalize, is_advertising_text, normalize};
use crate::domain::raw_listing::PRIORITY_RANK_COUNT;
use crate::domain::{Listing, SourceSite};
use crate::errors::Result;

/// One `(value, source_site)` observation feeding a vote.
struct Ballot {
    bucket: String,
    display: String,
    weight: f64,
    site: SourceSite,
}

fn layout_bucket(s: &str) -> String {
    // "1SLDK" and "1S+LDK" collapse to the same bucket.
    normalize(s).replace('+', "")
}

fn direction_bucket(s: &str) -> String {
    let n = normalize(s);
    match n.as_str() {
        "南西" | "SW" => "SW".to_string(),
        "南東" | "SE" => "SE".to_string(),
        "北西" | "NW" => "NW".to_string(),
        "北東" | "NE" => "NE".to_string(),
        "南" | "S" => "S".to_string(),
        "北" | "N" => "N".to_string(),
        "東" | "E" => "E".to_string(),
        "西" | "W" => "W".to_string(),
        other => other.to_string(),
    }
}

fn whitespace_collapsed(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn site_weight(site: SourceSite, is_ad_copy: bool) -> f64 {
    let base = (PRIORITY_RANK_COUNT - site.priority_index() as i64 + 1) as f64;
    if is_ad_copy {
        base * 0.1
    } else {
        base
    }
}

/// Picks the winning bucket's highest-weighted original representation
/// (spec §4.3 rules 4-5). Ties broken by source-site priority.
fn tally<'a>(ballots: impl Iterator<Item = &'a Ballot>) -> Option<String> {
    let mut bucket_weight: HashMap<&str, f64> = HashMap::new();
    let ballots: Vec<&Ballot> = ballots.collect();
    for b in &ballots {
        *bucket_weight.entry(b.bucket.as_str()).or_insert(0.0) += b.weight;
    }
    let winning_bucket = bucket_weight
        .into_iter()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
        .map(|(bucket, _)| bucket.to_string())?;

    ballots
        .into_iter()
        .filter(|b| b.bucket == winning_bucket)
        .max_by(|a, b| {
            a.weight
                .partial_cmp(&b.weight)
                .unwrap()
                .then_with(|| b.site.priority_index().cmp(&a.site.priority_index()))
        })
        .map(|b| b.display.clone())
}

fn string_ballots<F>(listings: &[Listing], extract: F, bucket_fn: fn(&str) -> String) -> Vec<Ballot>
where
    F: Fn(&Listing) -> Option<&str>,
{
    listings
        .iter()
        .filter_map(|l| {
            let value = extract(l)?;
            if value.is_empty() {
                return None;
            }
            Some(Ballot {
                bucket: bucket_fn(value),
                display: value.to_string(),
                weight: site_weight(l.source_site, false),
                site: l.source_site,
            })
        })
        .collect()
}

fn numeric_ballots<T: Copy + ToString, F>(listings: &[Listing], extract: F) -> Vec<Ballot>
where
    F: Fn(&Listing) -> Option<T>,
{
    listings
        .iter()
        .filter_map(|l| {
            let value = extract(l)?;
            let display = value.to_string();
            Some(Ballot {
                bucket: display.clone(),
                display,
                weight: site_weight(l.source_site, false),
                site: l.source_site,
            })
        })
        .collect()
}

/// Source-selection rule for a property's listings (spec §4.3 rule 2).
fn select_source_listings(conn: &Connection, property_id: i64) -> Result<Vec<Listing>> {
    let all = listings::for_property(conn, property_id)?;
    let active: Vec<Listing> = all.iter().cloned().filter(|l| l.is_active).collect();
    if !active.is_empty() {
        return Ok(active);
    }
    if let Some(property) = properties::find_by_id(conn, property_id)? {
        if let Some(sold_at) = property.sold_at {
            let window_start = sold_at - Duration::days(7);
            let windowed: Vec<Listing> = all
                .iter()
                .cloned()
                .filter(|l| l.last_confirmed_at >= window_start && l.last_confirmed_at <= sold_at)
                .collect();
            if !windowed.is_empty() {
                return Ok(windowed);
            }
        }
    }
    Ok(all)
}

/// Recomputes a property's voted attributes from its listings. Returns
/// whether anything actually changed (spec invariant 5, "vote idempotence").
pub fn refresh_property(conn: &Connection, property_id: i64) -> Result<bool> {
    let current = match properties::find_by_id(conn, property_id)? {
        Some(p) => p,
        None => return Ok(false),
    };
    let source_listings = select_source_listings(conn, property_id)?;

    let floor_ballots = numeric_ballots(&source_listings, |l| l.listing_floor_number);
    let area_ballots = numeric_ballots(&source_listings, |l| l.listing_area.map(|a| (a * 100.0).round() as i64));
    let layout_ballots = string_ballots(&source_listings, |l| l.listing_layout.as_deref(), layout_bucket);
    let direction_ballots = string_ballots(&source_listings, |l| l.listing_direction.as_deref(), direction_bucket);

    let voted_floor = tally(floor_ballots.iter()).and_then(|s| s.parse::<i64>().ok());
    let voted_area = tally(area_ballots.iter())
        .and_then(|s| s.parse::<i64>().ok())
        .map(|cents| cents as f64 / 100.0);
    let voted_layout = tally(layout_ballots.iter());
    let voted_direction = tally(direction_ballots.iter());

    let key_changed = voted_floor != current.floor_number
        || voted_area != current.area
        || voted_layout.as_deref() != current.layout.as_deref()
        || voted_direction.as_deref() != current.direction.as_deref();

    // Only write the composite-key fields atomically if they wouldn't
    // collide with a sibling property (spec §4.3: "skip only those four
    // fields and update the remaining ones" on collision).
    let key_fields = if key_changed {
        let collides = current.room_number.is_none()
            && properties::find_candidates_by_composite_key(conn, current.building_id, voted_floor, voted_area, 0.0)?
                .iter()
                .any(|c| {
                    c.id != property_id
                        && c.layout.as_deref() == voted_layout.as_deref()
                        && c.direction.as_deref() == voted_direction.as_deref()
                });
        if collides {
            None
        } else {
            Some((voted_floor, voted_area, voted_layout.as_deref(), voted_direction.as_deref()))
        }
    } else {
        None
    };

    let balcony_ballots = numeric_ballots(&source_listings, |l| l.listing_balcony_area.map(|a| (a * 100.0).round() as i64));
    let voted_balcony = tally(balcony_ballots.iter()).and_then(|s| s.parse::<i64>().ok()).map(|c| c as f64 / 100.0);

    let mgmt_ballots = numeric_ballots(&source_listings, |l| l.management_fee);
    let voted_mgmt = tally(mgmt_ballots.iter()).and_then(|s| s.parse::<i64>().ok());

    let repair_ballots = numeric_ballots(&source_listings, |l| l.repair_fund);
    let voted_repair = tally(repair_ballots.iter()).and_then(|s| s.parse::<i64>().ok());

    let station_ballots = string_ballots(&source_listings, |l| l.listing_station_info.as_deref(), whitespace_collapsed);
    let voted_station = tally(station_ballots.iter());

    let parking_ballots = string_ballots(&source_listings, |l| l.listing_parking_info.as_deref(), normalize);
    let voted_parking = tally(parking_ballots.iter());

    // current_price (spec §3: "majority price across active listings;
    // null when all inactive"). Distinct from the attribute list
    // `refresh_property` is contracted for in spec §4.3: it participates
    // in the same weighted vote, but only over *active* listings, never
    // the fallback-to-all-listings window `select_source_listings` uses
    // for a sold property (whose current_price must stay null).
    let active_listings: Vec<Listing> = listings::for_property(conn, property_id)?
        .into_iter()
        .filter(|l| l.is_active)
        .collect();
    let price_ballots = numeric_ballots(&active_listings, |l| l.current_price);
    let voted_price = tally(price_ballots.iter()).and_then(|s| s.parse::<i64>().ok());
    properties::update_current_price(conn, property_id, voted_price)?;

    // display_building_name votes over the property's own listings'
    // building names, same ad-copy-aware rule as the building name vote.
    let name_ballots: Vec<Ballot> = source_listings
        .iter()
        .map(|l| {
            let ad_copy = is_advertising_text(&l.listing_building_name);
            Ballot {
                bucket: canonicalize(&l.listing_building_name),
                display: l.listing_building_name.clone(),
                weight: site_weight(l.source_site, ad_copy),
                site: l.source_site,
            }
        })
        .collect();
    let voted_display_name = tally(name_ballots.iter());

    properties::update_voted_attributes(
        conn,
        property_id,
        key_fields,
        voted_balcony,
        voted_display_name.as_deref(),
        voted_mgmt,
        voted_repair,
        voted_station.as_deref(),
        voted_parking.as_deref(),
    )?;

    let updated = properties::find_by_id(conn, property_id)?;
    Ok(updated.as_ref() != Some(&current))
}

/// Recomputes a building's voted attributes and alias table from every
/// listing attached through its properties (spec §4.3). Returns whether
/// anything actually changed (spec invariant 5, "vote idempotence").
pub fn refresh_building(conn: &Connection, building_id: i64) -> Result<bool> {
    let current = match buildings::find_by_id(conn, building_id)? {
        Some(b) => b,
        None => return Ok(false),
    };

    let props = properties::properties_for_building(conn, building_id)?;
    let mut all_listings = Vec::new();
    for p in &props {
        all_listings.extend(select_source_listings(conn, p.id)?);
    }

    let address_ballots = string_ballots(&all_listings, |l| l.listing_address.as_deref(), normalize);
    let voted_address = tally(address_ballots.iter());

    let floors_ballots = numeric_ballots(&all_listings, |l| l.listing_total_floors);
    let voted_floors = tally(floors_ballots.iter()).and_then(|s| s.parse::<i64>().ok());

    let basement_ballots = numeric_ballots(&all_listings, |l| l.listing_basement_floors);
    let voted_basement = tally(basement_ballots.iter()).and_then(|s| s.parse::<i64>().ok());

    let units_ballots = numeric_ballots(&all_listings, |l| l.listing_total_units);
    let voted_units = tally(units_ballots.iter()).and_then(|s| s.parse::<i64>().ok());

    let year_ballots = numeric_ballots(&all_listings, |l| l.listing_built_year);
    let voted_year = tally(year_ballots.iter()).and_then(|s| s.parse::<i64>().ok());

    let month_ballots = numeric_ballots(&all_listings, |l| l.listing_built_month);
    let voted_month = tally(month_ballots.iter()).and_then(|s| s.parse::<i64>().ok());

    let structure_ballots = string_ballots(&all_listings, |l| l.listing_building_structure.as_deref(), normalize);
    let voted_structure = tally(structure_ballots.iter());

    let land_rights_ballots = string_ballots(&all_listings, |l| l.listing_land_rights.as_deref(), normalize);
    let voted_land_rights = tally(land_rights_ballots.iter());

    let station_ballots = string_ballots(&all_listings, |l| l.listing_station_info.as_deref(), whitespace_collapsed);
    let voted_station = tally(station_ballots.iter());

    // Building-name vote (spec §4.3: group by canonical form first, ad-copy
    // excluded from winning unless it's the only candidate).
    let name_candidates = buildings::name_vote_candidates(conn, building_id)?;
    let name_ballots: Vec<Ballot> = name_candidates
        .iter()
        .map(|(name, site, count)| {
            let ad_copy = is_advertising_text(name);
            let site: SourceSite = site.parse().unwrap_or(SourceSite::Suumo);
            Ballot {
                bucket: canonicalize(name),
                display: name.clone(),
                weight: site_weight(site, ad_copy) * (*count as f64),
                site,
            }
        })
        .collect();
    let non_ad_copy_exists = name_ballots.iter().any(|b| !is_advertising_text(&b.display));
    let filtered_name_ballots: Vec<&Ballot> = name_ballots
        .iter()
        .filter(|b| !non_ad_copy_exists || !is_advertising_text(&b.display))
        .collect();
    let voted_name = tally(filtered_name_ballots.into_iter());
    let voted_normalized_name = voted_name.as_deref().map(normalize);

    for (name, site, count) in &name_candidates {
        buildings::upsert_listing_name(conn, building_id, &normalize(name), &canonicalize(name), site, *count)?;
    }

    buildings::update_voted_attributes(
        conn,
        building_id,
        voted_normalized_name.as_deref(),
        voted_address.as_deref(),
        voted_address.as_deref().map(|a| normalize(a)).as_deref(),
        voted_floors,
        voted_basement,
        voted_units,
        voted_year,
        voted_month,
        voted_structure.as_deref(),
        voted_land_rights.as_deref(),
        voted_station.as_deref(),
    )?;

    let updated = buildings::find_by_id(conn, building_id)?;
    Ok(updated.as_ref() != Some(&current))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::test_db;
    use crate::domain::RawListing;
    use crate::identity;

    fn raw(source_site: SourceSite, site_property_id: &str, price: i64, station: &str) -> RawListing {
        RawListing {
            source_site,
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
            listing_station_info: Some(station.to_string()),
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
    fn weighted_vote_prefers_higher_priority_source() {
        let db = test_db();
        db.with_conn(|conn| {
            let r1 = identity::resolve(conn, &raw(SourceSite::Suumo, "P1", 12000, "白金駅徒歩5分"))?;
            let r2 = identity::resolve(conn, &raw(SourceSite::Homes, "H1", 12100, "白金台駅徒歩3分"))?;
            assert_eq!(r1.master_property_id, r2.master_property_id);
            refresh_property(conn, r1.master_property_id)?;
            let p = properties::find_by_id(conn, r1.master_property_id)?.unwrap();
            assert_eq!(p.station_info.as_deref(), Some("白金駅徒歩5分"));
            // S2: SUUMO (priority 0) outweighs HOMES (priority 1).
            assert_eq!(p.current_price, Some(12000));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn current_price_is_null_once_all_listings_are_inactive() {
        let db = test_db();
        db.with_conn(|conn| {
            let r1 = identity::resolve(conn, &raw(SourceSite::Suumo, "P1", 12000, "白金駅徒歩5分"))?;
            refresh_property(conn, r1.master_property_id)?;
            assert_eq!(
                properties::find_by_id(conn, r1.master_property_id)?.unwrap().current_price,
                Some(12000)
            );

            conn.execute(
                "UPDATE listings SET is_active = 0 WHERE id = ?1",
                rusqlite::params![r1.listing_id],
            )?;
            refresh_property(conn, r1.master_property_id)?;
            assert_eq!(properties::find_by_id(conn, r1.master_property_id)?.unwrap().current_price, None);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn refresh_property_is_idempotent() {
        let db = test_db();
        db.with_conn(|conn| {
            let r1 = identity::resolve(conn, &raw(SourceSite::Suumo, "P1", 12000, "白金駅徒歩5分"))?;
            refresh_property(conn, r1.master_property_id)?;
            let before = properties::find_by_id(conn, r1.master_property_id)?.unwrap();
            refresh_property(conn, r1.master_property_id)?;
            let after = properties::find_by_id(conn, r1.master_property_id)?.unwrap();
            assert_eq!(before, after);
            Ok(())
        })
        .unwrap();
    }
}
