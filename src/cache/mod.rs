// src/cache/mod.rs
//
// C10 — Recent-Updates Projection (spec §4.10). An in-process TTL cache
// over a ward-bucketed aggregate of recent price changes and new
// listings, scoped to properties with at least one active listing and
// buildings whose name passed ad-copy detection.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{Duration, NaiveDateTime, Utc};
use rusqlite::{params, Connection};

use crate::errors::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct WardAggregate {
    pub ward: String,
    pub price_change_count: i64,
    pub new_listing_count: i64,
}

struct Entry {
    computed_at: NaiveDateTime,
    value: Vec<WardAggregate>,
}

/// Keyed by `"recent_updates_{hours}h"` / `"recent_updates_counts_{hours}h"`
/// per spec; both cache keys for a given `hours` share the same
/// underlying aggregate here since `WardAggregate` already carries both
/// counts, so one entry serves both query shapes.
pub struct RecentUpdatesCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl RecentUpdatesCache {
    pub fn new(ttl: std::time::Duration) -> Self {
        RecentUpdatesCache {
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(1800)),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn key(hours: i64) -> String {
        format!("recent_updates_{hours}h")
    }

    /// Returns the cached value if still within TTL, otherwise runs
    /// `compute` and stores the fresh result (spec §4.10 "TTL 30 min").
    pub fn get_or_compute<F>(&self, key: &str, compute: F) -> Result<Vec<WardAggregate>>
    where
        F: FnOnce() -> Result<Vec<WardAggregate>>,
    {
        let now = Utc::now().naive_utc();
        {
            let entries = self.entries.lock().expect("cache mutex poisoned");
            if let Some(e) = entries.get(key) {
                if now - e.computed_at < self.ttl {
                    return Ok(e.value.clone());
                }
            }
        }
        let value = compute()?;
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        entries.insert(
            key.to_string(),
            Entry {
                computed_at: now,
                value: value.clone(),
            },
        );
        Ok(value)
    }

    /// Drops every cached entry. Invariant 7 (spec §8): after any merge,
    /// revert, listing insert/update, or C4 run, the next call must miss
    /// and recompute — the source invalidates the whole cache rather
    /// than tracking which wards a given write touched, so this does
    /// the same.
    pub fn invalidate_all(&self) {
        self.entries.lock().expect("cache mutex poisoned").clear();
    }
}

impl Default for RecentUpdatesCache {
    fn default() -> Self {
        RecentUpdatesCache::new(std::time::Duration::from_secs(1800))
    }
}

/// Computes the ward-bucketed aggregate for the trailing `hours` hours
/// (spec §4.10), recomputed on a cache miss.
pub fn compute_recent_updates(conn: &Connection, hours: i64) -> Result<Vec<WardAggregate>> {
    let since = Utc::now().naive_utc() - Duration::hours(hours);
    let mut wards: HashMap<String, WardAggregate> = HashMap::new();

    let mut price_stmt = conn.prepare(
        "SELECT substr(COALESCE(b.normalized_address, ''), 1, 6) AS ward, COUNT(*) \
         FROM property_price_changes ppc \
         JOIN master_properties p ON p.id = ppc.master_property_id \
         JOIN buildings b ON b.id = p.building_id \
         WHERE ppc.change_date >= date(?1) \
           AND b.is_valid_name = 1 \
           AND EXISTS (SELECT 1 FROM listings l WHERE l.master_property_id = p.id AND l.is_active = 1) \
         GROUP BY ward",
    )?;
    let price_rows = price_stmt.query_map(params![since.date()], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for r in price_rows {
        let (ward, count) = r?;
        wards
            .entry(ward.clone())
            .or_insert_with(|| WardAggregate {
                ward: ward.clone(),
                price_change_count: 0,
                new_listing_count: 0,
            })
            .price_change_count += count;
    }

    let mut listing_stmt = conn.prepare(
        "SELECT substr(COALESCE(b.normalized_address, ''), 1, 6) AS ward, COUNT(*) \
         FROM listings l \
         JOIN master_properties p ON p.id = l.master_property_id \
         JOIN buildings b ON b.id = p.building_id \
         WHERE l.first_seen_at >= ?1 AND b.is_valid_name = 1 AND l.is_active = 1 \
         GROUP BY ward",
    )?;
    let listing_rows = listing_stmt.query_map(params![since], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for r in listing_rows {
        let (ward, count) = r?;
        wards
            .entry(ward.clone())
            .or_insert_with(|| WardAggregate {
                ward: ward.clone(),
                price_change_count: 0,
                new_listing_count: 0,
            })
            .new_listing_count += count;
    }

    let mut out: Vec<WardAggregate> = wards.into_values().collect();
    out.sort_by(|a, b| a.ward.cmp(&b.ward));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::test_db;

    #[test]
    fn cache_misses_until_ttl_expires() {
        let cache = RecentUpdatesCache::new(std::time::Duration::from_secs(1800));
        let mut calls = 0;
        let key = RecentUpdatesCache::key(24);

        let first = cache.get_or_compute(&key, || {
            calls += 1;
            Ok(vec![WardAggregate {
                ward: "港区".to_string(),
                price_change_count: 1,
                new_listing_count: 2,
            }])
        });
        assert!(first.is_ok());
        assert_eq!(calls, 1);

        // Second call within TTL must not recompute.
        let _ = cache.get_or_compute(&key, || {
            calls += 1;
            Ok(vec![])
        });
        assert_eq!(calls, 1);

        cache.invalidate_all();
        let _ = cache.get_or_compute(&key, || {
            calls += 1;
            Ok(vec![])
        });
        assert_eq!(calls, 2);
    }

    #[test]
    fn compute_recent_updates_runs_against_empty_db() {
        let db = test_db();
        db.with_conn(|conn| {
            let wards = compute_recent_updates(conn, 24)?;
            assert!(wards.is_empty());
            Ok(())
        })
        .unwrap();
    }
}
