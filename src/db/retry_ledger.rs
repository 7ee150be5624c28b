// src/db/retry_ledger.rs
//
// 404 and price-mismatch backoff ledgers consulted by scrapers before
// a detail re-fetch (C9, spec §4.9).

use chrono::{NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::Result;

const MAX_BACKOFF_DAYS: i64 = 7;

fn next_backoff(previous: chrono::Duration) -> chrono::Duration {
    let doubled = previous * 2;
    let cap = chrono::Duration::days(MAX_BACKOFF_DAYS);
    if doubled > cap {
        cap
    } else {
        doubled
    }
}

pub fn record_404(conn: &Connection, source_site: &str, site_property_id: &str) -> Result<()> {
    let now = Utc::now().naive_utc();
    let existing: Option<(i64, NaiveDateTime, NaiveDateTime)> = conn
        .query_row(
            "SELECT error_count, first_error_at, retry_after FROM url_404_retries \
             WHERE source_site = ?1 AND site_property_id = ?2",
            params![source_site, site_property_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    match existing {
        Some((count, first_error_at, prior_retry_after)) => {
            let previous_backoff = prior_retry_after - first_error_at;
            let backoff = next_backoff(previous_backoff.max(chrono::Duration::hours(1)));
            conn.execute(
                "UPDATE url_404_retries SET error_count = ?3, last_error_at = ?4, retry_after = ?5, is_resolved = 0 \
                 WHERE source_site = ?1 AND site_property_id = ?2",
                params![source_site, site_property_id, count + 1, now, now + backoff],
            )?;
        }
        None => {
            conn.execute(
                "INSERT INTO url_404_retries \
                    (source_site, site_property_id, error_count, first_error_at, last_error_at, retry_after, is_resolved) \
                 VALUES (?1, ?2, 1, ?3, ?3, ?4, 0)",
                params![source_site, site_property_id, now, now + chrono::Duration::hours(1)],
            )?;
        }
    }
    Ok(())
}

pub fn should_skip_404(conn: &Connection, source_site: &str, site_property_id: &str) -> Result<bool> {
    let retry_after: Option<NaiveDateTime> = conn
        .query_row(
            "SELECT retry_after FROM url_404_retries \
             WHERE source_site = ?1 AND site_property_id = ?2 AND is_resolved = 0",
            params![source_site, site_property_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(retry_after.map(|t| t > Utc::now().naive_utc()).unwrap_or(false))
}

pub fn record_price_mismatch(
    conn: &Connection,
    source_site: &str,
    site_property_id: &str,
    list_price: i64,
    detail_price: i64,
) -> Result<()> {
    let now = Utc::now().naive_utc();
    let existing: Option<i64> = conn
        .query_row(
            "SELECT error_count FROM price_mismatch_history WHERE source_site = ?1 AND site_property_id = ?2",
            params![source_site, site_property_id],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(count) => {
            conn.execute(
                "UPDATE price_mismatch_history SET list_price = ?3, detail_price = ?4, error_count = ?5, \
                    last_error_at = ?6, retry_after = ?7, is_resolved = 0 \
                 WHERE source_site = ?1 AND site_property_id = ?2",
                params![
                    source_site,
                    site_property_id,
                    list_price,
                    detail_price,
                    count + 1,
                    now,
                    now + chrono::Duration::days(7)
                ],
            )?;
        }
        None => {
            conn.execute(
                "INSERT INTO price_mismatch_history \
                    (source_site, site_property_id, list_price, detail_price, error_count, first_error_at, \
                     last_error_at, retry_after, is_resolved) \
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5, ?6, 0)",
                params![
                    source_site,
                    site_property_id,
                    list_price,
                    detail_price,
                    now,
                    now + chrono::Duration::days(7)
                ],
            )?;
        }
    }
    Ok(())
}

pub fn resolve_price_mismatch(conn: &Connection, source_site: &str, site_property_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE price_mismatch_history SET is_resolved = 1 WHERE source_site = ?1 AND site_property_id = ?2",
        params![source_site, site_property_id],
    )?;
    Ok(())
}

pub fn should_skip_price_mismatch(conn: &Connection, source_site: &str, site_property_id: &str) -> Result<bool> {
    let retry_after: Option<NaiveDateTime> = conn
        .query_row(
            "SELECT retry_after FROM price_mismatch_history \
             WHERE source_site = ?1 AND site_property_id = ?2 AND is_resolved = 0",
            params![source_site, site_property_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(retry_after.map(|t| t > Utc::now().naive_utc()).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::test_db;

    #[test]
    fn repeated_404s_back_off_up_to_the_cap() {
        let db = test_db();
        db.with_conn(|conn| {
            for _ in 0..10 {
                record_404(conn, "suumo", "P1")?;
            }
            let retry_after: NaiveDateTime = conn.query_row(
                "SELECT retry_after FROM url_404_retries WHERE source_site = 'suumo' AND site_property_id = 'P1'",
                [],
                |row| row.get(0),
            )?;
            let now = Utc::now().naive_utc();
            assert!(retry_after <= now + chrono::Duration::days(MAX_BACKOFF_DAYS) + chrono::Duration::minutes(1));
            assert!(should_skip_404(conn, "suumo", "P1")?);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn resolving_mismatch_clears_skip() {
        let db = test_db();
        db.with_conn(|conn| {
            record_price_mismatch(conn, "suumo", "P1", 12000, 11000)?;
            assert!(should_skip_price_mismatch(conn, "suumo", "P1")?);
            resolve_price_mismatch(conn, "suumo", "P1")?;
            assert!(!should_skip_price_mismatch(conn, "suumo", "P1")?);
            Ok(())
        })
        .unwrap();
    }
}
