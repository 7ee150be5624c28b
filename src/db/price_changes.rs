// src/db/price_changes.rs
//
// Persistence for `PropertyPriceChange` and the recomputation queue
// (C5, spec §3/§4.5).

use chrono::{NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::domain::price_change::{PropertyPriceChange, PropertyPriceChangeQueueItem, QueueStatus};
use crate::errors::{Error, Result};

pub fn replace_for_property(conn: &Connection, master_property_id: i64, changes: &[PropertyPriceChange]) -> Result<()> {
    conn.execute(
        "DELETE FROM property_price_changes WHERE master_property_id = ?1",
        params![master_property_id],
    )?;
    for c in changes {
        conn.execute(
            "INSERT INTO property_price_changes \
                (master_property_id, change_date, old_price, new_price, price_diff, price_diff_rate, \
                 new_price_votes, old_price_votes) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                master_property_id,
                c.change_date,
                c.old_price,
                c.new_price,
                c.price_diff,
                c.price_diff_rate,
                c.new_price_votes,
                c.old_price_votes,
            ],
        )?;
    }
    Ok(())
}

pub fn for_property(conn: &Connection, master_property_id: i64) -> Result<Vec<PropertyPriceChange>> {
    let mut stmt = conn.prepare(
        "SELECT id, master_property_id, change_date, old_price, new_price, price_diff, \
                price_diff_rate, new_price_votes, old_price_votes \
         FROM property_price_changes WHERE master_property_id = ?1 ORDER BY change_date ASC",
    )?;
    let rows = stmt.query_map(params![master_property_id], |row| {
        Ok(PropertyPriceChange {
            id: row.get(0)?,
            master_property_id: row.get(1)?,
            change_date: row.get(2)?,
            old_price: row.get(3)?,
            new_price: row.get(4)?,
            price_diff: row.get(5)?,
            price_diff_rate: row.get(6)?,
            new_price_votes: row.get(7)?,
            old_price_votes: row.get(8)?,
        })
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

/// Enqueues recomputation, coalescing with any existing pending row by
/// keeping the *lower* (higher-priority) value (spec §4.5).
pub fn enqueue(conn: &Connection, master_property_id: i64, reason: &str, priority: i64) -> Result<()> {
    let now = Utc::now().naive_utc();
    let existing: Option<(i64, i64)> = conn
        .query_row(
            "SELECT id, priority FROM property_price_change_queue \
             WHERE master_property_id = ?1 AND status = 'pending'",
            params![master_property_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match existing {
        Some((id, existing_priority)) => {
            let new_priority = existing_priority.min(priority);
            conn.execute(
                "UPDATE property_price_change_queue SET priority = ?2, reason = ?3, updated_at = ?4 WHERE id = ?1",
                params![id, new_priority, reason, now],
            )?;
        }
        None => {
            conn.execute(
                "INSERT INTO property_price_change_queue \
                    (master_property_id, status, priority, reason, created_at, updated_at) \
                 VALUES (?1, 'pending', ?2, ?3, ?4, ?4)",
                params![master_property_id, priority, reason, now],
            )?;
        }
    }
    Ok(())
}

fn row_to_item(row: &rusqlite::Row) -> rusqlite::Result<PropertyPriceChangeQueueItem> {
    let status: String = row.get(2)?;
    Ok(PropertyPriceChangeQueueItem {
        id: row.get(0)?,
        master_property_id: row.get(1)?,
        status: status.parse().unwrap_or(QueueStatus::Pending),
        priority: row.get(3)?,
        reason: row.get(4)?,
        error_message: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

/// Drains up to `limit` pending rows in priority order, marking them
/// `processing` so concurrent workers don't double-pick them.
pub fn claim_pending(conn: &Connection, limit: i64) -> Result<Vec<PropertyPriceChangeQueueItem>> {
    let mut stmt = conn.prepare(
        "SELECT id, master_property_id, status, priority, reason, error_message, created_at, updated_at \
         FROM property_price_change_queue WHERE status = 'pending' ORDER BY priority ASC, created_at ASC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], row_to_item)?;
    let mut items = Vec::new();
    for r in rows {
        items.push(r?);
    }
    let now = Utc::now().naive_utc();
    for item in &items {
        conn.execute(
            "UPDATE property_price_change_queue SET status = 'processing', updated_at = ?2 WHERE id = ?1",
            params![item.id, now],
        )?;
    }
    Ok(items)
}

pub fn mark_completed(conn: &Connection, id: i64) -> Result<()> {
    let now = Utc::now().naive_utc();
    conn.execute(
        "UPDATE property_price_change_queue SET status = 'completed', updated_at = ?2 WHERE id = ?1",
        params![id, now],
    )?;
    Ok(())
}

pub fn mark_failed(conn: &Connection, id: i64, error_message: &str) -> Result<()> {
    let now = Utc::now().naive_utc();
    conn.execute(
        "UPDATE property_price_change_queue SET status = 'failed', error_message = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, error_message, now],
    )?;
    Ok(())
}

#[allow(dead_code)]
pub fn touch(_conn: &Connection, _id: i64, _now: NaiveDateTime) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::test_db;

    #[test]
    fn enqueue_coalesces_to_higher_priority() {
        let db = test_db();
        db.with_conn(|conn| {
            let bid = crate::db::buildings::insert(conn, "X", "X", true)?;
            let pid = crate::db::properties::insert(conn, bid, None, Some(1), Some(50.0), None, None)?;
            enqueue(conn, pid, "listing_updated", 5)?;
            enqueue(conn, pid, "merge", 1)?;
            let claimed = claim_pending(conn, 10)?;
            assert_eq!(claimed.len(), 1);
            assert_eq!(claimed[0].priority, 1);
            Ok(())
        })
        .unwrap();
    }
}
