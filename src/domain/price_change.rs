// src/domain/price_change.rs
//
// Derived per-property price-change events (C5, spec §4.5) and the
// recomputation queue that drives them.

use chrono::{NaiveDate, NaiveDateTime};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PropertyPriceChange {
    pub id: i64,
    pub master_property_id: i64,
    pub change_date: NaiveDate,
    pub old_price: i64,
    pub new_price: i64,
    pub price_diff: i64,
    pub price_diff_rate: f64,
    pub new_price_votes: i64,
    pub old_price_votes: i64,
}

impl PropertyPriceChange {
    pub fn derive(
        master_property_id: i64,
        change_date: NaiveDate,
        old_price: i64,
        new_price: i64,
        new_price_votes: i64,
        old_price_votes: i64,
    ) -> Self {
        let price_diff = new_price - old_price;
        let price_diff_rate = if old_price != 0 {
            price_diff as f64 / old_price as f64 * 100.0
        } else {
            0.0
        };
        PropertyPriceChange {
            id: 0,
            master_property_id,
            change_date,
            old_price,
            new_price,
            price_diff,
            price_diff_rate,
            new_price_votes,
            old_price_votes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = crate::errors::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "completed" => Ok(QueueStatus::Completed),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(crate::errors::Error::BadInput(format!(
                "unknown queue status '{other}'"
            ))),
        }
    }
}

/// A pending recomputation work item (spec §3/§4.5). `enqueue` coalesces
/// with any existing pending row for the same property by keeping the
/// lower (higher-priority) value.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyPriceChangeQueueItem {
    pub id: i64,
    pub master_property_id: i64,
    pub status: QueueStatus,
    pub priority: i64,
    pub reason: String,
    pub error_message: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_computes_diff_and_rate() {
        let d = NaiveDate::from_ymd_opt(2026, 7, 28).unwrap();
        let change = PropertyPriceChange::derive(1, d, 12000, 11800, 2, 3);
        assert_eq!(change.price_diff, -200);
        assert!((change.price_diff_rate - (-200.0 / 12000.0 * 100.0)).abs() < 1e-9);
    }

    #[test]
    fn derive_handles_zero_old_price_without_dividing() {
        let d = NaiveDate::from_ymd_opt(2026, 7, 28).unwrap();
        let change = PropertyPriceChange::derive(1, d, 0, 5000, 1, 0);
        assert_eq!(change.price_diff_rate, 0.0);
    }
}
