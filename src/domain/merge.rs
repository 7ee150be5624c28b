// src/domain/merge.rs
//
// Audit + redirection records for C6 (spec §3/§4.6). Hybrid pointer
// scheme: `direct_primary_id` is the target chosen at merge time,
// `final_primary_id` tracks the live end of the chain as later merges
// happen, and `merge_depth` counts hops so redirection never loops.

use chrono::NaiveDateTime;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct BuildingMergeHistory {
    pub id: i64,
    pub merged_building_id: i64,
    pub direct_primary_building_id: i64,
    pub final_primary_building_id: i64,
    pub merge_depth: i64,
    pub merge_details: Value,
    pub merged_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyMergeHistory {
    pub id: i64,
    pub merged_property_id: i64,
    pub direct_primary_property_id: i64,
    pub final_primary_property_id: i64,
    pub merge_depth: i64,
    pub merge_details: Value,
    pub merged_at: NaiveDateTime,
}

/// An unordered pair the duplicate detector must never propose again
/// (spec §3); stored with `min(id1, id2) = id1` so lookups don't need
/// to check both orderings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeExclusion {
    pub id1: i64,
    pub id2: i64,
}

impl MergeExclusion {
    pub fn new(a: i64, b: i64) -> Self {
        if a <= b {
            MergeExclusion { id1: a, id2: b }
        } else {
            MergeExclusion { id1: b, id2: a }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusion_normalizes_ordering() {
        assert_eq!(MergeExclusion::new(5, 2), MergeExclusion::new(2, 5));
        assert_eq!(MergeExclusion::new(2, 5).id1, 2);
    }
}
