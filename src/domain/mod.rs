// src/domain/mod.rs
//
// Plain entity types and the name-normalization algorithm (C1). Nothing
// in this module touches SQL; `db::` owns persistence.

pub mod building;
pub mod listing;
pub mod merge;
pub mod normalize;
pub mod price_change;
pub mod property;
pub mod raw_listing;

pub use building::{Building, BuildingListingName};
pub use listing::{Listing, ListingPriceHistory};
pub use merge::{BuildingMergeHistory, MergeExclusion, PropertyMergeHistory};
pub use price_change::{PropertyPriceChange, PropertyPriceChangeQueueItem, QueueStatus};
pub use property::MasterProperty;
pub use raw_listing::{RawListing, SourceSite, PRIORITY_RANK_COUNT};
