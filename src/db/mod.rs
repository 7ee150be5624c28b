pub mod buildings;
pub mod connection;
pub mod listings;
pub mod merges;
pub mod price_changes;
pub mod properties;
pub mod retry_ledger;
pub mod schema;
pub mod tasks;

pub use connection::Database;
