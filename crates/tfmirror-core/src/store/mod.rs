//! Persistent mirror state: SQLite database and its actor handle.

mod actor;
mod db;

pub use actor::StoreHandle;
pub use db::{Claim, DbError, FailedPlatforms, StateDb, StatusCounts};
