//! The batch/transaction bundle processor: validates and classifies each
//! entry, resolves references within the bundle, folds resource content
//! through the Upsert Engine, and commits through the Resource Store.
//!
//! [`transaction::Processor`] is the entry point; pass it a `transaction` or
//! `batch` `Bundle` and it dispatches to the matching pipeline.

pub mod batch;
pub mod entry;
pub mod response;
pub mod schema;
pub mod search_oracle;
pub mod tempid;
pub mod transaction;
pub mod upsert;
pub mod url;

pub use entry::{validate_entry, ValidatedEntry};
pub use response::PreferReturn;
pub use search_oracle::{NaiveSearchOracle, SearchMatch, SearchOracle};
pub use tempid::TransactionContext;
pub use transaction::Processor;
