//! Wire-level FHIR types shared by the cairn storage engine and the
//! batch/transaction processor: the `Bundle` family and `OperationOutcome`
//! construction helpers.

pub mod bundle;
pub mod outcome;

pub use bundle::{Bundle, BundleEntry, BundleEntryRequest, BundleEntryResponse, BundleEntrySearch, BundleLink, BundleType};
pub use outcome::{operation_outcome, IssueSeverity};
