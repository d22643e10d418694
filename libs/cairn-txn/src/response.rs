//! Response Assembler: builds a per-entry `{status, location, etag,
//! lastModified, resource}` and projects a processor `Error` into an
//! `OperationOutcome`-carrying entry, per spec.md §4.7.

use cairn_models::bundle::{BundleEntry, BundleEntryResponse};
use cairn_models::outcome::{operation_outcome, IssueSeverity};
use cairn_store::error::Error;
use cairn_store::version;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// `Prefer: return=representation|minimal` — whether write entries carry the
/// stored resource body in their response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferReturn {
    Minimal,
    Representation,
}

pub fn location(base_url: &str, resource_type: &str, id: &str, ordinal: i64) -> String {
    format!("{base_url}/{resource_type}/{id}/_history/{ordinal}")
}

pub fn etag(ordinal: i64) -> String {
    format!("W/\"{ordinal}\"")
}

pub fn write_entry(
    full_url: Option<String>,
    status: u16,
    base_url: &str,
    resource_type: &str,
    id: &str,
    version_token: i64,
    last_modified: DateTime<Utc>,
    resource: Option<Value>,
    prefer: PreferReturn,
) -> BundleEntry {
    let ordinal = version::ordinal(version_token);
    let response = BundleEntryResponse {
        status: status.to_string(),
        location: Some(location(base_url, resource_type, id, ordinal)),
        etag: Some(etag(ordinal)),
        last_modified: Some(last_modified.to_rfc3339()),
        outcome: None,
    };
    let body = match prefer {
        PreferReturn::Representation => resource,
        PreferReturn::Minimal => None,
    };
    BundleEntry::response(full_url, response, body)
}

pub fn delete_entry(full_url: Option<String>, base_url: &str, resource_type: &str, id: &str, version_token: i64, last_modified: DateTime<Utc>) -> BundleEntry {
    let ordinal = version::ordinal(version_token);
    let response = BundleEntryResponse {
        status: "204".to_string(),
        location: Some(location(base_url, resource_type, id, ordinal)),
        etag: Some(etag(ordinal)),
        last_modified: Some(last_modified.to_rfc3339()),
        outcome: None,
    };
    BundleEntry::response(full_url, response, None)
}

pub fn read_entry(full_url: Option<String>, version_token: i64, last_modified: DateTime<Utc>, resource: Value) -> BundleEntry {
    let ordinal = version::ordinal(version_token);
    let response = BundleEntryResponse {
        status: "200".to_string(),
        location: None,
        etag: Some(etag(ordinal)),
        last_modified: Some(last_modified.to_rfc3339()),
        outcome: None,
    };
    BundleEntry::response(full_url, response, Some(resource))
}

pub fn search_entry(full_url: Option<String>, resource: Value) -> BundleEntry {
    let response = BundleEntryResponse {
        status: "200".to_string(),
        location: None,
        etag: None,
        last_modified: None,
        outcome: None,
    };
    BundleEntry::response(full_url, response, Some(resource))
}

/// Builds a per-entry error response carrying an `OperationOutcome`, for use
/// in a `batch` bundle where a failing entry does not abort the bundle.
pub fn error_entry(full_url: Option<String>, err: &Error) -> BundleEntry {
    let outcome = operation_outcome(IssueSeverity::Error, err.issue_code(), &err.to_string(), err.expression());
    let response = BundleEntryResponse {
        status: err.http_status().to_string(),
        location: None,
        etag: None,
        last_modified: None,
        outcome: Some(outcome),
    };
    BundleEntry::response(full_url, response, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_store::version::{initial, CreationMode};

    #[test]
    fn write_entry_omits_resource_body_under_minimal_preference() {
        let now = Utc::now();
        let entry = write_entry(
            None,
            201,
            "http://example.org/fhir",
            "Patient",
            "0",
            initial(CreationMode::ServerAssigned),
            now,
            Some(serde_json::json!({"resourceType": "Patient"})),
            PreferReturn::Minimal,
        );
        assert!(entry.resource.is_none());
        assert_eq!(entry.response.unwrap().status, "201");
    }

    #[test]
    fn error_entry_carries_operation_outcome_and_mapped_status() {
        let err = Error::referential_integrity("Referential integrity violated. Resource \"Patient/0\" doesn't exist.");
        let entry = error_entry(Some("urn:uuid:1".to_string()), &err);
        assert_eq!(entry.response.as_ref().unwrap().status, "409");
        assert_eq!(entry.response.unwrap().outcome.unwrap()["issue"][0]["code"], "conflict");
    }
}
