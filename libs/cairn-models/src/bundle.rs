//! Wire representation of the FHIR `Bundle` resource and its entries.
//!
//! Kept deliberately version-agnostic: a `Bundle` is a thin envelope around
//! `serde_json::Value` resources rather than a fully typed FHIR resource
//! model, since resource content is produced and consumed by the upsert
//! engine and the resource store, not by this crate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundleType {
    Document,
    Message,
    Transaction,
    TransactionResponse,
    Batch,
    BatchResponse,
    History,
    Searchset,
    Collection,
}

impl BundleType {
    /// The `"<input-type>-response"` pairing used by the processor (spec.md §4.7).
    pub fn response_type(self) -> BundleType {
        match self {
            BundleType::Transaction => BundleType::TransactionResponse,
            BundleType::Batch => BundleType::BatchResponse,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleLink {
    pub relation: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleEntryRequest {
    pub method: String,
    pub url: String,
    #[serde(rename = "ifNoneExist", skip_serializing_if = "Option::is_none")]
    pub if_none_exist: Option<String>,
    #[serde(rename = "ifMatch", skip_serializing_if = "Option::is_none")]
    pub if_match: Option<String>,
    #[serde(rename = "ifNoneMatch", skip_serializing_if = "Option::is_none")]
    pub if_none_match: Option<String>,
    #[serde(rename = "ifModifiedSince", skip_serializing_if = "Option::is_none")]
    pub if_modified_since: Option<String>,
}

impl BundleEntryRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleEntryResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(rename = "lastModified", skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleEntrySearch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleEntry {
    #[serde(rename = "fullUrl", skip_serializing_if = "Option::is_none")]
    pub full_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<BundleEntryRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<BundleEntryResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<BundleEntrySearch>,
    #[serde(flatten)]
    pub extensions: HashMap<String, Value>,
}

impl BundleEntry {
    pub fn request(request: BundleEntryRequest, resource: Option<Value>) -> Self {
        Self {
            full_url: None,
            resource,
            request: Some(request),
            response: None,
            search: None,
            extensions: HashMap::new(),
        }
    }

    pub fn response(full_url: Option<String>, response: BundleEntryResponse, resource: Option<Value>) -> Self {
        Self {
            full_url,
            resource,
            request: None,
            response: Some(response),
            search: None,
            extensions: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(rename = "resourceType")]
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    #[serde(rename = "type")]
    pub type_: BundleType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<Vec<BundleLink>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<Vec<BundleEntry>>,
    #[serde(flatten)]
    pub extensions: HashMap<String, Value>,
}

impl Bundle {
    pub fn new(type_: BundleType) -> Self {
        Self {
            resource_type: "Bundle".to_string(),
            id: None,
            meta: None,
            type_,
            timestamp: None,
            total: None,
            link: None,
            entry: None,
            extensions: HashMap::new(),
        }
    }

    pub fn with_entries(type_: BundleType, entry: Vec<BundleEntry>) -> Self {
        Self {
            entry: Some(entry),
            ..Self::new(type_)
        }
    }

    pub fn entries(&self) -> &[BundleEntry] {
        self.entry.as_deref().unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_empty_transaction_bundle() {
        let bundle = Bundle::new(BundleType::Transaction);
        let json = serde_json::to_value(&bundle).unwrap();
        assert_eq!(json["resourceType"], "Bundle");
        assert_eq!(json["type"], "transaction");
        assert!(json.get("entry").is_none());

        let parsed: Bundle = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.type_, BundleType::Transaction);
        assert!(parsed.entry.is_none());
    }

    #[test]
    fn response_type_mapping_matches_processor_contract() {
        assert_eq!(BundleType::Transaction.response_type(), BundleType::TransactionResponse);
        assert_eq!(BundleType::Batch.response_type(), BundleType::BatchResponse);
    }

    #[test]
    fn entry_request_round_trips_conditional_fields() {
        let mut req = BundleEntryRequest::new("POST", "Patient");
        req.if_none_exist = Some("identifier=150015".to_string());
        let entry = BundleEntry::request(req, Some(serde_json::json!({"resourceType": "Patient"})));
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["request"]["ifNoneExist"], "identifier=150015");
        assert!(json.get("response").is_none());
    }

    #[test]
    fn entry_response_serializes_expected_shape() {
        let response = BundleEntryResponse {
            status: "201".to_string(),
            location: Some("Patient/0/_history/1".to_string()),
            etag: Some("W/\"1\"".to_string()),
            last_modified: Some("2024-01-01T00:00:00Z".to_string()),
            outcome: None,
        };
        let entry = BundleEntry::response(Some("urn:uuid:abc".to_string()), response, None);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["fullUrl"], "urn:uuid:abc");
        assert_eq!(json["response"]["status"], "201");
        assert!(json.get("resource").is_none());
    }

    #[test]
    fn unknown_top_level_fields_round_trip_via_flatten() {
        let json = serde_json::json!({
            "resourceType": "Bundle",
            "type": "batch-response",
            "signature": {"type": [{"system": "urn:test"}]}
        });
        let bundle: Bundle = serde_json::from_value(json).unwrap();
        assert!(bundle.extensions.contains_key("signature"));
        let back = serde_json::to_value(&bundle).unwrap();
        assert!(back.get("signature").is_some());
    }

    #[test]
    fn entries_helper_defaults_to_empty_slice() {
        let bundle = Bundle::new(BundleType::Batch);
        assert!(bundle.entries().is_empty());
    }
}
