//! Validates a single bundle entry's `request` against the processor's
//! method/URL rules (spec.md §4.5 validation steps 2-4) and classifies it
//! into one of the interactions the processor knows how to run.

use cairn_models::bundle::BundleEntry;
use cairn_store::error::{Error, Result};
use serde_json::Value;

use crate::url::{is_valid_id, RequestUrl};

#[derive(Debug, Clone)]
pub enum ValidatedEntry {
    Create { resource_type: String, resource: Value, conditional: Option<String> },
    Update { resource_type: String, id: String, resource: Value, if_match: Option<String> },
    Delete { resource_type: String, id: String },
    Read { resource_type: String, id: String },
    Search { resource_type: String, query: Option<String> },
}

fn expr(index: usize, suffix: &str) -> String {
    format!("Bundle.entry[{index}].{suffix}")
}

pub fn validate_entry(entry: &BundleEntry, index: usize) -> Result<ValidatedEntry> {
    let request = entry
        .request
        .as_ref()
        .ok_or_else(|| Error::incorrect_at("Entry is missing request.", expr(index, "request")))?;

    if request.url.is_empty() {
        return Err(Error::incorrect_at("Entry request is missing a url.", expr(index, "request.url")));
    }
    if request.method.is_empty() {
        return Err(Error::incorrect_at("Entry request is missing a method.", expr(index, "request.method")));
    }

    let method = request.method.to_ascii_uppercase();
    let url_expr = expr(index, "request.url");

    match method.as_str() {
        "GET" => {
            let parsed = RequestUrl::parse(&request.url).ok_or_else(|| Error::incorrect_at(format!("Malformed request url \"{}\".", request.url), url_expr.clone()))?;
            match parsed {
                RequestUrl::TypeOnly { resource_type } => Ok(ValidatedEntry::Search { resource_type, query: None }),
                RequestUrl::ById { resource_type, id } => Ok(ValidatedEntry::Read { resource_type, id }),
                RequestUrl::ByVersion { resource_type, id, .. } => Ok(ValidatedEntry::Read { resource_type, id }),
                RequestUrl::Search { resource_type, query } => Ok(ValidatedEntry::Search { resource_type, query: Some(query) }),
            }
        }
        "POST" => {
            let parsed = RequestUrl::parse(&request.url).ok_or_else(|| Error::incorrect_at(format!("Malformed request url \"{}\".", request.url), url_expr.clone()))?;
            match parsed {
                RequestUrl::TypeOnly { resource_type } => {
                    let resource = entry
                        .resource
                        .clone()
                        .ok_or_else(|| Error::incorrect_at("POST requires a resource body.", expr(index, "resource")))?;
                    Ok(ValidatedEntry::Create { resource_type, resource, conditional: request.if_none_exist.clone() })
                }
                RequestUrl::ById { .. } | RequestUrl::ByVersion { .. } => {
                    Err(Error::method_not_allowed(format!("POST \"{}\" is not a supported interaction.", request.url)))
                }
                RequestUrl::Search { .. } => Err(Error::incorrect_at("POST requires a resource-type url, not a search.", url_expr)),
            }
        }
        "PUT" => {
            let parsed = RequestUrl::parse(&request.url).ok_or_else(|| Error::incorrect_at(format!("Malformed request url \"{}\".", request.url), url_expr.clone()))?;
            let RequestUrl::ById { resource_type, id } = parsed else {
                return Err(Error::incorrect_at("PUT requires a \"Type/id\" url.", url_expr));
            };
            if !is_valid_id(&id) {
                return Err(Error::incorrect_at(format!("MSG_ID_INVALID: \"{id}\" is not a valid resource id."), url_expr));
            }
            let resource = entry
                .resource
                .clone()
                .ok_or_else(|| Error::incorrect_at("PUT requires a resource body.", expr(index, "resource")))?;

            let body_type = resource.get("resourceType").and_then(|v| v.as_str());
            if body_type != Some(resource_type.as_str()) {
                return Err(Error::incorrect_at(
                    format!(
                        "MSG_RESOURCE_TYPE_MISMATCH: resource type \"{}\" does not match url \"{}\".",
                        body_type.unwrap_or("?"),
                        resource_type
                    ),
                    expr(index, "resource.resourceType"),
                ));
            }
            match resource.get("id").and_then(|v| v.as_str()) {
                None => Err(Error::incorrect_at(
                    "MSG_RESOURCE_ID_MISSING: resource is missing an id.",
                    expr(index, "resource.id"),
                )),
                Some(body_id) if body_id != id => Err(Error::incorrect_at(
                    format!("MSG_RESOURCE_ID_MISMATCH: resource id \"{body_id}\" does not match url id \"{id}\"."),
                    expr(index, "resource.id"),
                )),
                Some(_) => Ok(ValidatedEntry::Update { resource_type, id, resource, if_match: request.if_match.clone() }),
            }
        }
        "DELETE" => {
            let parsed = RequestUrl::parse(&request.url).ok_or_else(|| Error::incorrect_at(format!("Malformed request url \"{}\".", request.url), url_expr.clone()))?;
            let RequestUrl::ById { resource_type, id } = parsed else {
                return Err(Error::incorrect_at("DELETE requires a \"Type/id\" url.", url_expr));
            };
            Ok(ValidatedEntry::Delete { resource_type, id })
        }
        "PATCH" => Err(Error::unsupported_method("PATCH is not a supported interaction.")),
        "HEAD" | "OPTIONS" | "TRACE" | "CONNECT" => Err(Error::unsupported_method(format!("\"{method}\" is not a supported interaction."))),
        other => Err(Error::incorrect(format!("Unknown method \"{other}\"."))),
    }
}
