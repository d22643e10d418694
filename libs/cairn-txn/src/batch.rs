//! The `batch` bundle pipeline: every entry is planned, committed, and
//! responded to independently. A failing entry becomes an error response in
//! its slot rather than aborting the bundle (spec.md §4.8) — the bundle
//! response status is always 200.
//!
//! Unlike a transaction, there is no cross-entry reference resolution: a
//! fresh [`TransactionContext`] is built per entry, seeded only from what is
//! already live in the store. References to resources created earlier in the
//! same batch are non-conformant and will fail referential-integrity
//! checking, same as a reference to a resource that never existed.

use std::sync::Arc;

use cairn_models::bundle::{Bundle, BundleEntry, BundleType};
use cairn_store::error::Error;
use cairn_store::version::{self, CreationMode};
use cairn_store::{CasGuard, LuidGenerator, ResourceStore, WorkerPool, WriteRequest};
use chrono::Utc;

use crate::entry::{validate_entry, ValidatedEntry};
use crate::response::{self, PreferReturn};
use crate::search_oracle::SearchOracle;
use crate::tempid::TransactionContext;
use crate::upsert;

pub async fn process_batch<S: ResourceStore, O: SearchOracle>(
    store: Arc<S>,
    oracle: Arc<O>,
    luids: Arc<LuidGenerator>,
    pool: &WorkerPool,
    base_url: &str,
    bundle: &Bundle,
    prefer: PreferReturn,
) -> Bundle {
    let mut response_entries = Vec::with_capacity(bundle.entries().len());
    for (i, entry) in bundle.entries().iter().enumerate() {
        let full_url = entry.full_url.clone();
        let outcome = process_one(&store, &oracle, &luids, pool, base_url, entry, i, prefer).await;
        let response_entry = match outcome {
            Ok(e) => e,
            Err(err) => response::error_entry(full_url, &err),
        };
        response_entries.push(response_entry);
    }
    Bundle::with_entries(BundleType::BatchResponse, response_entries)
}

async fn process_one<S: ResourceStore, O: SearchOracle>(
    store: &Arc<S>,
    oracle: &Arc<O>,
    luids: &Arc<LuidGenerator>,
    pool: &WorkerPool,
    base_url: &str,
    entry: &BundleEntry,
    index: usize,
    prefer: PreferReturn,
) -> cairn_store::Result<BundleEntry> {
    let full_url = entry.full_url.clone();
    let validated = validate_entry(entry, index)?;
    let mut ctx = TransactionContext::new();

    match validated {
        ValidatedEntry::Create { resource_type, resource, conditional } => {
            if let Some(query) = conditional {
                let (count, matches) = oracle.search(&resource_type, &query).await?;
                if count >= 2 {
                    let first_two: Vec<String> = matches
                        .iter()
                        .take(2)
                        .map(|m| format!("\"{}/{}/_history/{}\"", m.resource_type, m.id, version::ordinal(m.version)))
                        .collect();
                    return Err(Error::multiple_matches(format!(
                        "Conditional create of a {resource_type} with query \"{query}\" failed because at least the two matches {} and {} were found.",
                        first_two[0], first_two[1]
                    )));
                }
                if count == 1 {
                    let m = &matches[0];
                    let stored = store
                        .read(&m.resource_type, &m.id)
                        .await?
                        .ok_or_else(|| Error::fault("conditional match vanished from the store"))?;
                    return Ok(response::write_entry(
                        full_url,
                        200,
                        base_url,
                        &m.resource_type,
                        &m.id,
                        stored.version,
                        stored.transaction_time,
                        stored.content,
                        prefer,
                    ));
                }
            }
            let id = luids.next();
            let entity = format!("{resource_type}/{id}");
            ctx.register_tempid(full_url.clone().unwrap_or_else(|| entity.clone()), (resource_type.clone(), id.clone()));
            register_live_references(store, &resource, &mut ctx).await?;
            let desired = version::initial(CreationMode::ServerAssigned);
            let outcome = upsert::upsert(&entity, &resource_type, None, &resource, None, desired, &mut ctx)?;
            let write_result = pool
                .submit(store.write(WriteRequest {
                    mutations: outcome.mutations,
                    cas_guards: vec![outcome.cas_guard],
                }))
                .await?;
            let version_token = *write_result.versions.get(&entity).expect("just written");
            let now = write_result.transaction_time.unwrap_or_else(Utc::now);
            let stored = store.read(&resource_type, &id).await?.expect("just written");
            Ok(response::write_entry(full_url, 201, base_url, &resource_type, &id, version_token, now, stored.content, prefer))
        }
        ValidatedEntry::Update { resource_type, id, resource, if_match } => {
            let entity = format!("{resource_type}/{id}");
            ctx.register_tempid(full_url.clone().unwrap_or_else(|| entity.clone()), (resource_type.clone(), id.clone()));
            register_live_references(store, &resource, &mut ctx).await?;
            let existing = store.read(&resource_type, &id).await?;
            let (expected_version, old_content, creation_mode) = match &existing {
                Some(stored) if stored.content.is_some() => {
                    if let Some(tok) = &if_match {
                        let expected_ordinal = parse_if_match_ordinal(tok)
                            .ok_or_else(|| Error::incorrect(format!("Malformed If-Match value \"{tok}\".")))?;
                        if expected_ordinal != version::ordinal(stored.version) {
                            return Err(Error::precondition_failed(format!(
                                "Precondition \"{tok}\" failed on \"{resource_type}/{id}\"."
                            )));
                        }
                    }
                    (Some(stored.version), stored.content.clone(), CreationMode::ServerAssigned)
                }
                Some(stored) => (Some(stored.version), None, CreationMode::ServerAssigned),
                None => (None, None, CreationMode::ClientAssigned),
            };
            let desired = match expected_version {
                Some(v) => version::upsert_decrement(v),
                None => version::initial(creation_mode),
            };
            let status = if expected_version.is_none() { 201 } else { 200 };
            let outcome = upsert::upsert(&entity, &resource_type, old_content.as_ref(), &resource, expected_version, desired, &mut ctx)?;
            let write_result = pool
                .submit(store.write(WriteRequest {
                    mutations: outcome.mutations,
                    cas_guards: vec![outcome.cas_guard],
                }))
                .await?;
            let version_token = *write_result.versions.get(&entity).expect("just written");
            let now = write_result.transaction_time.unwrap_or_else(Utc::now);
            let stored = store.read(&resource_type, &id).await?.expect("just written");
            Ok(response::write_entry(full_url, status, base_url, &resource_type, &id, version_token, now, stored.content, prefer))
        }
        ValidatedEntry::Delete { resource_type, id } => {
            let existing = store.read(&resource_type, &id).await?;
            match existing.filter(|r| r.content.is_some()) {
                Some(stored) => {
                    let write_result = pool
                        .submit(store.write(WriteRequest {
                            mutations: Vec::new(),
                            cas_guards: vec![CasGuard {
                                entity: format!("{resource_type}/{id}"),
                                expected: Some(stored.version),
                                desired: version::delete_decrement(stored.version),
                            }],
                        }))
                        .await?;
                    let entity = format!("{resource_type}/{id}");
                    let version_token = *write_result.versions.get(&entity).expect("just written");
                    let now = write_result.transaction_time.unwrap_or_else(Utc::now);
                    Ok(response::delete_entry(full_url, base_url, &resource_type, &id, version_token, now))
                }
                None => Ok(response::delete_entry(full_url, base_url, &resource_type, &id, version::initial(CreationMode::ServerAssigned), Utc::now())),
            }
        }
        ValidatedEntry::Read { resource_type, id } => {
            let stored = store
                .read(&resource_type, &id)
                .await?
                .filter(|r| r.content.is_some())
                .ok_or_else(|| Error::not_found(format!("Resource \"{resource_type}/{id}\" doesn't exist.")))?;
            Ok(response::read_entry(full_url, stored.version, stored.transaction_time, stored.content.expect("filtered to Some")))
        }
        ValidatedEntry::Search { resource_type, query } => {
            let query = query.unwrap_or_default();
            let (total, matches) = oracle.search(&resource_type, &query).await?;
            let mut searchset_entries = Vec::new();
            for m in matches {
                if let Some(stored) = store.read(&m.resource_type, &m.id).await? {
                    if let Some(content) = stored.content {
                        searchset_entries.push(serde_json::json!({"resource": content, "search": {"mode": "match"}}));
                    }
                }
            }
            let result = serde_json::json!({
                "resourceType": "Bundle",
                "type": "searchset",
                "total": total,
                "entry": searchset_entries,
            });
            Ok(response::search_entry(full_url, result))
        }
    }
}

async fn register_live_references<S: ResourceStore>(store: &Arc<S>, resource: &serde_json::Value, ctx: &mut TransactionContext) -> cairn_store::Result<()> {
    let mut candidates = Vec::new();
    crate::transaction::collect_references(resource, &mut candidates);
    for target in candidates {
        if ctx.target_known(&target) {
            continue;
        }
        if store.read(&target.0, &target.1).await?.is_some() {
            ctx.register_existing(target);
        }
    }
    Ok(())
}

fn parse_if_match_ordinal(token: &str) -> Option<i64> {
    let inner = token.strip_prefix("W/")?;
    let inner = inner.trim_matches('"');
    inner.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search_oracle::NaiveSearchOracle;
    use cairn_models::bundle::BundleEntryRequest;
    use cairn_store::InMemoryResourceStore;
    use serde_json::json;
    use std::time::Duration;

    fn setup() -> (Arc<InMemoryResourceStore>, Arc<NaiveSearchOracle<InMemoryResourceStore>>, Arc<LuidGenerator>, WorkerPool) {
        let store = Arc::new(InMemoryResourceStore::new());
        let oracle = Arc::new(NaiveSearchOracle::new(store.clone()));
        let luids = Arc::new(LuidGenerator::new(0));
        let pool = WorkerPool::new(20, 100, Duration::from_secs(10));
        (store, oracle, luids, pool)
    }

    #[tokio::test]
    async fn one_failing_entry_does_not_abort_the_rest_of_the_batch() {
        let (store, oracle, luids, pool) = setup();
        let ok_entry = BundleEntry::request(BundleEntryRequest::new("POST", "Patient"), Some(json!({"resourceType": "Patient"})));
        let bad_entry = BundleEntry::request(BundleEntryRequest::new("PATCH", "Patient/0"), None);
        let bundle = Bundle::with_entries(BundleType::Batch, vec![ok_entry, bad_entry]);
        let response = process_batch(store, oracle, luids, &pool, "http://example.org/fhir", &bundle, PreferReturn::Representation).await;
        assert_eq!(response.type_, BundleType::BatchResponse);
        assert_eq!(response.entries()[0].response.as_ref().unwrap().status, "201");
        assert_eq!(response.entries()[1].response.as_ref().unwrap().status, "422");
    }

    #[tokio::test]
    async fn batch_entries_do_not_resolve_references_to_siblings_created_in_the_same_batch() {
        let (store, oracle, luids, pool) = setup();
        let patient = BundleEntry {
            full_url: Some("urn:uuid:p1".to_string()),
            resource: Some(json!({"resourceType": "Patient"})),
            request: Some(BundleEntryRequest::new("POST", "Patient")),
            response: None,
            search: None,
            extensions: Default::default(),
        };
        let observation = BundleEntry::request(
            BundleEntryRequest::new("POST", "Observation"),
            Some(json!({"resourceType": "Observation", "subject": {"reference": "urn:uuid:p1"}})),
        );
        let bundle = Bundle::with_entries(BundleType::Batch, vec![patient, observation]);
        let response = process_batch(store, oracle, luids, &pool, "http://example.org/fhir", &bundle, PreferReturn::Representation).await;
        assert_eq!(response.entries()[0].response.as_ref().unwrap().status, "201");
        assert_eq!(response.entries()[1].response.as_ref().unwrap().status, "409");
    }
}
