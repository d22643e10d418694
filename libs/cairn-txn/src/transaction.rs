//! The `transaction` bundle pipeline: Plan → Conditional create resolution →
//! Generate mutations → Commit → Response, per spec.md §4.5. All five phases
//! run against one shared [`TransactionContext`]; the single [`ResourceStore::write`]
//! call in Commit is what gives the bundle all-or-nothing semantics.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cairn_models::bundle::{Bundle, BundleType};
use cairn_store::error::{Error, Result};
use cairn_store::version::{self, CreationMode};
use cairn_store::{CasGuard, LuidGenerator, ResourceStore, WorkerPool, WriteRequest};
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::entry::{validate_entry, ValidatedEntry};
use crate::response::{self, PreferReturn};
use crate::search_oracle::SearchOracle;
use crate::tempid::TransactionContext;
use crate::upsert;

pub struct Processor<S: ResourceStore, O: SearchOracle> {
    store: Arc<S>,
    oracle: Arc<O>,
    luids: Arc<LuidGenerator>,
    pool: Arc<WorkerPool>,
    base_url: String,
}

impl<S: ResourceStore, O: SearchOracle> Processor<S, O> {
    pub fn new(store: Arc<S>, oracle: Arc<O>, luids: Arc<LuidGenerator>, pool: Arc<WorkerPool>, base_url: impl Into<String>) -> Self {
        Self { store, oracle, luids, pool, base_url: base_url.into() }
    }

    pub async fn process(&self, bundle: &Bundle, prefer: PreferReturn) -> Result<Bundle> {
        match bundle.type_ {
            BundleType::Transaction => self.process_transaction(bundle, prefer).await,
            BundleType::Batch => Ok(crate::batch::process_batch(self.store.clone(), self.oracle.clone(), self.luids.clone(), &self.pool, &self.base_url, bundle, prefer).await),
            other => Err(Error::incorrect(format!("Unsupported bundle type {other:?}; expected \"batch\" or \"transaction\"."))),
        }
    }

    pub async fn process_transaction(&self, bundle: &Bundle, prefer: PreferReturn) -> Result<Bundle> {
        let entries = bundle.entries();
        if entries.is_empty() {
            return Ok(Bundle::with_entries(BundleType::TransactionResponse, Vec::new()));
        }

        let mut validated = Vec::with_capacity(entries.len());
        for (i, e) in entries.iter().enumerate() {
            validated.push(validate_entry(e, i)?);
        }

        reject_duplicate_identities(&validated)?;

        let mut ctx = TransactionContext::new();
        let mut plans: Vec<Plan> = Vec::with_capacity(validated.len());
        let mut ranks: Vec<u8> = Vec::with_capacity(validated.len());
        let mut tempid_map: HashMap<String, (String, String)> = HashMap::new();

        for (i, v) in validated.into_iter().enumerate() {
            let full_url = entries[i].full_url.clone();
            let (plan, rank) = self.plan_entry(v, full_url, &mut ctx, &mut tempid_map).await?;
            plans.push(plan);
            ranks.push(rank);
        }

        let mapping: HashMap<String, String> = tempid_map.iter().map(|(k, (t, id))| (k.clone(), format!("{t}/{id}"))).collect();
        for plan in plans.iter_mut() {
            if let Plan::Write { resource, .. } = plan {
                rewrite_references(resource, &mapping);
            }
        }
        self.register_live_references(&plans, &mut ctx).await?;

        let mut order: Vec<usize> = (0..plans.len()).collect();
        order.sort_by_key(|&i| ranks[i]);

        let mut mutations = Vec::new();
        let mut cas_guards = Vec::new();
        for &i in &order {
            if let Plan::Write { resource_type, id, resource, expected_version, old_content, creation_mode, .. } = &plans[i] {
                let entity = format!("{resource_type}/{id}");
                let desired = match expected_version {
                    Some(v) => version::upsert_decrement(*v),
                    None => version::initial(creation_mode.expect("creation_mode set when expected_version is None")),
                };
                let outcome = upsert::upsert(&entity, resource_type, old_content.as_ref(), resource, *expected_version, desired, &mut ctx)?;
                mutations.extend(outcome.mutations);
                cas_guards.push(outcome.cas_guard);
            } else if let Plan::Delete { resource_type, id, live_version: Some(v), .. } = &plans[i] {
                cas_guards.push(CasGuard {
                    entity: format!("{resource_type}/{id}"),
                    expected: Some(*v),
                    desired: version::delete_decrement(*v),
                });
            }
        }

        let write_result = self.pool.submit(self.store.write(WriteRequest { mutations, cas_guards })).await?;
        let now = write_result.transaction_time.unwrap_or_else(Utc::now);

        let mut response_entries = Vec::with_capacity(plans.len());
        for plan in plans {
            response_entries.push(self.assemble(plan, &write_result.versions, now, prefer).await?);
        }

        Ok(Bundle::with_entries(BundleType::TransactionResponse, response_entries))
    }

    async fn plan_entry(
        &self,
        validated: ValidatedEntry,
        full_url: Option<String>,
        ctx: &mut TransactionContext,
        tempid_map: &mut HashMap<String, (String, String)>,
    ) -> Result<(Plan, u8)> {
        match validated {
            ValidatedEntry::Create { resource_type, resource, conditional } => {
                if let Some(query) = conditional {
                    let (count, matches) = self.oracle.search(&resource_type, &query).await?;
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
                        if let Some(u) = &full_url {
                            tempid_map.insert(u.clone(), (m.resource_type.clone(), m.id.clone()));
                        }
                        ctx.register_existing((m.resource_type.clone(), m.id.clone()));
                        let stored = self
                            .store
                            .read(&m.resource_type, &m.id)
                            .await?
                            .ok_or_else(|| Error::fault("conditional match vanished from the store"))?;
                        return Ok((
                            Plan::ConditionalNoOp {
                                resource_type: m.resource_type.clone(),
                                id: m.id.clone(),
                                full_url,
                                version_token: stored.version,
                                transaction_time: stored.transaction_time,
                                resource: stored.content.unwrap_or(Value::Null),
                            },
                            1,
                        ));
                    }
                }
                let id = self.luids.next();
                let target = (resource_type.clone(), id.clone());
                if let Some(u) = &full_url {
                    tempid_map.insert(u.clone(), target.clone());
                }
                ctx.register_tempid(full_url.clone().unwrap_or_else(|| format!("{resource_type}/{id}")), target);
                Ok((
                    Plan::Write {
                        resource_type,
                        id,
                        resource,
                        full_url,
                        expected_version: None,
                        old_content: None,
                        creation_mode: Some(CreationMode::ServerAssigned),
                    },
                    1,
                ))
            }
            ValidatedEntry::Update { resource_type, id, resource, if_match } => {
                let existing = self.store.read(&resource_type, &id).await?;
                ctx.register_existing((resource_type.clone(), id.clone()));
                if let Some(u) = &full_url {
                    tempid_map.insert(u.clone(), (resource_type.clone(), id.clone()));
                }
                match existing {
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
                        Ok((
                            Plan::Write {
                                resource_type,
                                id,
                                resource,
                                full_url,
                                expected_version: Some(stored.version),
                                old_content: stored.content,
                                creation_mode: None,
                            },
                            2,
                        ))
                    }
                    Some(stored) => Ok((
                        Plan::Write {
                            resource_type,
                            id,
                            resource,
                            full_url,
                            expected_version: Some(stored.version),
                            old_content: None,
                            creation_mode: None,
                        },
                        2,
                    )),
                    None => Ok((
                        Plan::Write {
                            resource_type,
                            id,
                            resource,
                            full_url,
                            expected_version: None,
                            old_content: None,
                            creation_mode: Some(CreationMode::ClientAssigned),
                        },
                        2,
                    )),
                }
            }
            ValidatedEntry::Delete { resource_type, id } => {
                let existing = self.store.read(&resource_type, &id).await?;
                let live_version = existing.as_ref().filter(|r| r.content.is_some()).map(|r| r.version);
                Ok((Plan::Delete { resource_type, id, full_url, live_version }, 0))
            }
            ValidatedEntry::Read { resource_type, id } => Ok((Plan::Read { resource_type, id, full_url }, 3)),
            ValidatedEntry::Search { resource_type, query } => Ok((Plan::Search { resource_type, query, full_url }, 3)),
        }
    }

    async fn register_live_references(&self, plans: &[Plan], ctx: &mut TransactionContext) -> Result<()> {
        let mut candidates = Vec::new();
        for plan in plans {
            if let Plan::Write { resource, .. } = plan {
                collect_references(resource, &mut candidates);
            }
        }
        for target in candidates {
            if ctx.target_known(&target) {
                continue;
            }
            if self.store.read(&target.0, &target.1).await?.is_some() {
                ctx.register_existing(target);
            }
        }
        Ok(())
    }

    async fn assemble(&self, plan: Plan, versions: &HashMap<String, i64>, now: DateTime<Utc>, prefer: PreferReturn) -> Result<cairn_models::bundle::BundleEntry> {
        match plan {
            Plan::Write { resource_type, id, full_url, expected_version, .. } => {
                let entity = format!("{resource_type}/{id}");
                let version_token = *versions.get(&entity).expect("every Write plan produces a version");
                let status = if expected_version.is_none() { 201 } else { 200 };
                let stored = self.store.read(&resource_type, &id).await?.expect("just written");
                Ok(response::write_entry(full_url, status, &self.base_url, &resource_type, &id, version_token, now, stored.content, prefer))
            }
            Plan::Delete { resource_type, id, full_url, live_version } => match live_version {
                Some(_) => {
                    let version_token = *versions.get(&format!("{resource_type}/{id}")).expect("delete plan produces a version");
                    Ok(response::delete_entry(full_url, &self.base_url, &resource_type, &id, version_token, now))
                }
                None => Ok(response::delete_entry(full_url, &self.base_url, &resource_type, &id, version::initial(CreationMode::ServerAssigned), now)),
            },
            Plan::ConditionalNoOp { resource_type, id, full_url, version_token, transaction_time, resource } => {
                let status = 200;
                let entry = response::write_entry(full_url, status, &self.base_url, &resource_type, &id, version_token, transaction_time, Some(resource), prefer);
                Ok(entry)
            }
            Plan::Read { resource_type, id, full_url } => {
                let stored = self
                    .store
                    .read(&resource_type, &id)
                    .await?
                    .filter(|r| r.content.is_some())
                    .ok_or_else(|| Error::not_found(format!("Resource \"{resource_type}/{id}\" doesn't exist.")))?;
                Ok(response::read_entry(full_url, stored.version, stored.transaction_time, stored.content.expect("filtered to Some")))
            }
            Plan::Search { resource_type, query, full_url } => {
                let query = query.unwrap_or_default();
                let (total, matches) = self.oracle.search(&resource_type, &query).await?;
                let mut searchset_entries = Vec::new();
                for m in matches {
                    if let Some(stored) = self.store.read(&m.resource_type, &m.id).await? {
                        if let Some(content) = stored.content {
                            searchset_entries.push(serde_json::json!({"resource": content, "search": {"mode": "match"}}));
                        }
                    }
                }
                let bundle = serde_json::json!({
                    "resourceType": "Bundle",
                    "type": "searchset",
                    "total": total,
                    "entry": searchset_entries,
                });
                Ok(response::search_entry(full_url, bundle))
            }
        }
    }
}

enum Plan {
    Write {
        resource_type: String,
        id: String,
        resource: Value,
        full_url: Option<String>,
        expected_version: Option<i64>,
        old_content: Option<Value>,
        creation_mode: Option<CreationMode>,
    },
    Delete {
        resource_type: String,
        id: String,
        full_url: Option<String>,
        live_version: Option<i64>,
    },
    ConditionalNoOp {
        resource_type: String,
        id: String,
        full_url: Option<String>,
        version_token: i64,
        transaction_time: DateTime<Utc>,
        resource: Value,
    },
    Read {
        resource_type: String,
        id: String,
        full_url: Option<String>,
    },
    Search {
        resource_type: String,
        query: Option<String>,
        full_url: Option<String>,
    },
}

fn reject_duplicate_identities(validated: &[ValidatedEntry]) -> Result<()> {
    let mut seen = HashSet::new();
    for v in validated {
        let identity = match v {
            ValidatedEntry::Update { resource_type, id, .. } | ValidatedEntry::Delete { resource_type, id } => Some((resource_type.clone(), id.clone())),
            _ => None,
        };
        if let Some(identity) = identity {
            if !seen.insert(identity.clone()) {
                return Err(Error::incorrect(format!("Duplicate resource \"{}/{}\".", identity.0, identity.1)));
            }
        }
    }
    Ok(())
}

fn parse_if_match_ordinal(token: &str) -> Option<i64> {
    let inner = token.strip_prefix("W/")?;
    let inner = inner.trim_matches('"');
    inner.parse().ok()
}

/// Rewrites every `.reference` string matching an intra-bundle fullUrl to its
/// resolved `Type/id` form, so the Upsert Engine's literal-reference parser
/// (which only understands `Type/id`) can resolve bundle-internal targets.
fn rewrite_references(value: &mut Value, mapping: &HashMap<String, String>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(r)) = map.get("reference").cloned() {
                if let Some(resolved) = mapping.get(&r) {
                    map.insert("reference".to_string(), Value::String(resolved.clone()));
                }
            }
            for v in map.values_mut() {
                rewrite_references(v, mapping);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                rewrite_references(item, mapping);
            }
        }
        _ => {}
    }
}

pub(crate) fn collect_references(value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            if let Some(r) = map.get("reference").and_then(|v| v.as_str()) {
                if !r.starts_with('#') {
                    if let Some((t, id)) = r.split_once('/') {
                        if !t.is_empty() && !id.is_empty() && !id.contains('/') {
                            out.push((t.to_string(), id.to_string()));
                        }
                    }
                }
            }
            for v in map.values() {
                collect_references(v, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search_oracle::NaiveSearchOracle;
    use cairn_models::bundle::{BundleEntry, BundleEntryRequest};
    use cairn_store::InMemoryResourceStore;
    use serde_json::json;
    use std::time::Duration;

    fn processor() -> Processor<InMemoryResourceStore, NaiveSearchOracle<InMemoryResourceStore>> {
        let store = Arc::new(InMemoryResourceStore::new());
        let oracle = Arc::new(NaiveSearchOracle::new(store.clone()));
        let luids = Arc::new(LuidGenerator::new(0));
        let pool = Arc::new(WorkerPool::new(20, 100, Duration::from_secs(10)));
        Processor::new(store, oracle, luids, pool, "http://example.org/fhir")
    }

    #[tokio::test]
    async fn empty_transaction_returns_empty_response_bundle() {
        let p = processor();
        let bundle = Bundle::new(BundleType::Transaction);
        let response = p.process(&bundle, PreferReturn::Representation).await.unwrap();
        assert_eq!(response.type_, BundleType::TransactionResponse);
        assert!(response.entries().is_empty());
    }

    #[tokio::test]
    async fn create_without_id_assigns_a_luid_and_reports_201() {
        let p = processor();
        let entry = BundleEntry::request(BundleEntryRequest::new("POST", "Patient"), Some(json!({"resourceType": "Patient"})));
        let bundle = Bundle::with_entries(BundleType::Transaction, vec![entry]);
        let response = p.process(&bundle, PreferReturn::Representation).await.unwrap();
        let resp = response.entries()[0].response.as_ref().unwrap();
        assert_eq!(resp.status, "201");
        assert!(resp.location.as_ref().unwrap().contains("/Patient/"));
        assert_eq!(resp.etag, Some("W/\"1\"".to_string()));
    }

    #[tokio::test]
    async fn duplicate_put_targets_abort_with_400() {
        let p = processor();
        let put = || BundleEntry::request(BundleEntryRequest::new("PUT", "Patient/0"), Some(json!({"resourceType": "Patient", "id": "0"})));
        let bundle = Bundle::with_entries(BundleType::Transaction, vec![put(), put()]);
        let err = p.process(&bundle, PreferReturn::Representation).await.unwrap_err();
        assert_eq!(err.http_status(), 400);
        assert!(err.to_string().contains("Duplicate resource \"Patient/0\"."));
    }

    #[tokio::test]
    async fn referential_integrity_violation_aborts_the_transaction() {
        let p = processor();
        let entry = BundleEntry::request(
            BundleEntryRequest::new("POST", "Observation"),
            Some(json!({"resourceType": "Observation", "subject": {"reference": "Patient/0"}})),
        );
        let bundle = Bundle::with_entries(BundleType::Transaction, vec![entry]);
        let err = p.process(&bundle, PreferReturn::Representation).await.unwrap_err();
        assert_eq!(err.http_status(), 409);
    }

    #[tokio::test]
    async fn intra_bundle_reference_resolves_to_the_created_patients_assigned_id() {
        let p = processor();
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
        let bundle = Bundle::with_entries(BundleType::Transaction, vec![patient, observation]);
        let response = p.process(&bundle, PreferReturn::Representation).await.unwrap();
        let obs = response.entries()[1].resource.as_ref().unwrap();
        let reference = obs["subject"]["reference"].as_str().unwrap();
        assert!(reference.starts_with("Patient/"));
    }

    #[tokio::test]
    async fn optimistic_lock_failure_reports_exact_precondition_diagnostics() {
        let p = processor();
        let create = BundleEntry::request(BundleEntryRequest::new("PUT", "Patient/0"), Some(json!({"resourceType": "Patient", "id": "0"})));
        p.process(&Bundle::with_entries(BundleType::Transaction, vec![create]), PreferReturn::Representation).await.unwrap();

        let mut update_req = BundleEntryRequest::new("PUT", "Patient/0");
        update_req.if_match = Some("W/\"1\"".to_string());
        let update = BundleEntry::request(update_req, Some(json!({"resourceType": "Patient", "id": "0", "gender": "male"})));
        // Bump the resource to v2 first so the later If-Match: W/"1" is now stale.
        let bump = BundleEntry::request(BundleEntryRequest::new("PUT", "Patient/0"), Some(json!({"resourceType": "Patient", "id": "0", "active": true})));
        p.process(&Bundle::with_entries(BundleType::Transaction, vec![bump]), PreferReturn::Representation).await.unwrap();

        let err = p.process(&Bundle::with_entries(BundleType::Transaction, vec![update]), PreferReturn::Representation).await.unwrap_err();
        assert_eq!(err.http_status(), 412);
        assert_eq!(err.to_string(), "Precondition \"W/\"1\"\" failed on \"Patient/0\".");
    }
}
