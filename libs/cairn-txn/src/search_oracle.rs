//! The Search Oracle: an external collaborator consumed only to evaluate a
//! conditional create's `ifNoneExist` predicate. The real FHIR
//! search-parameter evaluator is out of scope here; this module is the
//! trait boundary plus a minimal in-memory reference implementation
//! sufficient to exercise conditional-create scenarios end to end.

use async_trait::async_trait;
use cairn_store::ResourceStore;

#[derive(Debug, Clone)]
pub struct SearchMatch {
    pub resource_type: String,
    pub id: String,
    pub version: i64,
}

#[async_trait]
pub trait SearchOracle: Send + Sync {
    /// Returns the total match count and, per the response-message contract,
    /// only the first two matches (enough to report a multiple-match
    /// conflict without materializing the whole result set).
    async fn search(&self, resource_type: &str, query: &str) -> cairn_store::Result<(usize, Vec<SearchMatch>)>;
}

/// Evaluates `identifier=<value>` and `birthdate=<value>` against every
/// current, non-deleted resource of the given type — enough to drive the
/// conditional-create scenarios without a real search-parameter index.
pub struct NaiveSearchOracle<S: ResourceStore> {
    store: std::sync::Arc<S>,
    index: tokio::sync::RwLock<std::collections::HashMap<(String, String), Vec<(String, String)>>>,
}

impl<S: ResourceStore> NaiveSearchOracle<S> {
    pub fn new(store: std::sync::Arc<S>) -> Self {
        Self {
            store,
            index: tokio::sync::RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// Registers `(type, id)` as carrying `param=value`, e.g. from the
    /// transaction processor right after a commit, so later conditional
    /// creates in the same run can find it. A throwaway stand-in for a real
    /// search-parameter indexer.
    pub async fn index(&self, resource_type: &str, id: &str, param: &str, value: &str) {
        let mut index = self.index.write().await;
        index
            .entry((resource_type.to_string(), param.to_string()))
            .or_default()
            .push((value.to_string(), id.to_string()));
    }
}

#[async_trait]
impl<S: ResourceStore> SearchOracle for NaiveSearchOracle<S> {
    async fn search(&self, resource_type: &str, query: &str) -> cairn_store::Result<(usize, Vec<SearchMatch>)> {
        let Some((param, value)) = query.split_once('=') else {
            return Ok((0, Vec::new()));
        };
        let decoded_value = urlencoding::decode(value).map(|c| c.into_owned()).unwrap_or_else(|_| value.to_string());

        let index = self.index.read().await;
        let Some(entries) = index.get(&(resource_type.to_string(), param.to_string())) else {
            return Ok((0, Vec::new()));
        };

        let mut matches = Vec::new();
        for (indexed_value, id) in entries {
            if indexed_value == &decoded_value {
                if let Some(resource) = self.store.read(resource_type, id).await? {
                    if resource.content.is_some() {
                        matches.push(SearchMatch {
                            resource_type: resource_type.to_string(),
                            id: resource.id,
                            version: resource.version,
                        });
                    }
                }
            }
        }
        let count = matches.len();
        matches.truncate(2);
        Ok((count, matches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_store::{CasGuard, ElementPath, InMemoryResourceStore, Mutation, WriteRequest};
    use cairn_store::version::{initial, CreationMode};

    async fn store_with_patient(id: &str) -> std::sync::Arc<InMemoryResourceStore> {
        let store = std::sync::Arc::new(InMemoryResourceStore::new());
        store
            .write(WriteRequest {
                mutations: vec![Mutation::SetScalar {
                    entity: format!("Patient/{id}"),
                    path: ElementPath::new(),
                    value: serde_json::json!({"resourceType": "Patient"}),
                }],
                cas_guards: vec![CasGuard {
                    entity: format!("Patient/{id}"),
                    expected: None,
                    desired: initial(CreationMode::ServerAssigned),
                }],
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn zero_matches_when_nothing_indexed() {
        let store = store_with_patient("0").await;
        let oracle = NaiveSearchOracle::new(store);
        let (count, matches) = oracle.search("Patient", "identifier=150015").await.unwrap();
        assert_eq!(count, 0);
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn exactly_one_match_is_returned_in_full() {
        let store = store_with_patient("0").await;
        let oracle = NaiveSearchOracle::new(store);
        oracle.index("Patient", "0", "identifier", "095156").await;
        let (count, matches) = oracle.search("Patient", "identifier=095156").await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(matches[0].id, "0");
    }

    #[tokio::test]
    async fn multiple_matches_reports_count_but_caps_returned_matches_at_two() {
        let store = std::sync::Arc::new(InMemoryResourceStore::new());
        for id in ["0", "1", "2"] {
            store
                .write(WriteRequest {
                    mutations: vec![Mutation::SetScalar {
                        entity: format!("Patient/{id}"),
                        path: ElementPath::new(),
                        value: serde_json::json!({"resourceType": "Patient"}),
                    }],
                    cas_guards: vec![CasGuard {
                        entity: format!("Patient/{id}"),
                        expected: None,
                        desired: initial(CreationMode::ServerAssigned),
                    }],
                })
                .await
                .unwrap();
        }
        let oracle = NaiveSearchOracle::new(store);
        for id in ["0", "1", "2"] {
            oracle.index("Patient", id, "birthdate", "2020").await;
        }
        let (count, matches) = oracle.search("Patient", "birthdate=2020").await.unwrap();
        assert_eq!(count, 3);
        assert_eq!(matches.len(), 2);
    }
}
