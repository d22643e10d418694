//! In-memory `ResourceStore` implementation.
//!
//! Single-writer discipline: the whole write path — CAS validation, folding
//! mutations, and appending new versions — runs under one write-lock guard,
//! matching the "serializable against concurrent writers" requirement
//! without needing a real database. Readers take a read lock and see a
//! point-in-time-consistent snapshot.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::store::{apply_mutation, ResourceStore, StoredResource, WriteRequest, WriteResult};
use crate::version;

#[derive(Debug, Default)]
pub struct InMemoryResourceStore {
    entities: RwLock<HashMap<String, Vec<StoredResource>>>,
}

impl InMemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn split_entity(entity: &str) -> Result<(String, String)> {
        entity
            .split_once('/')
            .map(|(t, id)| (t.to_string(), id.to_string()))
            .ok_or_else(|| Error::fault(format!("malformed entity id \"{entity}\"")))
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    async fn read(&self, resource_type: &str, id: &str) -> Result<Option<StoredResource>> {
        let key = format!("{resource_type}/{id}");
        let entities = self.entities.read().await;
        Ok(entities.get(&key).and_then(|history| history.last()).cloned())
    }

    async fn read_as_of(
        &self,
        resource_type: &str,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<StoredResource>> {
        let key = format!("{resource_type}/{id}");
        let entities = self.entities.read().await;
        Ok(entities
            .get(&key)
            .and_then(|history| history.iter().rev().find(|r| r.transaction_time <= at))
            .cloned())
    }

    async fn history(
        &self,
        resource_type: &str,
        id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredResource>> {
        let key = format!("{resource_type}/{id}");
        let entities = self.entities.read().await;
        let mut items: Vec<StoredResource> = entities.get(&key).cloned().unwrap_or_default();
        if let Some(since) = since {
            items.retain(|r| r.transaction_time >= since);
        }
        items.reverse();
        Ok(items)
    }

    async fn current_version(&self, resource_type: &str, id: &str) -> Result<Option<i64>> {
        Ok(self.read(resource_type, id).await?.map(|r| r.version))
    }

    async fn write(&self, request: WriteRequest) -> Result<WriteResult> {
        let mut entities = self.entities.write().await;

        for guard in &request.cas_guards {
            let current = entities
                .get(&guard.entity)
                .and_then(|history| history.last())
                .map(|r| r.version);
            if current != guard.expected {
                return Err(Error::precondition_failed(format!(
                    "Precondition failed on \"{}\".",
                    guard.entity
                )));
            }
        }

        let mut docs: HashMap<String, serde_json::Value> = HashMap::new();
        for guard in &request.cas_guards {
            if !docs.contains_key(&guard.entity) {
                let existing = entities
                    .get(&guard.entity)
                    .and_then(|history| history.last())
                    .and_then(|r| r.content.clone())
                    .unwrap_or_else(|| json!({}));
                docs.insert(guard.entity.clone(), existing);
            }
        }
        for mutation in &request.mutations {
            let entity = mutation.entity().to_string();
            docs.entry(entity.clone()).or_insert_with(|| {
                entities
                    .get(&entity)
                    .and_then(|history| history.last())
                    .and_then(|r| r.content.clone())
                    .unwrap_or_else(|| json!({}))
            });
        }
        for mutation in &request.mutations {
            let doc = docs
                .get_mut(mutation.entity())
                .expect("seeded from cas guards and mutations above");
            apply_mutation(doc, mutation)?;
        }

        let transaction_time = Utc::now();
        let mut versions = HashMap::new();
        for guard in &request.cas_guards {
            let (resource_type, id) = Self::split_entity(&guard.entity)?;
            let deleted = version::is_deleted(guard.desired);
            let content = if deleted { None } else { docs.get(&guard.entity).cloned() };
            let record = StoredResource {
                resource_type,
                id,
                version: guard.desired,
                transaction_time,
                content,
            };
            entities.entry(guard.entity.clone()).or_default().push(record);
            versions.insert(guard.entity.clone(), guard.desired);
        }

        Ok(WriteResult {
            versions,
            transaction_time: Some(transaction_time),
        })
    }
}
