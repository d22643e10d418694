//! The Resource Store's operation contract: `read`, `read_as_of`, `history`,
//! and the sole mutation primitive, `write`, which applies a mutation set
//! under a set of CAS guards.
//!
//! A write is, in spirit, a set of `{add|retract, entity, attribute, value}`
//! tuples against a generic entity/attribute/value log (the data model's own
//! words). Concretely, every mutation in this crate targets a top-level
//! resource entity (`"Type/id"`) and an [`ElementPath`] into that resource's
//! JSON tree — nested composite children and contained resources are
//! addressed by path under their owning resource's entity rather than as
//! independently-keyed entities, since nothing in this system reads them
//! except through their parent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Field(String),
    Index(usize),
}

/// A path into a resource's JSON tree, built left-to-right from the root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementPath(pub Vec<Segment>);

impl ElementPath {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.0.push(Segment::Field(name.into()));
        self
    }

    pub fn index(mut self, i: usize) -> Self {
        self.0.push(Segment::Index(i));
        self
    }

    pub fn join(&self, tail: &ElementPath) -> ElementPath {
        let mut segments = self.0.clone();
        segments.extend(tail.0.clone());
        ElementPath(segments)
    }
}

#[derive(Debug, Clone)]
pub enum Mutation {
    /// Sets a card-one field (primitive or composite) to `value`, overwriting
    /// whatever was there.
    SetScalar { entity: String, path: ElementPath, value: Value },
    /// Removes a card-one field entirely.
    UnsetScalar { entity: String, path: ElementPath },
    /// Appends `value` to the card-many collection at `path`.
    AddToSet { entity: String, path: ElementPath, value: Value },
    /// Removes the element deep-equal to `value` from the card-many
    /// collection at `path`.
    RemoveFromSet { entity: String, path: ElementPath, value: Value },
}

impl Mutation {
    pub fn entity(&self) -> &str {
        match self {
            Mutation::SetScalar { entity, .. }
            | Mutation::UnsetScalar { entity, .. }
            | Mutation::AddToSet { entity, .. }
            | Mutation::RemoveFromSet { entity, .. } => entity,
        }
    }
}

/// A compare-and-swap guard on an entity's version. `expected = None` means
/// the entity must not already exist (the create path); `Some(v)` means its
/// current raw version token must equal `v`.
#[derive(Debug, Clone)]
pub struct CasGuard {
    pub entity: String,
    pub expected: Option<i64>,
    pub desired: i64,
}

#[derive(Debug, Clone, Default)]
pub struct WriteRequest {
    pub mutations: Vec<Mutation>,
    pub cas_guards: Vec<CasGuard>,
}

#[derive(Debug, Clone, Default)]
pub struct WriteResult {
    /// The raw version token each touched entity now has, keyed by entity id.
    pub versions: std::collections::HashMap<String, i64>,
    pub transaction_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct StoredResource {
    pub resource_type: String,
    pub id: String,
    /// Raw version token (see [`crate::version`]); `None` content means a
    /// tombstone — callers decide whether to surface it as 410 or hide it.
    pub version: i64,
    pub transaction_time: DateTime<Utc>,
    pub content: Option<Value>,
}

impl StoredResource {
    pub fn entity_id(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn read(&self, resource_type: &str, id: &str) -> Result<Option<StoredResource>>;

    async fn read_as_of(
        &self,
        resource_type: &str,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<StoredResource>>;

    /// Newest first.
    async fn history(
        &self,
        resource_type: &str,
        id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredResource>>;

    async fn current_version(&self, resource_type: &str, id: &str) -> Result<Option<i64>>;

    async fn write(&self, request: WriteRequest) -> Result<WriteResult>;
}

/// Folds a mutation onto a resource document, creating intermediate objects
/// and arrays as needed. Returns `Fault` if a path expects an object/array
/// shape the document does not have — unreachable from well-formed Upsert
/// Engine output, but the store must not panic on it.
pub fn apply_mutation(doc: &mut Value, mutation: &Mutation) -> Result<()> {
    match mutation {
        Mutation::SetScalar { path, value, .. } => set_scalar(doc, &path.0, value.clone()),
        Mutation::UnsetScalar { path, .. } => {
            unset_scalar(doc, &path.0);
            Ok(())
        }
        Mutation::AddToSet { path, value, .. } => add_to_set(doc, &path.0, value.clone()),
        Mutation::RemoveFromSet { path, value, .. } => {
            remove_from_set(doc, &path.0, value);
            Ok(())
        }
    }
}

fn ensure_path_mut<'a>(doc: &'a mut Value, path: &[Segment]) -> Result<&'a mut Value> {
    let mut current = doc;
    for segment in path {
        current = match segment {
            Segment::Field(key) => {
                if !current.is_object() {
                    if current.is_null() {
                        *current = Value::Object(Default::default());
                    } else {
                        return Err(crate::error::Error::fault(format!(
                            "cannot descend into field \"{key}\": node is not an object"
                        )));
                    }
                }
                current
                    .as_object_mut()
                    .expect("just normalized to object")
                    .entry(key.clone())
                    .or_insert(Value::Null)
            }
            Segment::Index(i) => {
                if !current.is_array() {
                    if current.is_null() {
                        *current = Value::Array(Vec::new());
                    } else {
                        return Err(crate::error::Error::fault(format!(
                            "cannot descend into index {i}: node is not an array"
                        )));
                    }
                }
                let arr = current.as_array_mut().expect("just normalized to array");
                while arr.len() <= *i {
                    arr.push(Value::Null);
                }
                &mut arr[*i]
            }
        };
    }
    Ok(current)
}

fn set_scalar(doc: &mut Value, path: &[Segment], value: Value) -> Result<()> {
    if path.is_empty() {
        *doc = value;
        return Ok(());
    }
    let target = ensure_path_mut(doc, path)?;
    *target = value;
    Ok(())
}

fn unset_scalar(doc: &mut Value, path: &[Segment]) {
    if path.is_empty() {
        *doc = Value::Null;
        return;
    }
    let (last, parent_path) = path.split_last().expect("checked non-empty");
    let Some(parent) = navigate(doc, parent_path) else {
        return;
    };
    match last {
        Segment::Field(key) => {
            if let Some(obj) = parent.as_object_mut() {
                obj.remove(key);
            }
        }
        Segment::Index(i) => {
            if let Some(arr) = parent.as_array_mut() {
                if *i < arr.len() {
                    arr.remove(*i);
                }
            }
        }
    }
}

fn add_to_set(doc: &mut Value, path: &[Segment], value: Value) -> Result<()> {
    let target = ensure_path_mut(doc, path)?;
    if !target.is_array() {
        if target.is_null() {
            *target = Value::Array(Vec::new());
        } else {
            return Err(crate::error::Error::fault(
                "cannot add to a non-array card-many field".to_string(),
            ));
        }
    }
    target.as_array_mut().expect("just normalized to array").push(value);
    Ok(())
}

fn remove_from_set(doc: &mut Value, path: &[Segment], value: &Value) {
    let Some(target) = navigate(doc, path) else {
        return;
    };
    if let Some(arr) = target.as_array_mut() {
        if let Some(pos) = arr.iter().position(|v| v == value) {
            arr.remove(pos);
        }
    }
}

fn navigate<'a>(doc: &'a mut Value, path: &[Segment]) -> Option<&'a mut Value> {
    let mut current = doc;
    for segment in path {
        current = match segment {
            Segment::Field(key) => current.as_object_mut()?.get_mut(key)?,
            Segment::Index(i) => current.as_array_mut()?.get_mut(*i)?,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_scalar_creates_intermediate_objects() {
        let mut doc = json!({});
        set_scalar(&mut doc, &ElementPath::new().field("gender").0, json!("male")).unwrap();
        assert_eq!(doc["gender"], "male");
    }

    #[test]
    fn unset_scalar_removes_the_field() {
        let mut doc = json!({"gender": "male"});
        unset_scalar(&mut doc, &ElementPath::new().field("gender").0);
        assert!(doc.get("gender").is_none());
    }

    #[test]
    fn add_and_remove_from_set_round_trip() {
        let mut doc = json!({});
        add_to_set(&mut doc, &ElementPath::new().field("identifier").0, json!({"system": "a", "value": "1"})).unwrap();
        add_to_set(&mut doc, &ElementPath::new().field("identifier").0, json!({"system": "b", "value": "2"})).unwrap();
        assert_eq!(doc["identifier"].as_array().unwrap().len(), 2);
        remove_from_set(&mut doc, &ElementPath::new().field("identifier").0, &json!({"system": "a", "value": "1"}));
        assert_eq!(doc["identifier"].as_array().unwrap().len(), 1);
        assert_eq!(doc["identifier"][0]["system"], "b");
    }

    #[test]
    fn set_scalar_can_target_an_index_inside_an_array() {
        let mut doc = json!({"name": [{"family": "Smith"}]});
        set_scalar(&mut doc, &ElementPath::new().field("name").index(0).field("given").0, json!(["Jo"])).unwrap();
        assert_eq!(doc["name"][0]["given"][0], "Jo");
    }
}
