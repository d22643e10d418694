//! Code interning: `(system, version, code)` triples are deduplicated to a
//! single storage entity, addressed by the concatenation of the triple.
//! Interning is idempotent — concurrent callers asking for the same triple
//! converge on the same entity id without racing a create.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodeKey {
    pub system: String,
    pub version: Option<String>,
    pub code: String,
}

impl CodeKey {
    pub fn new(system: impl Into<String>, version: Option<String>, code: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            version,
            code: code.into(),
        }
    }

    /// Entity id this triple interns to: `"<system>|<version>|<code>"`.
    pub fn entity_id(&self) -> String {
        format!("{}|{}|{}", self.system, self.version.as_deref().unwrap_or(""), self.code)
    }
}

#[derive(Debug, Default)]
pub struct CodeInterner {
    entities: Mutex<HashMap<String, CodeKey>>,
}

pub struct Interned {
    pub entity_id: String,
    /// `true` if this call is the first to intern this triple — callers use
    /// this to decide whether to emit a code-creation mutation.
    pub newly_created: bool,
}

impl CodeInterner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&self, key: CodeKey) -> Interned {
        let entity_id = key.entity_id();
        let mut entities = self.entities.lock().expect("code interner mutex poisoned");
        let newly_created = !entities.contains_key(&entity_id);
        entities.entry(entity_id.clone()).or_insert(key);
        Interned { entity_id, newly_created }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_triple_interns_to_the_same_entity_once() {
        let interner = CodeInterner::new();
        let key = CodeKey::new("http://loinc.org", None, "29463-7");
        let first = interner.intern(key.clone());
        let second = interner.intern(key);
        assert_eq!(first.entity_id, second.entity_id);
        assert!(first.newly_created);
        assert!(!second.newly_created);
    }

    #[test]
    fn distinct_versions_of_the_same_system_and_code_are_distinct_entities() {
        let interner = CodeInterner::new();
        let v1 = interner.intern(CodeKey::new("sys", Some("1".into()), "C"));
        let v2 = interner.intern(CodeKey::new("sys", Some("2".into()), "C"));
        assert_ne!(v1.entity_id, v2.entity_id);
    }
}
