//! Per-bundle transaction context: the tempid table resolving references
//! between entries of the same bundle before anything is committed.

use std::collections::{HashMap, HashSet};

use cairn_store::CodeInterner;

pub type ResourceRef = (String, String);

#[derive(Default)]
pub struct TransactionContext {
    /// Maps an entry's `fullUrl` (or a bundle-relative `Type/id` target) to
    /// the `(type, id)` it resolves to once the bundle commits.
    tempids: HashMap<String, ResourceRef>,
    /// Every `(type, id)` that will exist once this bundle commits — already
    /// stored resources plus everything planned for creation in this bundle.
    /// Used only to decide whether a literal reference resolves.
    known_targets: HashSet<ResourceRef>,
    pub interner: CodeInterner,
}

impl TransactionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_tempid(&mut self, full_url: impl Into<String>, target: ResourceRef) {
        self.known_targets.insert(target.clone());
        self.tempids.insert(full_url.into(), target);
    }

    pub fn register_existing(&mut self, target: ResourceRef) {
        self.known_targets.insert(target);
    }

    pub fn resolve(&self, full_url: &str) -> Option<&ResourceRef> {
        self.tempids.get(full_url)
    }

    pub fn target_known(&self, target: &ResourceRef) -> bool {
        self.known_targets.contains(target)
    }
}
