use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::error;

use crate::model::StickyBucketAssignmentDoc;

/// Builds the store key for a given hash attribute name/value pair.
pub fn doc_key(attribute_name: &str, attribute_value: &str) -> String {
    format!("{}||{}", attribute_name, attribute_value)
}

/// Builds the `assignments` map key for a given experiment key and bucket version.
pub fn assignment_key(experiment_key: &str, bucket_version: u32) -> String {
    format!("{}__{}", experiment_key, bucket_version)
}

/// Persists prior experiment assignments so a user keeps the same variation
/// across catalog/experiment-version changes. Implementations are shared
/// across a client and all of its child clones unless explicitly overridden.
pub trait StickyBucketService: Send + Sync {
    fn get_assignments(&self, attribute_name: &str, attribute_value: &str) -> Option<StickyBucketAssignmentDoc>;

    fn save_assignments(&self, doc: &StickyBucketAssignmentDoc);

    /// Looks up assignments for every `(attribute, value)` pair, keyed by
    /// `doc_key`. Missing pairs are simply absent from the result.
    fn get_all_assignments(&self, attributes: &HashMap<String, String>) -> HashMap<String, StickyBucketAssignmentDoc> {
        let mut result = HashMap::new();
        for (attribute_name, attribute_value) in attributes {
            if let Some(doc) = self.get_assignments(attribute_name, attribute_value) {
                result.insert(doc_key(attribute_name, attribute_value), doc);
            }
        }
        result
    }
}

/// Merges `incoming` into `existing` without ever discarding a previously
/// saved assignment key (`GrowthBookError`-free: sticky docs can only grow).
/// Returns `true` if anything actually changed, so callers can skip a
/// redundant write when the assignment is already persisted.
pub fn merge_assignments(existing: &mut StickyBucketAssignmentDoc, incoming: &HashMap<String, String>) -> bool {
    let mut changed = false;
    for (key, value) in incoming {
        if existing.assignments.get(key) != Some(value) {
            existing.assignments.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

/// Default in-memory sticky-bucket store, guarded by a readers-writer lock
/// the way the teacher crate guards its feature cache in `FeatureRepository`.
#[derive(Debug, Default)]
pub struct InMemoryStickyBucketService {
    docs: Arc<RwLock<HashMap<String, StickyBucketAssignmentDoc>>>,
}

impl InMemoryStickyBucketService {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StickyBucketService for InMemoryStickyBucketService {
    fn get_assignments(&self, attribute_name: &str, attribute_value: &str) -> Option<StickyBucketAssignmentDoc> {
        match self.docs.read() {
            Ok(docs) => docs.get(&doc_key(attribute_name, attribute_value)).cloned(),
            Err(_) => {
                error!("sticky bucket store lock poisoned on read");
                None
            }
        }
    }

    fn save_assignments(&self, doc: &StickyBucketAssignmentDoc) {
        let key = doc_key(&doc.attribute_name, &doc.attribute_value);
        match self.docs.write() {
            Ok(mut docs) => {
                let entry = docs.entry(key).or_insert_with(|| StickyBucketAssignmentDoc {
                    attribute_name: doc.attribute_name.clone(),
                    attribute_value: doc.attribute_value.clone(),
                    assignments: HashMap::new(),
                });
                merge_assignments(entry, &doc.assignments);
            }
            Err(_) => error!("sticky bucket store lock poisoned on write"),
        }
    }
}
