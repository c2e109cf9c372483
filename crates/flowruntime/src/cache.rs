//! Node result cache keyed by a fingerprint of tool identity and inputs.

use flowcore::{RunInfo, Status, ToolDefinition, Value};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("only completed runs are cached, got {0}")]
    NotCompleted(Status),

    #[error("cache lock poisoned: {0}")]
    Poisoned(String),
}

/// Fingerprint of a node invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInfo {
    pub hash_id: String,
    pub cache_string: String,
}

/// A reusable result and the run that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRecord {
    pub run_id: String,
    pub flow_run_id: String,
    pub output: Value,
}

/// Fingerprint over the tool and the recorded inputs.
///
/// Recorded inputs carry connection names, never secrets, so connection
/// identity is part of the key without leaking credentials into it.
pub fn fingerprint(definition: &ToolDefinition, inputs: &HashMap<String, Value>) -> CacheInfo {
    let inputs: serde_json::Map<String, Value> =
        inputs.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    let cache_string = json!({
        "tool": definition.name,
        "type": definition.tool_type,
        "source": definition.source,
        "code": definition.code,
        "function": definition.function,
        "inputs": inputs,
    })
    .to_string();
    let hash_id = format!("{:x}", Sha256::digest(cache_string.as_bytes()));
    CacheInfo {
        hash_id,
        cache_string,
    }
}

pub trait CacheStore: Send + Sync {
    fn get(&self, info: &CacheInfo) -> Option<CacheRecord>;

    fn persist(&self, info: &CacheInfo, run: &RunInfo) -> Result<(), CacheError>;
}

/// Process-local cache; last writer wins on a shared fingerprint.
#[derive(Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, CacheRecord>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl CacheStore for InMemoryCache {
    fn get(&self, info: &CacheInfo) -> Option<CacheRecord> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&info.hash_id)
            .cloned()
    }

    fn persist(&self, info: &CacheInfo, run: &RunInfo) -> Result<(), CacheError> {
        if run.status != Status::Completed {
            return Err(CacheError::NotCompleted(run.status));
        }
        let record = CacheRecord {
            run_id: run.run_id.clone(),
            flow_run_id: run.flow_run_id.clone(),
            output: run.output.clone().unwrap_or(Value::Null),
        };
        self.entries
            .write()
            .map_err(|e| CacheError::Poisoned(e.to_string()))?
            .insert(info.hash_id.clone(), record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore::ToolType;

    fn inputs(q: &str) -> HashMap<String, Value> {
        HashMap::from([
            ("q".to_string(), json!(q)),
            ("conn".to_string(), json!("bing")),
        ])
    }

    #[test]
    fn fingerprint_is_stable_and_input_sensitive() {
        let def = ToolDefinition::new("search", ToolType::Python);
        let a = fingerprint(&def, &inputs("x"));
        assert_eq!(a, fingerprint(&def, &inputs("x")));
        assert_ne!(a.hash_id, fingerprint(&def, &inputs("y")).hash_id);

        let other = ToolDefinition::new("other", ToolType::Python);
        assert_ne!(a.hash_id, fingerprint(&other, &inputs("x")).hash_id);
        assert_eq!(a.hash_id.len(), 64);
    }

    #[test]
    fn only_completed_runs_are_stored() {
        let cache = InMemoryCache::new();
        let info = fingerprint(&ToolDefinition::new("t", ToolType::Python), &inputs("x"));

        let mut run = RunInfo::start("n", "flow_run", "run_1", "parent", None, "");
        run.status = Status::Failed;
        assert!(cache.persist(&info, &run).is_err());
        assert!(cache.get(&info).is_none());

        run.status = Status::Completed;
        run.output = Some(json!({"answer": 42}));
        cache.persist(&info, &run).unwrap();
        let hit = cache.get(&info).unwrap();
        assert_eq!(hit.run_id, "run_1");
        assert_eq!(hit.flow_run_id, "flow_run");
        assert_eq!(hit.output, json!({"answer": 42}));
    }
}
