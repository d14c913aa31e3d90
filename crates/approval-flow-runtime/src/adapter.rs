use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use approval_flow_core::{EngineError, EntitySnapshot};
use serde_json::Value;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AdapterError {
    #[error("{entity_type}/{entity_id} does not exist")]
    NotFound {
        entity_type: String,
        entity_id: String,
    },
    #[error("snapshot source unavailable: {0}")]
    Unavailable(String),
}

/// Source of point-in-time snapshots for one entity type. Implementations
/// must be side-effect free; the runtime may call them on every step entry.
pub trait EntityAdapter: Send + Sync {
    fn entity_type(&self) -> &str;

    /// # Errors
    /// Returns [`AdapterError`] when the record is unknown or unreachable.
    fn snapshot(&self, entity_id: &str) -> Result<EntitySnapshot, AdapterError>;
}

/// Lookup table from `entity_type` to its adapter.
#[derive(Default, Clone)]
pub struct EntityAdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn EntityAdapter>>,
}

impl EntityAdapterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any adapter already registered for the same type.
    pub fn register(&mut self, adapter: Arc<dyn EntityAdapter>) {
        self.adapters
            .insert(adapter.entity_type().to_string(), adapter);
    }

    #[must_use]
    pub fn entity_types(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }

    /// # Errors
    /// Returns [`EngineError::SnapshotUnavailable`] when no adapter serves
    /// `entity_type` or the adapter fails.
    pub fn snapshot(&self, entity_type: &str, entity_id: &str) -> Result<EntitySnapshot, EngineError> {
        let unavailable = |reason: String| EngineError::SnapshotUnavailable {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            reason,
        };
        let adapter = self
            .adapters
            .get(entity_type)
            .ok_or_else(|| unavailable("no entity adapter registered".to_string()))?;
        adapter
            .snapshot(entity_id)
            .map_err(|err| unavailable(err.to_string()))
    }
}

/// In-memory adapter whose records can be replaced while instances run.
pub struct StaticEntityAdapter {
    entity_type: String,
    records: RwLock<BTreeMap<String, EntitySnapshot>>,
}

impl StaticEntityAdapter {
    #[must_use]
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            records: RwLock::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn with_record(self, entity_id: impl Into<String>, snapshot: EntitySnapshot) -> Self {
        self.insert(entity_id, snapshot);
        self
    }

    pub fn insert(&self, entity_id: impl Into<String>, snapshot: EntitySnapshot) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity_id.into(), snapshot);
    }

    pub fn remove(&self, entity_id: &str) -> Option<EntitySnapshot> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(entity_id)
    }
}

impl EntityAdapter for StaticEntityAdapter {
    fn entity_type(&self) -> &str {
        &self.entity_type
    }

    fn snapshot(&self, entity_id: &str) -> Result<EntitySnapshot, AdapterError> {
        self.records
            .read()
            .map_err(|_| AdapterError::Unavailable("record table lock poisoned".to_string()))?
            .get(entity_id)
            .cloned()
            .ok_or_else(|| AdapterError::NotFound {
                entity_type: self.entity_type.clone(),
                entity_id: entity_id.to_string(),
            })
    }
}

/// Builds one adapter per entity type from
/// `{ "<entity_type>": { "<entity_id>": { "<field>": scalar } } }`.
///
/// # Errors
/// Returns [`EngineError::Configuration`] when the document has another shape.
pub fn static_adapters_from_json(value: &Value) -> Result<Vec<StaticEntityAdapter>, EngineError> {
    let parsed: BTreeMap<String, BTreeMap<String, EntitySnapshot>> =
        serde_json::from_value(value.clone()).map_err(|err| {
            EngineError::Configuration(format!("invalid entity snapshot document: {err}"))
        })?;

    Ok(parsed
        .into_iter()
        .map(|(entity_type, records)| {
            let adapter = StaticEntityAdapter::new(entity_type);
            for (entity_id, snapshot) in records {
                adapter.insert(entity_id, snapshot);
            }
            adapter
        })
        .collect())
}
