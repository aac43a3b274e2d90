use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::error::SyncError;
use crate::metrics;
use crate::model::ItemId;

/// A full business record as held by both peers. Only `id` crosses the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub id: ItemId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl CatalogRecord {
    pub fn new(id: impl Into<ItemId>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("catalog json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duplicate catalog id {0:?}")]
    DuplicateId(ItemId),
    #[error("catalog record with empty id")]
    EmptyId,
}

/// Lookup from identifier to full record, identical on both peers.
pub trait CatalogResolver: Send + Sync {
    fn name(&self) -> &str {
        "catalog"
    }

    fn resolve_by_id(&self, id: &str) -> Option<CatalogRecord>;

    /// Best effort: unknown ids are skipped with a warning, order is kept.
    fn resolve_by_ids(&self, ids: &[ItemId]) -> Vec<CatalogRecord> {
        ids.iter()
            .filter_map(|id| {
                let record = self.resolve_by_id(id);
                if record.is_none() {
                    metrics::CATALOG_UNRESOLVED
                        .with_label_values(&[self.name()])
                        .inc();
                    let err = SyncError::UnresolvedReference(id.clone());
                    warn!(
                        target = "costate::catalog",
                        catalog = self.name(),
                        error = %err,
                        "skipping unresolved id"
                    );
                }
                record
            })
            .collect()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogFile {
    Records(Vec<CatalogRecord>),
    Wrapped { records: Vec<CatalogRecord> },
}

/// In-memory catalog loaded once per session.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    name: String,
    records: HashMap<ItemId, CatalogRecord>,
}

impl StaticCatalog {
    pub fn new(
        name: impl Into<String>,
        records: impl IntoIterator<Item = CatalogRecord>,
    ) -> Result<Self, CatalogError> {
        let mut map = HashMap::new();
        for record in records {
            if record.id.is_empty() {
                return Err(CatalogError::EmptyId);
            }
            if map.contains_key(&record.id) {
                return Err(CatalogError::DuplicateId(record.id));
            }
            map.insert(record.id.clone(), record);
        }
        Ok(Self {
            name: name.into(),
            records: map,
        })
    }

    pub fn empty() -> Self {
        Self {
            name: "empty".into(),
            records: HashMap::new(),
        }
    }

    /// Accepts a JSON array of records or an object with a `records` array.
    pub fn from_json_str(name: impl Into<String>, raw: &str) -> Result<Self, CatalogError> {
        let records = match serde_json::from_str::<CatalogFile>(raw)? {
            CatalogFile::Records(records) => records,
            CatalogFile::Wrapped { records } => records,
        };
        Self::new(name, records)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("catalog")
            .to_string();
        Self::from_json_str(name, &raw)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl CatalogResolver for StaticCatalog {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve_by_id(&self, id: &str) -> Option<CatalogRecord> {
        self.records.get(id).cloned()
    }
}
