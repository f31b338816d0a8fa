//! An in-process cache of `DataType` descriptors, refreshable from the
//! store. Readers see either the pre- or post-refresh snapshot, never a
//! torn view, by taking a snapshot behind `ArcSwap` and replacing it
//! atomically on `refresh`.
use std::{
    collections::BTreeMap,
    sync::Arc,
};

use arc_swap::ArcSwap;
use store::Store;
use ts_model::DataType;

/// Known data types, refreshable from the store. Names beginning with `_`
/// and names in `ignore_databases` are never loaded.
pub struct DataTypeRegistry {
    snapshot: ArcSwap<BTreeMap<String, DataType>>,
    ignore_databases: Vec<String>,
}

impl DataTypeRegistry {
    pub fn new(ignore_databases: Vec<String>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(BTreeMap::new()),
            ignore_databases,
        }
    }

    /// `None` if `name` has never been loaded (or a refresh hasn't found
    /// it yet).
    pub fn get(&self, name: &str) -> Option<DataType> {
        self.snapshot.load().get(name).cloned()
    }

    /// Reload every non-ignored data type from the store and replace the
    /// snapshot atomically. On failure the registry is left unchanged
    /// -- the caller sees the error and aborts the batch.
    pub async fn refresh(&self, store: &dyn Store) -> anyhow::Result<()> {
        let names = store.list_data_types(&self.ignore_databases).await?;
        let mut next = BTreeMap::new();
        for name in names {
            if let Some(data_type) = store.find_metadata(&name).await? {
                next.insert(name, data_type);
            }
        }
        self.snapshot.store(Arc::new(next));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use store::MemoryStore;
    use ts_model::DataType;

    use super::*;

    #[tokio::test]
    async fn refresh_loads_non_ignored_types() {
        let store = MemoryStore::new();
        store.seed_metadata(DataType::new("cpu"));
        store.seed_metadata(DataType::new("_internal"));
        let registry = DataTypeRegistry::new(vec!["ignored".to_owned()]);
        registry.refresh(&store).await.unwrap();
        assert!(registry.get("cpu").is_some());
        assert!(registry.get("_internal").is_none());
    }

    #[tokio::test]
    async fn unknown_type_is_none_before_refresh() {
        let registry = DataTypeRegistry::new(Vec::new());
        assert!(registry.get("cpu").is_none());
    }
}
