//! In-memory `Store` test double. Backed by plain `BTreeMap`s rather than a
//! real database so the property tests don't need a running MongoDB
//! instance.
use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use ts_model::{
    DataDocument,
    DataType,
    EventDocument,
    Measurement,
    ValueTypeDescriptor,
};

use crate::{
    Store,
    StoreId,
};

#[derive(Default)]
struct PerType {
    metadata: Option<DataType>,
    measurements: BTreeMap<String, Measurement>,
    data_buckets: BTreeMap<StoreId, (String, DataDocument)>,
    event_buckets: BTreeMap<StoreId, EventDocument>,
}

#[derive(Default)]
struct Inner {
    types: BTreeMap<String, PerType>,
    next_id: u64,
}

impl Inner {
    fn fresh_id(&mut self) -> StoreId {
        self.next_id += 1;
        StoreId(self.next_id.to_string())
    }
}

/// In-memory `Store`. Seed it directly (e.g. `store.seed_metadata(...)`) in
/// tests rather than going through a setup RPC.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_metadata(&self, data_type: DataType) {
        let mut inner = self.inner.lock();
        inner.types.entry(data_type.name.clone()).or_default().metadata = Some(data_type);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_metadata(&self, data_type: &str) -> anyhow::Result<Option<DataType>> {
        Ok(self
            .inner
            .lock()
            .types
            .get(data_type)
            .and_then(|t| t.metadata.clone()))
    }

    async fn add_value_types(
        &self,
        data_type: &str,
        additions: BTreeMap<String, ValueTypeDescriptor>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .types
            .get_mut(data_type)
            .and_then(|t| t.metadata.as_mut())
            .ok_or_else(|| anyhow::anyhow!("metadata document missing for {data_type}"))?;
        entry.values.extend(additions);
        Ok(())
    }

    async fn list_data_types(&self, ignore: &[String]) -> anyhow::Result<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .types
            .iter()
            .filter(|(name, t)| {
                t.metadata.is_some() && !name.starts_with('_') && !ignore.iter().any(|i| i == *name)
            })
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn find_active_measurement(
        &self,
        data_type: &str,
        identifier: &str,
    ) -> anyhow::Result<Option<Measurement>> {
        Ok(self
            .inner
            .lock()
            .types
            .get(data_type)
            .and_then(|t| t.measurements.get(identifier))
            .filter(|m| m.is_active())
            .cloned())
    }

    async fn insert_measurement(
        &self,
        data_type: &str,
        measurement: Measurement,
    ) -> anyhow::Result<()> {
        self.inner
            .lock()
            .types
            .entry(data_type.to_owned())
            .or_default()
            .measurements
            .insert(measurement.identifier.clone(), measurement);
        Ok(())
    }

    async fn find_data_bucket(
        &self,
        data_type: &str,
        identifier: &str,
        start: i64,
        end: i64,
    ) -> anyhow::Result<Option<(StoreId, DataDocument)>> {
        let inner = self.inner.lock();
        Ok(inner.types.get(data_type).and_then(|t| {
            t.data_buckets.iter().find_map(|(id, (ident, doc))| {
                (ident == identifier && doc.start == start && doc.end == end)
                    .then(|| (id.clone(), doc.clone()))
            })
        }))
    }

    async fn find_overlapping_data_buckets(
        &self,
        data_type: &str,
        identifier: &str,
        start: i64,
        end: i64,
    ) -> anyhow::Result<Vec<(StoreId, DataDocument)>> {
        let inner = self.inner.lock();
        Ok(inner
            .types
            .get(data_type)
            .map(|t| {
                t.data_buckets
                    .iter()
                    .filter(|(_, (ident, doc))| ident == identifier && doc.overlaps(start, end))
                    .map(|(id, (_, doc))| (id.clone(), doc.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_data_buckets(
        &self,
        data_type: &str,
        buckets: Vec<DataDocument>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        for bucket in buckets {
            let id = inner.fresh_id();
            let identifier = bucket.measurement_identifier.clone();
            inner
                .types
                .entry(data_type.to_owned())
                .or_default()
                .data_buckets
                .insert(id, (identifier, bucket));
        }
        Ok(())
    }

    async fn update_data_bucket(
        &self,
        data_type: &str,
        id: &StoreId,
        bucket: DataDocument,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let identifier = bucket.measurement_identifier.clone();
        inner
            .types
            .entry(data_type.to_owned())
            .or_default()
            .data_buckets
            .insert(id.clone(), (identifier, bucket));
        Ok(())
    }

    async fn delete_data_buckets(&self, data_type: &str, ids: &[StoreId]) -> anyhow::Result<()> {
        if let Some(t) = self.inner.lock().types.get_mut(data_type) {
            for id in ids {
                t.data_buckets.remove(id);
            }
        }
        Ok(())
    }

    async fn find_event_bucket(
        &self,
        data_type: &str,
        start: i64,
        end: i64,
    ) -> anyhow::Result<Option<(StoreId, EventDocument)>> {
        let inner = self.inner.lock();
        Ok(inner.types.get(data_type).and_then(|t| {
            t.event_buckets
                .iter()
                .find(|(_, doc)| doc.start == start && doc.end == end)
                .map(|(id, doc)| (id.clone(), doc.clone()))
        }))
    }

    async fn insert_event_bucket(
        &self,
        data_type: &str,
        bucket: EventDocument,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let id = inner.fresh_id();
        inner
            .types
            .entry(data_type.to_owned())
            .or_default()
            .event_buckets
            .insert(id, bucket);
        Ok(())
    }

    async fn update_event_bucket(
        &self,
        data_type: &str,
        id: &StoreId,
        bucket: EventDocument,
    ) -> anyhow::Result<()> {
        self.inner
            .lock()
            .types
            .entry(data_type.to_owned())
            .or_default()
            .event_buckets
            .insert(id.clone(), bucket);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ts_model::{
        DataDocument,
        DataType,
    };

    use super::*;

    #[tokio::test]
    async fn insert_and_find_roundtrip() {
        let store = MemoryStore::new();
        store.seed_metadata(DataType::new("cpu"));
        let bucket = DataDocument {
            data_type: "cpu".into(),
            measurement_identifier: "host-1".into(),
            interval: 10,
            start: 0,
            end: 3600,
            value_types: BTreeMap::new(),
            data_points: Vec::new(),
        };
        store
            .insert_data_buckets("cpu", vec![bucket.clone()])
            .await
            .unwrap();
        let (_, found) = store
            .find_data_bucket("cpu", "host-1", 0, 3600)
            .await
            .unwrap()
            .expect("bucket should be found");
        assert_eq!(found, bucket);
    }

    #[tokio::test]
    async fn overlap_query_matches_half_open_range() {
        let store = MemoryStore::new();
        store.seed_metadata(DataType::new("cpu"));
        let old = DataDocument {
            data_type: "cpu".into(),
            measurement_identifier: "host-1".into(),
            interval: 60,
            start: 0,
            end: 3600,
            value_types: BTreeMap::new(),
            data_points: Vec::new(),
        };
        store.insert_data_buckets("cpu", vec![old]).await.unwrap();
        let overlaps = store
            .find_overlapping_data_buckets("cpu", "host-1", 1800, 5400)
            .await
            .unwrap();
        assert_eq!(overlaps.len(), 1);
        let none = store
            .find_overlapping_data_buckets("cpu", "host-1", 3600, 7200)
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
