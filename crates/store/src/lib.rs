//! Document-store abstraction: a `Store` trait over the four
//! per-data-type collections (`measurements`, `data`, `event`, `metadata`),
//! a MongoDB-backed production implementation, and an in-memory test
//! double.
pub mod memory;
pub mod mongo;

use std::collections::BTreeMap;

use async_trait::async_trait;
use ts_model::{
    DataDocument,
    DataType,
    EventDocument,
    Measurement,
    ValueTypeDescriptor,
};

pub use crate::{
    memory::MemoryStore,
    mongo::MongoStore,
};

/// Opaque handle to a stored document, used only to name it for deletion.
/// `MongoStore` holds the driver's `ObjectId` hex string here; `MemoryStore`
/// holds a locally minted sequence number.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreId(pub String);

/// Per-data-type document store. Every method takes `data_type` because
/// each data type owns its own four collections.
#[async_trait]
pub trait Store: Send + Sync {
    /// The data type's metadata/schema document, or `None` if it has never
    /// been created.
    async fn find_metadata(&self, data_type: &str) -> anyhow::Result<Option<DataType>>;

    /// Declare `additions` on the data type's metadata document, merging
    /// with whatever value types are already there. Fails if the
    /// metadata document does not exist.
    async fn add_value_types(
        &self,
        data_type: &str,
        additions: BTreeMap<String, ValueTypeDescriptor>,
    ) -> anyhow::Result<()>;

    /// Names of every data type with a metadata document, excluding any in
    /// `ignore` and any starting with `_`.
    async fn list_data_types(&self, ignore: &[String]) -> anyhow::Result<Vec<String>>;

    /// The active (`end = None`) measurement record for `identifier`, if any.
    async fn find_active_measurement(
        &self,
        data_type: &str,
        identifier: &str,
    ) -> anyhow::Result<Option<Measurement>>;

    async fn insert_measurement(
        &self,
        data_type: &str,
        measurement: Measurement,
    ) -> anyhow::Result<()>;

    /// The bucket exactly spanning `[start, end)` for `identifier`, if any.
    async fn find_data_bucket(
        &self,
        data_type: &str,
        identifier: &str,
        start: i64,
        end: i64,
    ) -> anyhow::Result<Option<(StoreId, DataDocument)>>;

    /// Every bucket for `identifier` overlapping `[start, end)` under the
    /// half-open convention, using the `identifier_1_start_1_end_1` index
    /// via the compound overlap index.
    async fn find_overlapping_data_buckets(
        &self,
        data_type: &str,
        identifier: &str,
        start: i64,
        end: i64,
    ) -> anyhow::Result<Vec<(StoreId, DataDocument)>>;

    async fn insert_data_buckets(
        &self,
        data_type: &str,
        buckets: Vec<DataDocument>,
    ) -> anyhow::Result<()>;

    /// Replace an existing bucket's points and value-type schema in place.
    async fn update_data_bucket(
        &self,
        data_type: &str,
        id: &StoreId,
        bucket: DataDocument,
    ) -> anyhow::Result<()>;

    /// Delete every listed bucket in one batch.
    async fn delete_data_buckets(&self, data_type: &str, ids: &[StoreId]) -> anyhow::Result<()>;

    async fn find_event_bucket(
        &self,
        data_type: &str,
        start: i64,
        end: i64,
    ) -> anyhow::Result<Option<(StoreId, EventDocument)>>;

    async fn insert_event_bucket(
        &self,
        data_type: &str,
        bucket: EventDocument,
    ) -> anyhow::Result<()>;

    async fn update_event_bucket(
        &self,
        data_type: &str,
        id: &StoreId,
        bucket: EventDocument,
    ) -> anyhow::Result<()>;
}
