//! MongoDB-backed `Store`. One database per data type; four collections
//! per database (`measurements`, `data`, `event`, `metadata`).
use std::collections::BTreeMap;

use async_trait::async_trait;
use mongodb::{
    bson::{
        doc,
        oid::ObjectId,
    },
    options::{
        FindOneAndUpdateOptions,
        FindOptions,
        Hint,
    },
    Client,
    Collection,
    Database,
};
use serde::{
    Deserialize,
    Serialize,
};
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

/// The compound index the overlap query relies on. Created once per
/// database at startup by whatever provisions the deployment; `MongoStore`
/// only hints it, it does not create it.
pub const DATA_OVERLAP_INDEX_NAME: &str = "identifier_1_start_1_end_1";

#[derive(Serialize, Deserialize)]
struct WithId<T> {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    id: Option<ObjectId>,
    #[serde(flatten)]
    doc: T,
}

fn to_store_id(id: ObjectId) -> StoreId {
    StoreId(id.to_hex())
}

fn from_store_id(id: &StoreId) -> anyhow::Result<ObjectId> {
    ObjectId::parse_str(&id.0).map_err(|e| anyhow::anyhow!("invalid store id {}: {e}", id.0))
}

pub struct MongoStore {
    client: Client,
}

impl MongoStore {
    pub async fn connect(uri: &str) -> anyhow::Result<Self> {
        let client = Client::with_uri_str(uri).await?;
        Ok(Self { client })
    }

    fn database(&self, data_type: &str) -> Database {
        self.client.database(data_type)
    }

    fn measurements(&self, data_type: &str) -> Collection<WithId<Measurement>> {
        self.database(data_type).collection("measurements")
    }

    fn data(&self, data_type: &str) -> Collection<WithId<DataDocument>> {
        self.database(data_type).collection("data")
    }

    fn event(&self, data_type: &str) -> Collection<WithId<EventDocument>> {
        self.database(data_type).collection("event")
    }

    fn metadata(&self, data_type: &str) -> Collection<WithId<DataType>> {
        self.database(data_type).collection("metadata")
    }
}

#[async_trait]
impl Store for MongoStore {
    async fn find_metadata(&self, data_type: &str) -> anyhow::Result<Option<DataType>> {
        Ok(self
            .metadata(data_type)
            .find_one(doc! {})
            .await?
            .map(|w| w.doc))
    }

    async fn add_value_types(
        &self,
        data_type: &str,
        additions: BTreeMap<String, ValueTypeDescriptor>,
    ) -> anyhow::Result<()> {
        let mut set = mongodb::bson::Document::new();
        for (value_type, descriptor) in &additions {
            set.insert(
                format!("values.{value_type}"),
                mongodb::bson::to_bson(descriptor)?,
            );
        }
        let result = self
            .metadata(data_type)
            .find_one_and_update(doc! {}, doc! { "$set": set })
            .with_options(FindOneAndUpdateOptions::default())
            .await?;
        if result.is_none() {
            anyhow::bail!("metadata document missing for {data_type}");
        }
        Ok(())
    }

    async fn list_data_types(&self, ignore: &[String]) -> anyhow::Result<Vec<String>> {
        let names = self.client.list_database_names().await?;
        Ok(names
            .into_iter()
            .filter(|name| !name.starts_with('_') && !ignore.contains(name))
            .collect())
    }

    async fn find_active_measurement(
        &self,
        data_type: &str,
        identifier: &str,
    ) -> anyhow::Result<Option<Measurement>> {
        Ok(self
            .measurements(data_type)
            .find_one(doc! { "identifier": identifier, "end": mongodb::bson::Bson::Null })
            .await?
            .map(|w| w.doc))
    }

    async fn insert_measurement(
        &self,
        data_type: &str,
        measurement: Measurement,
    ) -> anyhow::Result<()> {
        self.measurements(data_type)
            .insert_one(WithId {
                id: None,
                doc: measurement,
            })
            .await?;
        Ok(())
    }

    async fn find_data_bucket(
        &self,
        data_type: &str,
        identifier: &str,
        start: i64,
        end: i64,
    ) -> anyhow::Result<Option<(StoreId, DataDocument)>> {
        let found = self
            .data(data_type)
            .find_one(doc! {
                "measurement_identifier": identifier,
                "start": start,
                "end": end,
            })
            .await?;
        Ok(found.map(|w| (to_store_id(w.id.expect("stored document has an id")), w.doc)))
    }

    async fn find_overlapping_data_buckets(
        &self,
        data_type: &str,
        identifier: &str,
        start: i64,
        end: i64,
    ) -> anyhow::Result<Vec<(StoreId, DataDocument)>> {
        let filter = doc! {
            "measurement_identifier": identifier,
            "start": { "$lt": end },
            "end": { "$gt": start },
        };
        let options = FindOptions::builder()
            .hint(Hint::Name(DATA_OVERLAP_INDEX_NAME.to_owned()))
            .build();
        let mut cursor = self.data(data_type).find(filter).with_options(options).await?;
        let mut results = Vec::new();
        while let Some(w) = futures::TryStreamExt::try_next(&mut cursor).await? {
            results.push((to_store_id(w.id.expect("stored document has an id")), w.doc));
        }
        Ok(results)
    }

    async fn insert_data_buckets(
        &self,
        data_type: &str,
        buckets: Vec<DataDocument>,
    ) -> anyhow::Result<()> {
        if buckets.is_empty() {
            return Ok(());
        }
        let docs = buckets
            .into_iter()
            .map(|doc| WithId { id: None, doc });
        self.data(data_type).insert_many(docs).await?;
        Ok(())
    }

    async fn update_data_bucket(
        &self,
        data_type: &str,
        id: &StoreId,
        bucket: DataDocument,
    ) -> anyhow::Result<()> {
        let object_id = from_store_id(id)?;
        self.data(data_type)
            .replace_one(
                doc! { "_id": object_id },
                WithId {
                    id: Some(object_id),
                    doc: bucket,
                },
            )
            .await?;
        Ok(())
    }

    async fn delete_data_buckets(&self, data_type: &str, ids: &[StoreId]) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let object_ids = ids
            .iter()
            .map(from_store_id)
            .collect::<anyhow::Result<Vec<_>>>()?;
        self.data(data_type)
            .delete_many(doc! { "_id": { "$in": object_ids } })
            .await?;
        Ok(())
    }

    async fn find_event_bucket(
        &self,
        data_type: &str,
        start: i64,
        end: i64,
    ) -> anyhow::Result<Option<(StoreId, EventDocument)>> {
        let found = self
            .event(data_type)
            .find_one(doc! { "start": start, "end": end })
            .await?;
        Ok(found.map(|w| (to_store_id(w.id.expect("stored document has an id")), w.doc)))
    }

    async fn insert_event_bucket(
        &self,
        data_type: &str,
        bucket: EventDocument,
    ) -> anyhow::Result<()> {
        self.event(data_type)
            .insert_one(WithId {
                id: None,
                doc: bucket,
            })
            .await?;
        Ok(())
    }

    async fn update_event_bucket(
        &self,
        data_type: &str,
        id: &StoreId,
        bucket: EventDocument,
    ) -> anyhow::Result<()> {
        let object_id = from_store_id(id)?;
        self.event(data_type)
            .replace_one(
                doc! { "_id": object_id },
                WithId {
                    id: Some(object_id),
                    doc: bucket,
                },
            )
            .await?;
        Ok(())
    }
}
