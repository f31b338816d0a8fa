//! Data model and pure helper functions shared by every stage of the
//! ingestion pipeline: [`types`] defines the domain objects, [`keys`]
//! computes the cache/lock identifiers derived from them.
pub mod keys;
pub mod types;

pub use types::{
    DataDocument,
    DataPoint,
    DataType,
    Event,
    EventDocument,
    Measurement,
    MetadataFieldSpec,
    ValueTypeDescriptor,
};
