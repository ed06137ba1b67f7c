//! Source stores
//!
//! The export reads from two collaborators:
//! - a [`DocumentStore`] that opens a streaming [`RecordSource`] over a
//!   query or aggregation and answers count queries
//! - a [`BlobStore`] (the chunked store built on top of the document store)
//!   that resolves lookup keys and opens byte streams
//!
//! MongoDB and GridFS implementations live in [`mongo`].

pub mod cursor;
pub mod mongo;

use std::sync::Arc;

use async_trait::async_trait;
use mongodb::bson::{Bson, Document};

use crate::error::Result;
use crate::export::request::{BinaryLinkage, ExportRequest, LookupKey};
use crate::storage::ChunkStream;

pub use cursor::CursorRecordSource;
pub use mongo::{GridFsStore, MongoDocumentStore};

/// Streaming source of records in cursor order
#[async_trait]
pub trait RecordSource: Send {
    /// Pull the next record, or `None` once exhausted
    async fn next_record(&mut self) -> Result<Option<Document>>;

    /// Release the underlying cursor
    async fn close(&mut self) -> Result<()>;
}

/// Document store holding the exported collections
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Open a streaming cursor over the request's query or pipeline
    async fn open(&self, request: &ExportRequest) -> Result<Box<dyn RecordSource>>;

    /// Number of records the request will produce
    async fn count_records(&self, request: &ExportRequest) -> Result<u64>;

    /// Number of records whose lookup key resolves to a binary object
    async fn count_binaries(&self, request: &ExportRequest, linkage: &BinaryLinkage) -> Result<u64>;

    /// Chunked store for a named bucket
    fn blob_store(&self, bucket_name: &str) -> Option<Arc<dyn BlobStore>>;
}

/// A located binary object
#[derive(Debug, Clone, PartialEq)]
pub struct BlobHandle {
    /// Files-collection `_id`
    pub id: Bson,
    /// Declared length in bytes, if recorded
    pub length: Option<u64>,
}

/// Chunked binary-object store
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Resolve a lookup key, `None` when nothing matches
    async fn locate(&self, key: &LookupKey) -> Result<Option<BlobHandle>>;

    /// Open an independent read stream over a located object
    async fn open_stream(&self, handle: &BlobHandle) -> Result<ChunkStream>;
}
