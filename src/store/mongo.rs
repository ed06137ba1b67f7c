//! MongoDB document store and GridFS blob store

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use mongodb::bson::{Bson, Document, doc};
use mongodb::gridfs::GridFsBucket;
use mongodb::options::{CountOptions, FindOptions, GridFsBucketOptions};
use mongodb::{Collection, Database};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::{BlobHandle, BlobStore, CursorRecordSource, DocumentStore, RecordSource};
use crate::error::{ExportError, Result};
use crate::export::request::{BinaryLinkage, ExportRequest, LookupKey, LookupTarget, Source};
use crate::storage::ChunkStream;

/// Number of derived keys matched per `$in` query while counting binaries
const COUNT_BATCH_SIZE: usize = 500;

/// Document store over one MongoDB database
#[derive(Debug, Clone)]
pub struct MongoDocumentStore {
    database: Database,
    batch_size: u32,
}

impl MongoDocumentStore {
    pub fn new(database: Database, batch_size: u32) -> Self {
        Self {
            database,
            batch_size,
        }
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    fn collection(&self, request: &ExportRequest) -> Collection<Document> {
        self.database.collection::<Document>(&request.collection)
    }

    /// Open the request's source, optionally narrowed to a single field
    async fn open_source(
        &self,
        request: &ExportRequest,
        only_field: Option<&str>,
    ) -> Result<Box<dyn RecordSource>> {
        let collection = self.collection(request);

        match &request.source {
            Source::Query { filter, options } => {
                let mut find_options = FindOptions::default();
                find_options.batch_size = Some(self.batch_size);
                find_options.sort = options.sort.clone();
                find_options.limit = options.limit;
                find_options.skip = options.skip;
                find_options.projection = match only_field {
                    Some(field) => Some(doc! { field: 1 }),
                    None => options.projection.clone(),
                };

                let cursor = collection
                    .find(filter.clone())
                    .with_options(find_options)
                    .await
                    .map_err(|e| ExportError::from_open_failure(e.into()))?;
                Ok(Box::new(CursorRecordSource::find(cursor)))
            }
            Source::Aggregation { pipeline } => {
                let mut stages = pipeline.clone();
                if let Some(field) = only_field {
                    stages.push(doc! { "$project": { field: 1 } });
                }

                let cursor = collection
                    .aggregate(stages)
                    .batch_size(self.batch_size)
                    .await
                    .map_err(|e| ExportError::from_open_failure(e.into()))?;
                Ok(Box::new(CursorRecordSource::aggregate(cursor)))
            }
        }
    }
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    async fn open(&self, request: &ExportRequest) -> Result<Box<dyn RecordSource>> {
        debug!(
            collection = %request.collection,
            mode = request.mode(),
            "Opening record cursor"
        );
        self.open_source(request, None).await
    }

    async fn count_records(&self, request: &ExportRequest) -> Result<u64> {
        let collection = self.collection(request);

        match &request.source {
            Source::Query { filter, options } => {
                let mut count_options = CountOptions::default();
                count_options.limit = options.limit.filter(|l| *l != 0).map(i64::unsigned_abs);
                count_options.skip = options.skip;
                let total = collection
                    .count_documents(filter.clone())
                    .with_options(count_options)
                    .await?;
                Ok(total)
            }
            Source::Aggregation { pipeline } => {
                let mut stages = pipeline.clone();
                stages.push(doc! { "$count": "total" });
                let mut cursor = collection.aggregate(stages).await?;
                match cursor.next().await.transpose()? {
                    Some(result) => Ok(count_field(&result, "total")),
                    None => Ok(0),
                }
            }
        }
    }

    async fn count_binaries(&self, request: &ExportRequest, linkage: &BinaryLinkage) -> Result<u64> {
        let mut source = self.open_source(request, Some(&linkage.source_field)).await?;
        let files = files_collection(&self.database, &linkage.bucket_name);

        let mut total = 0u64;
        let mut field: Option<String> = None;
        let mut batch: Vec<Bson> = Vec::with_capacity(COUNT_BATCH_SIZE);

        while let Some(record) = source.next_record().await? {
            let Some(key) = linkage.lookup_key(&record) else {
                continue;
            };
            let Some((match_field, value)) = match_clause(&key.target) else {
                continue;
            };
            field.get_or_insert(match_field);
            batch.push(value);

            if batch.len() >= COUNT_BATCH_SIZE {
                total += count_matches(&files, field.as_deref(), &mut batch).await?;
            }
        }
        total += count_matches(&files, field.as_deref(), &mut batch).await?;
        source.close().await?;

        Ok(total)
    }

    fn blob_store(&self, bucket_name: &str) -> Option<Arc<dyn BlobStore>> {
        Some(Arc::new(GridFsStore::new(&self.database, bucket_name)))
    }
}

/// GridFS-backed blob store
#[derive(Clone)]
pub struct GridFsStore {
    bucket: GridFsBucket,
    files: Collection<Document>,
    bucket_name: String,
}

impl GridFsStore {
    pub fn new(database: &Database, bucket_name: &str) -> Self {
        let options = GridFsBucketOptions::builder()
            .bucket_name(bucket_name.to_string())
            .build();
        Self {
            bucket: database.gridfs_bucket(options),
            files: files_collection(database, bucket_name),
            bucket_name: bucket_name.to_string(),
        }
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }
}

#[async_trait]
impl BlobStore for GridFsStore {
    async fn locate(&self, key: &LookupKey) -> Result<Option<BlobHandle>> {
        let Some((field, value)) = match_clause(&key.target) else {
            return Ok(None);
        };

        let found = self
            .files
            .find_one(doc! { field: value })
            .sort(latest_revision())
            .projection(doc! { "_id": 1, "length": 1 })
            .await?;

        Ok(found.and_then(|file| {
            let id = file.get("_id")?.clone();
            Some(BlobHandle {
                id,
                length: Some(count_field(&file, "length")),
            })
        }))
    }

    async fn open_stream(&self, handle: &BlobHandle) -> Result<ChunkStream> {
        let download = self.bucket.open_download_stream(handle.id.clone()).await?;
        Ok(ReaderStream::new(download.compat()).boxed())
    }
}

fn files_collection(database: &Database, bucket_name: &str) -> Collection<Document> {
    database.collection::<Document>(&format!("{bucket_name}.files"))
}

/// Newest upload first, so a re-uploaded filename resolves to its latest revision
fn latest_revision() -> Document {
    doc! { "uploadDate": -1 }
}

/// Files-collection field and value a lookup target matches on
fn match_clause(target: &LookupTarget) -> Option<(String, Bson)> {
    match target {
        LookupTarget::Id(oid) => Some(("_id".to_string(), Bson::ObjectId(*oid))),
        LookupTarget::Filename(name) => Some(("filename".to_string(), Bson::String(name.clone()))),
        LookupTarget::Field { field, value } => Some((field.clone(), Bson::String(value.clone()))),
        LookupTarget::Malformed => None,
    }
}

async fn count_matches(
    files: &Collection<Document>,
    field: Option<&str>,
    batch: &mut Vec<Bson>,
) -> Result<u64> {
    let Some(field) = field else {
        batch.clear();
        return Ok(0);
    };
    if batch.is_empty() {
        return Ok(0);
    }
    let values: Vec<Bson> = std::mem::take(batch);
    let matched = files
        .count_documents(doc! { field: { "$in": values } })
        .await?;
    Ok(matched)
}

/// Read a numeric count field regardless of its integer width
fn count_field(document: &Document, key: &str) -> u64 {
    match document.get(key) {
        Some(Bson::Int32(n)) => (*n).max(0) as u64,
        Some(Bson::Int64(n)) => (*n).max(0) as u64,
        Some(Bson::Double(f)) if *f >= 0.0 => *f as u64,
        _ => 0,
    }
}
