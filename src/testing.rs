//! In-memory stores and sinks shared by unit tests

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use mongodb::bson::Document;
use tokio::sync::Semaphore;

use crate::error::{ExportError, PipelineError, ResourceError, Result, TransferError};
use crate::export::request::{BinaryLinkage, ExportRequest, LookupKey, LookupTarget};
use crate::storage::{ChunkStream, ObjectSink, UploadTarget};
use crate::store::{BlobHandle, BlobStore, DocumentStore, RecordSource};

const MOCK_CHUNK_SIZE: usize = 8;

/// Record source over a fixed list of records
pub struct MockRecordSource {
    records: VecDeque<Document>,
    fail_after: Option<usize>,
    pulled: Arc<AtomicUsize>,
    closed: bool,
}

#[async_trait]
impl RecordSource for MockRecordSource {
    async fn next_record(&mut self) -> Result<Option<Document>> {
        if self.closed {
            return Ok(None);
        }
        let pulled = self.pulled.load(Ordering::SeqCst);
        if self.fail_after == Some(pulled) {
            self.closed = true;
            return Err(PipelineError::Cursor("connection reset by peer".to_string()).into());
        }
        let next = self.records.pop_front();
        if next.is_some() {
            self.pulled.fetch_add(1, Ordering::SeqCst);
        }
        Ok(next)
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Document store over in-memory records
#[derive(Clone, Default)]
pub struct MockDocumentStore {
    records: Vec<Document>,
    fail_after: Option<usize>,
    count_fails: bool,
    unreachable: bool,
    blobs: Option<Arc<MockBlobStore>>,
    pulled: Arc<AtomicUsize>,
}

impl MockDocumentStore {
    pub fn new(records: Vec<Document>) -> Self {
        Self {
            records,
            ..Default::default()
        }
    }

    pub fn with_blobs(mut self, blobs: MockBlobStore) -> Self {
        self.blobs = Some(Arc::new(blobs));
        self
    }

    pub fn failing_after(mut self, records: usize) -> Self {
        self.fail_after = Some(records);
        self
    }

    pub fn without_counts(mut self) -> Self {
        self.count_fails = true;
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    /// Records handed out so far across all cursors
    pub fn pulled(&self) -> Arc<AtomicUsize> {
        self.pulled.clone()
    }
}

#[async_trait]
impl DocumentStore for MockDocumentStore {
    async fn open(&self, _request: &ExportRequest) -> Result<Box<dyn RecordSource>> {
        if self.unreachable {
            return Err(ResourceError::Unreachable("server selection timeout".to_string()).into());
        }
        Ok(Box::new(MockRecordSource {
            records: self.records.iter().cloned().collect(),
            fail_after: self.fail_after,
            pulled: self.pulled.clone(),
            closed: false,
        }))
    }

    async fn count_records(&self, _request: &ExportRequest) -> Result<u64> {
        if self.count_fails {
            return Err(ExportError::Generic("count not permitted".to_string()));
        }
        Ok(self.records.len() as u64)
    }

    async fn count_binaries(&self, _request: &ExportRequest, linkage: &BinaryLinkage) -> Result<u64> {
        if self.count_fails {
            return Err(ExportError::Generic("count not permitted".to_string()));
        }
        let Some(blobs) = &self.blobs else {
            return Ok(0);
        };
        let matched = self
            .records
            .iter()
            .filter_map(|record| linkage.lookup_key(record))
            .filter(|key| blobs.contains(key))
            .count();
        Ok(matched as u64)
    }

    fn blob_store(&self, _bucket_name: &str) -> Option<Arc<dyn BlobStore>> {
        self.blobs.clone().map(|b| b as Arc<dyn BlobStore>)
    }
}

/// Blob store over in-memory objects keyed by lookup key
#[derive(Default)]
pub struct MockBlobStore {
    objects: HashMap<String, Vec<u8>>,
    failures: HashMap<String, (usize, String)>,
    panics: HashSet<String>,
    opens: Mutex<HashMap<String, usize>>,
}

impl MockBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(mut self, key: &str, body: Vec<u8>) -> Self {
        self.objects.insert(key.to_string(), body);
        self
    }

    /// Transfer streams for `key` fail after `chunks` chunks
    pub fn failing_after(mut self, key: &str, chunks: usize, reason: &str) -> Self {
        self.failures
            .insert(key.to_string(), (chunks, reason.to_string()));
        self
    }

    /// Locating `key` panics
    pub fn panicking_on(mut self, key: &str) -> Self {
        self.panics.insert(key.to_string());
        self
    }

    pub fn contains(&self, key: &LookupKey) -> bool {
        !matches!(key.target, LookupTarget::Malformed) && self.objects.contains_key(&key.raw)
    }

    /// Streams opened so far for `key`
    pub fn streams_opened(&self, key: &str) -> usize {
        self.opens.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl BlobStore for MockBlobStore {
    async fn locate(&self, key: &LookupKey) -> Result<Option<BlobHandle>> {
        if self.panics.contains(&key.raw) {
            panic!("index corrupted for {}", key.raw);
        }
        if !self.contains(key) {
            return Ok(None);
        }
        let length = self.objects[&key.raw].len() as u64;
        Ok(Some(BlobHandle {
            id: key.raw.clone().into(),
            length: Some(length),
        }))
    }

    async fn open_stream(&self, handle: &BlobHandle) -> Result<ChunkStream> {
        let key = handle.id.as_str().unwrap_or_default().to_string();
        let opened = {
            let mut opens = self.opens.lock().unwrap();
            let count = opens.entry(key.clone()).or_insert(0);
            *count += 1;
            *count - 1
        };
        let body = self.objects.get(&key).cloned().unwrap_or_default();

        let mut chunks: Vec<std::io::Result<Bytes>> = body
            .chunks(MOCK_CHUNK_SIZE)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        // The first open of a key is the sniff stream; later opens fail
        if let Some((after, reason)) = self.failures.get(&key) {
            if opened > 0 {
                chunks.truncate(*after);
                chunks.push(Err(std::io::Error::other(reason.clone())));
            }
        }
        Ok(stream::iter(chunks).boxed())
    }
}

/// An object written to [`MemorySink`]
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Object sink that keeps uploads in memory
///
/// Optionally delays each upload, fails uploads for a key, or holds reading
/// behind a gate that the test opens chunk by chunk.
#[derive(Clone, Default)]
pub struct MemorySink {
    objects: Arc<Mutex<HashMap<String, StoredObject>>>,
    delay: Option<Duration>,
    fail_key: Option<String>,
    gate: Option<Arc<Semaphore>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing_for(mut self, key: &str) -> Self {
        self.fail_key = Some(key.to_string());
        self
    }

    /// Hold each chunk read until a permit is added to the returned gate
    pub fn gated(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.gate = Some(gate.clone());
        (self, gate)
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().unwrap().is_empty()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectSink for MemorySink {
    async fn upload(&self, target: UploadTarget, mut body: ChunkStream) -> Result<u64> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        let result: Result<u64> = async {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_key.as_deref() == Some(target.key.as_str()) {
                return Err(TransferError::Upload("bucket rejected the write".to_string()).into());
            }

            let mut collected = Vec::new();
            loop {
                if let Some(gate) = &self.gate {
                    gate.acquire().await.map_err(|e| ExportError::Generic(e.to_string()))?.forget();
                }
                match body.next().await {
                    Some(Ok(chunk)) => collected.extend_from_slice(&chunk),
                    Some(Err(e)) => return Err(TransferError::Read(e.to_string()).into()),
                    None => break,
                }
            }

            let len = collected.len() as u64;
            if let Some(progress) = &target.progress {
                progress.report(len);
            }
            self.objects.lock().unwrap().insert(
                target.key.clone(),
                StoredObject {
                    content_type: target.content_type.clone(),
                    body: collected,
                },
            );
            Ok(len)
        }
        .await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
