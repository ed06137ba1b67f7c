//! Object storage
//!
//! The pipeline writes through the [`ObjectSink`] seam: a destination key,
//! a content type and a byte stream in, total bytes written out. The S3
//! implementation lives in [`s3`].

pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::export::event::{EventSender, TransferEvent};

pub use s3::S3Sink;

/// Owned stream of byte chunks
pub type ChunkStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Where and how one object is written
#[derive(Debug, Clone)]
pub struct UploadTarget {
    pub key: String,
    pub content_type: String,
    pub progress: Option<ByteProgress>,
}

impl UploadTarget {
    pub fn new(key: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            content_type: content_type.into(),
            progress: None,
        }
    }

    /// Report intermediate byte progress for `source_key`
    pub fn with_progress(mut self, events: EventSender, source_key: impl Into<String>, total: Option<u64>) -> Self {
        self.progress = Some(ByteProgress {
            events,
            source_key: source_key.into(),
            total,
        });
        self
    }
}

/// Intermediate byte-progress reporting for one upload
#[derive(Debug, Clone)]
pub struct ByteProgress {
    events: EventSender,
    source_key: String,
    total: Option<u64>,
}

impl ByteProgress {
    pub fn report(&self, loaded: u64) {
        self.events.emit(TransferEvent::BinaryBytes {
            key: self.source_key.clone(),
            loaded,
            total: self.total,
        });
    }
}

/// Destination for exported objects
#[async_trait]
pub trait ObjectSink: Send + Sync {
    /// Stream `body` to `target.key`, returning the number of bytes written
    ///
    /// A read error on `body` aborts the upload and nothing is left behind.
    async fn upload(&self, target: UploadTarget, body: ChunkStream) -> Result<u64>;

    /// Name of the destination, for logs
    fn describe(&self) -> String;
}
