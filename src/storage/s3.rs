//! S3 object sink
//!
//! Works with AWS S3 and S3-compatible services. Bodies that fit in a
//! single part are sent with one `PutObject`; larger bodies go through a
//! multipart upload with a bounded number of parts in flight. Any failure
//! aborts the multipart upload so no partial object is left behind.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::task::JoinSet;

use super::{ChunkStream, ObjectSink, UploadTarget};
use crate::config::StorageConfig;
use crate::error::{ExportError, Result, TransferError};

/// S3-backed object sink
#[derive(Debug, Clone)]
pub struct S3Sink {
    /// S3 client
    client: Client,
    /// Destination bucket
    bucket: String,
    /// Multipart part size in bytes
    part_size: usize,
    /// Parts uploaded concurrently per object
    queue_size: usize,
}

impl S3Sink {
    pub fn new(client: Client, bucket: impl Into<String>, part_size: usize, queue_size: usize) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            part_size: part_size.max(1),
            queue_size: queue_size.max(1),
        }
    }

    /// Build a sink from storage configuration and an existing client
    pub fn from_config(client: Client, config: &StorageConfig) -> Option<Self> {
        let bucket = config.bucket.clone()?;
        Some(Self::new(client, bucket, config.part_size, config.queue_size))
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_single(&self, target: &UploadTarget, body: Bytes) -> Result<u64> {
        let len = body.len() as u64;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&target.key)
            .content_type(&target.content_type)
            .content_length(len as i64)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| upload_error("put_object", e))?;

        if let Some(progress) = &target.progress {
            progress.report(len);
        }

        tracing::debug!(
            bucket = %self.bucket,
            key = %target.key,
            size = len,
            "Object stored with single put"
        );
        Ok(len)
    }

    async fn put_multipart(&self, target: &UploadTarget, first: Bytes, reader: PartReader) -> Result<u64> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&target.key)
            .content_type(&target.content_type)
            .send()
            .await
            .map_err(|e| upload_error("create_multipart_upload", e))?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| TransferError::Upload("S3 returned no upload id".to_string()))?
            .to_string();

        match self.upload_parts(target, &upload_id, first, reader).await {
            Ok(total) => {
                tracing::debug!(
                    bucket = %self.bucket,
                    key = %target.key,
                    size = total,
                    "Object stored with multipart upload"
                );
                Ok(total)
            }
            Err(e) => {
                self.abort(&target.key, &upload_id).await;
                match e {
                    ExportError::Transfer(TransferError::Upload(msg)) => {
                        Err(TransferError::Aborted(msg).into())
                    }
                    other => Err(other),
                }
            }
        }
    }

    async fn upload_parts(
        &self,
        target: &UploadTarget,
        upload_id: &str,
        first: Bytes,
        mut reader: PartReader,
    ) -> Result<u64> {
        let mut in_flight: JoinSet<Result<(CompletedPart, u64)>> = JoinSet::new();
        let mut completed: Vec<CompletedPart> = Vec::new();
        let mut loaded: u64 = 0;
        let mut part_number: i32 = 1;
        let mut next = Some(first);

        loop {
            let Some(body) = next.take() else { break };
            in_flight.spawn(self.part_future(&target.key, upload_id, part_number, body));
            part_number += 1;

            while in_flight.len() >= self.queue_size {
                if let Some(joined) = in_flight.join_next().await {
                    loaded += self.settle_part(joined, &mut completed, target, loaded)?;
                }
            }

            next = reader.next_part().await.map_err(read_error)?;
        }

        while let Some(joined) = in_flight.join_next().await {
            loaded += self.settle_part(joined, &mut completed, target, loaded)?;
        }

        completed.sort_by_key(|part| part.part_number());
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&target.key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| upload_error("complete_multipart_upload", e))?;

        Ok(loaded)
    }

    fn part_future(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> impl Future<Output = Result<(CompletedPart, u64)>> + Send + 'static {
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        async move {
            let len = body.len() as u64;
            let output = client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(body))
                .send()
                .await
                .map_err(|e| upload_error("upload_part", e))?;

            let part = CompletedPart::builder()
                .part_number(part_number)
                .set_e_tag(output.e_tag().map(str::to_string))
                .build();
            Ok((part, len))
        }
    }

    fn settle_part(
        &self,
        joined: std::result::Result<Result<(CompletedPart, u64)>, tokio::task::JoinError>,
        completed: &mut Vec<CompletedPart>,
        target: &UploadTarget,
        loaded: u64,
    ) -> Result<u64> {
        let (part, len) = joined.map_err(|e| TransferError::Upload(format!("part task failed: {e}")))??;
        completed.push(part);
        if let Some(progress) = &target.progress {
            progress.report(loaded + len);
        }
        Ok(len)
    }

    async fn abort(&self, key: &str, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            tracing::warn!(
                bucket = %self.bucket,
                key = %key,
                error = %DisplayErrorContext(&e),
                "Failed to abort multipart upload"
            );
        } else {
            tracing::debug!(bucket = %self.bucket, key = %key, "Multipart upload aborted");
        }
    }
}

#[async_trait]
impl ObjectSink for S3Sink {
    async fn upload(&self, target: UploadTarget, body: ChunkStream) -> Result<u64> {
        let mut reader = PartReader::new(body, self.part_size);
        let first = reader.next_part().await.map_err(read_error)?.unwrap_or_default();

        if reader.is_exhausted() {
            self.put_single(&target, first).await
        } else {
            self.put_multipart(&target, first, reader).await
        }
    }

    fn describe(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}

/// Cuts a chunk stream into parts of a fixed size (the last may be shorter)
struct PartReader {
    body: ChunkStream,
    buffer: BytesMut,
    part_size: usize,
    ended: bool,
}

impl PartReader {
    fn new(body: ChunkStream, part_size: usize) -> Self {
        Self {
            body,
            buffer: BytesMut::new(),
            part_size,
            ended: false,
        }
    }

    async fn next_part(&mut self) -> std::io::Result<Option<Bytes>> {
        while !self.ended && self.buffer.len() < self.part_size {
            match self.body.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(e),
                None => self.ended = true,
            }
        }
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let take = self.buffer.len().min(self.part_size);
        Ok(Some(self.buffer.split_to(take).freeze()))
    }

    fn is_exhausted(&self) -> bool {
        self.ended && self.buffer.is_empty()
    }
}

fn read_error(e: std::io::Error) -> ExportError {
    TransferError::Read(e.to_string()).into()
}

fn upload_error<E>(operation: &str, e: E) -> ExportError
where
    E: std::error::Error + 'static,
{
    TransferError::Upload(format!("S3 {operation} error: {}", DisplayErrorContext(&e))).into()
}
