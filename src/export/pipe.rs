//! Bounded in-memory pipe feeding the bulk record upload
//!
//! The writer side is driven by the record loop, the reader side is a
//! [`ChunkStream`] consumed by the object sink. Capacity is counted in
//! chunks; a full pipe suspends the writer until the upload drains it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{ExportError, PipelineError, Result};
use crate::storage::ChunkStream;

/// Create a pipe holding at most `capacity` chunks
pub fn bulk_pipe(capacity: usize) -> (PipeWriter, ChunkStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let writer = PipeWriter {
        tx: Some(tx),
        written: Arc::new(AtomicU64::new(0)),
    };
    (writer, ReceiverStream::new(rx).boxed())
}

/// Writing half of a bulk pipe
pub struct PipeWriter {
    tx: Option<mpsc::Sender<std::io::Result<Bytes>>>,
    written: Arc<AtomicU64>,
}

impl PipeWriter {
    /// Write one chunk, waiting while the pipe is full
    ///
    /// Fails once the reader is gone or the pipe was closed.
    pub async fn write(&self, chunk: Bytes) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or(ExportError::Pipeline(PipelineError::PipeClosed))?;
        let len = chunk.len() as u64;
        tx.send(Ok(chunk))
            .await
            .map_err(|_| ExportError::Pipeline(PipelineError::PipeClosed))?;
        self.written.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    /// Abort the upload by handing the reader an error
    pub async fn fail(&mut self, reason: &str) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(std::io::Error::other(reason.to_string()))).await;
        }
    }

    /// Signal end of input
    pub fn close(&mut self) {
        self.tx = None;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().is_none_or(|tx| tx.is_closed())
    }

    /// Bytes accepted so far
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_chunks_arrive_in_order() {
        let (mut writer, mut reader) = bulk_pipe(4);
        writer.write(Bytes::from_static(b"a\n")).await.unwrap();
        writer.write(Bytes::from_static(b"b\n")).await.unwrap();
        writer.close();

        let mut collected = Vec::new();
        while let Some(chunk) = reader.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"a\nb\n");
        assert_eq!(writer.written(), 4);
    }

    #[tokio::test]
    async fn test_full_pipe_suspends_writer() {
        let (writer, mut reader) = bulk_pipe(1);
        writer.write(Bytes::from_static(b"1")).await.unwrap();

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), writer.write(Bytes::from_static(b"2")))
                .await;
        assert!(blocked.is_err());

        reader.next().await.unwrap().unwrap();
        writer.write(Bytes::from_static(b"3")).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (mut writer, _reader) = bulk_pipe(2);
        writer.close();
        assert!(writer.is_closed());
        assert!(matches!(
            writer.write(Bytes::from_static(b"x")).await,
            Err(ExportError::Pipeline(PipelineError::PipeClosed))
        ));
    }

    #[tokio::test]
    async fn test_write_after_reader_dropped_fails() {
        let (writer, reader) = bulk_pipe(2);
        drop(reader);
        assert!(writer.write(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn test_fail_surfaces_error_to_reader() {
        let (mut writer, mut reader) = bulk_pipe(2);
        writer.fail("cursor died").await;
        assert!(reader.next().await.unwrap().is_err());
        assert!(reader.next().await.is_none());
    }
}
