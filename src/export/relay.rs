//! Binary relay
//!
//! One relay moves one binary object from the chunked store to object
//! storage. Two independent read streams are opened against the object:
//! the first is handed to the sniffer and dropped as soon as the type is
//! known, the second feeds the upload. Every outcome is reported as exactly
//! one settle event; a relay never fails its caller, not even by panicking.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, warn};

use super::event::{EventSender, TransferEvent};
use super::request::BinaryTask;
use super::sniffer::{SignatureTable, sniff};
use crate::error::{ExportError, Result, TransferError};
use crate::storage::{ObjectSink, UploadTarget};
use crate::store::BlobStore;

/// Result of one relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Uploaded to `destination_key`
    Uploaded { destination_key: String, bytes: u64 },
    /// No object matched the lookup key
    NotFound { key: String },
    /// Reading or uploading failed
    Failed { key: String, reason: String },
}

/// Shared collaborators for every relay of one export
#[derive(Clone)]
pub struct BinaryRelay {
    blobs: Arc<dyn BlobStore>,
    sink: Arc<dyn ObjectSink>,
    signatures: Arc<SignatureTable>,
    events: EventSender,
}

impl BinaryRelay {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        sink: Arc<dyn ObjectSink>,
        signatures: Arc<SignatureTable>,
        events: EventSender,
    ) -> Self {
        Self {
            blobs,
            sink,
            signatures,
            events,
        }
    }

    /// Relay one binary object and emit its settle event
    pub async fn relay(&self, task: BinaryTask) -> RelayOutcome {
        let key = task.lookup.raw.clone();

        let transferred = AssertUnwindSafe(self.transfer(&task))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!(key = %key, "Binary relay panicked");
                Err(TransferError::Panicked.into())
            });

        let outcome = match transferred {
            Ok((destination_key, content_type, bytes)) => {
                debug!(key = %key, destination = %destination_key, bytes, "Binary relayed");
                self.events.emit(TransferEvent::BinaryProgress {
                    key: key.clone(),
                    destination_key: destination_key.clone(),
                    content_type,
                    bytes,
                });
                RelayOutcome::Uploaded {
                    destination_key,
                    bytes,
                }
            }
            Err(ExportError::NotFound(_)) => {
                debug!(key = %key, "No binary object for lookup key");
                RelayOutcome::NotFound { key: key.clone() }
            }
            Err(e) => {
                let reason = e.reason();
                warn!(key = %key, reason = %reason, "Binary relay failed");
                RelayOutcome::Failed {
                    key: key.clone(),
                    reason,
                }
            }
        };

        match &outcome {
            RelayOutcome::NotFound { key } => self.events.emit(TransferEvent::BinaryFailure {
                key: key.clone(),
                reason: ExportError::NotFound(key.clone()).reason(),
            }),
            RelayOutcome::Failed { key, reason } => self.events.emit(TransferEvent::BinaryFailure {
                key: key.clone(),
                reason: reason.clone(),
            }),
            RelayOutcome::Uploaded { .. } => {}
        }

        outcome
    }

    async fn transfer(&self, task: &BinaryTask) -> Result<(String, String, u64)> {
        let key = &task.lookup.raw;
        let handle = self
            .blobs
            .locate(&task.lookup)
            .await?
            .ok_or_else(|| ExportError::NotFound(key.clone()))?;

        let sniff_stream = self.blobs.open_stream(&handle).await?;
        let body = self.blobs.open_stream(&handle).await?;

        let media_type = sniff(&self.signatures, sniff_stream).await;
        let destination_key = task.destination_key(media_type.extension.as_deref());

        let target = UploadTarget::new(destination_key.clone(), media_type.essence.clone())
            .with_progress(self.events.clone(), key.clone(), handle.length);
        let bytes = self.sink.upload(target, body).await?;

        Ok((destination_key, media_type.essence, bytes))
    }
}
