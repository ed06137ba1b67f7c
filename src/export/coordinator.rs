//! Export coordinator
//!
//! Owns the record cursor and drives everything else: the JSON Lines bulk
//! upload through a bounded pipe, and one binary relay per eligible record
//! through the task limiter. Acquisition failures are returned from
//! [`ExportCoordinator::prepare`] before any event is emitted; once an
//! export is executing, every failure is reported through the event
//! channel and the outcome is always returned.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::event::{EventSender, TransferEvent};
use super::limiter::TaskLimiter;
use super::pipe::{PipeWriter, bulk_pipe};
use super::relay::{BinaryRelay, RelayOutcome};
use super::request::{BinaryLinkage, ExportRequest};
use super::serializer::RecordSerializer;
use super::sniffer::SignatureTable;
use crate::config::Config;
use crate::error::{ExportError, PipelineError, ResourceError, Result};
use crate::storage::{ObjectSink, UploadTarget};
use crate::store::{BlobStore, DocumentStore, RecordSource};

/// Stores and sinks an export may use
///
/// Either side may be missing (no client configured); that is reported as
/// a resource error when an export is prepared.
#[derive(Clone, Default)]
pub struct ExportResources {
    pub documents: Option<Arc<dyn DocumentStore>>,
    pub objects: Option<Arc<dyn ObjectSink>>,
}

/// Pipeline tuning
#[derive(Debug, Clone)]
pub struct ExportSettings {
    /// Maximum binary relays in flight
    pub concurrency: usize,
    /// Record chunks buffered ahead of the bulk upload
    pub pipe_capacity: usize,
    /// Count records and binaries before streaming
    pub count_upfront: bool,
    /// Content type of the JSON Lines artifact
    pub record_content_type: String,
    /// Signature table used to sniff binaries
    pub signatures: Arc<SignatureTable>,
}

impl Default for ExportSettings {
    fn default() -> Self {
        let export = crate::config::ExportConfig::default();
        Self {
            concurrency: export.concurrency,
            pipe_capacity: export.pipe_capacity,
            count_upfront: export.count_upfront,
            record_content_type: export.record_content_type,
            signatures: Arc::new(SignatureTable::builtin()),
        }
    }
}

impl ExportSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            concurrency: config.export.concurrency,
            pipe_capacity: config.export.pipe_capacity,
            count_upfront: config.export.count_upfront,
            record_content_type: config.export.record_content_type.clone(),
            signatures: Arc::new(SignatureTable::with_extra(&config.sniffer.extra_signatures)?),
        })
    }
}

/// A binary that could not be relayed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BinaryFailure {
    pub key: String,
    pub reason: String,
}

/// Terminal result of one export
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportOutcome {
    /// Records pulled from the cursor
    pub records: u64,
    /// Binaries relayed successfully
    pub binaries: u64,
    /// Lookup keys with no matching binary
    pub not_found: Vec<String>,
    /// Binaries whose transfer failed
    pub failures: Vec<BinaryFailure>,
    /// Key of the JSON Lines artifact, when uploaded
    pub record_key: Option<String>,
    /// Size of the JSON Lines artifact
    pub record_bytes: u64,
    pub elapsed_ms: u64,
    /// Reason the export was aborted
    pub fatal: Option<String>,
}

impl ExportOutcome {
    pub fn is_success(&self) -> bool {
        self.fatal.is_none()
    }

    /// Number of `binary-failure` events emitted
    pub fn failure_events(&self) -> u64 {
        (self.not_found.len() + self.failures.len()) as u64
    }

    fn tally(&mut self, relays: Vec<RelayOutcome>) {
        for relay in relays {
            match relay {
                RelayOutcome::Uploaded { .. } => self.binaries += 1,
                RelayOutcome::NotFound { key } => self.not_found.push(key),
                RelayOutcome::Failed { key, reason } => {
                    self.failures.push(BinaryFailure { key, reason })
                }
            }
        }
    }
}

/// Coordinator for export operations
pub struct ExportCoordinator {
    resources: ExportResources,
    settings: ExportSettings,
}

impl ExportCoordinator {
    pub fn new(resources: ExportResources, settings: ExportSettings) -> Self {
        Self {
            resources,
            settings,
        }
    }

    /// Acquire everything the export needs and open the record cursor
    ///
    /// Fails fast, before any event, when a store is missing or unreachable
    /// or the request's projection drops the linkage field.
    pub async fn prepare(&self, request: ExportRequest) -> Result<PreparedExport> {
        request.check_projection()?;

        let documents = self
            .resources
            .documents
            .clone()
            .ok_or(ResourceError::NoDocumentStore)?;
        let objects = self
            .resources
            .objects
            .clone()
            .ok_or(ResourceError::NoObjectStorage)?;

        let blobs = match &request.binary_linkage {
            Some(linkage) => Some(
                documents
                    .blob_store(&linkage.bucket_name)
                    .ok_or(ResourceError::NoBlobStore)?,
            ),
            None => None,
        };

        let source = documents
            .open(&request)
            .await
            .map_err(ExportError::from_open_failure)?;

        debug!(
            collection = %request.collection,
            mode = request.mode(),
            sink = %objects.describe(),
            "Export prepared"
        );

        Ok(PreparedExport {
            context: ExportContext {
                request,
                settings: self.settings.clone(),
                documents,
                objects,
                blobs,
                cancel_token: None,
            },
            source,
        })
    }

    /// Prepare and execute in one step
    pub async fn run(&self, request: ExportRequest, events: EventSender) -> Result<ExportOutcome> {
        Ok(self.prepare(request).await?.execute(events).await)
    }
}

/// An export whose resources are acquired and whose cursor is open
pub struct PreparedExport {
    context: ExportContext,
    source: Box<dyn RecordSource>,
}

/// Everything an executing export shares besides the cursor
struct ExportContext {
    request: ExportRequest,
    settings: ExportSettings,
    documents: Arc<dyn DocumentStore>,
    objects: Arc<dyn ObjectSink>,
    blobs: Option<Arc<dyn BlobStore>>,
    cancel_token: Option<CancellationToken>,
}

/// Bulk upload running behind the pipe
struct BulkUpload {
    writer: PipeWriter,
    handle: JoinHandle<Result<u64>>,
    key: String,
}

impl BulkUpload {
    /// Close the pipe and wait for the upload to finish
    async fn finish(mut self) -> Result<u64> {
        self.writer.close();
        join_upload(self.handle).await
    }

    /// Fail the pipe and return the upload's own error, if it had one
    async fn abort(mut self, reason: &str) -> Option<ExportError> {
        self.writer.fail(reason).await;
        join_upload(self.handle).await.err()
    }
}

async fn join_upload(handle: JoinHandle<Result<u64>>) -> Result<u64> {
    match handle.await {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(e)) => Err(PipelineError::BulkUpload(e.reason()).into()),
        Err(e) => Err(PipelineError::BulkUpload(e.to_string()).into()),
    }
}

impl PreparedExport {
    /// Abort between records once the token is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.context.cancel_token = Some(token);
        self
    }

    pub fn request(&self) -> &ExportRequest {
        &self.context.request
    }

    /// Execute the export
    ///
    /// 1. Count records and binaries (optional, non-fatal)
    /// 2. Stream records into the bulk pipe and submit relays
    /// 3. Close the pipe, await the bulk upload and every relay
    /// 4. Emit `complete`, or `fatal` if anything export-wide failed
    pub async fn execute(self, events: EventSender) -> ExportOutcome {
        let PreparedExport {
            context,
            mut source,
        } = self;
        context.execute(source.as_mut(), events).await
    }
}

impl ExportContext {
    async fn execute(&self, source: &mut dyn RecordSource, events: EventSender) -> ExportOutcome {
        let started = Instant::now();
        let mut outcome = ExportOutcome::default();

        info!(
            collection = %self.request.collection,
            mode = self.request.mode(),
            records = self.request.include_records,
            binaries = self.request.binary_linkage.is_some(),
            "Starting export"
        );

        if self.settings.count_upfront {
            self.emit_counts(&events).await;
        }

        let mut bulk = self.start_bulk_upload();
        let relay = self.blobs.clone().map(|blobs| {
            BinaryRelay::new(
                blobs,
                self.objects.clone(),
                self.settings.signatures.clone(),
                events.clone(),
            )
        });
        let mut limiter = TaskLimiter::new(self.settings.concurrency);

        let streamed = self
            .stream_records(source, &events, bulk.as_ref(), relay.as_ref(), &mut limiter, &mut outcome)
            .await;

        if let Err(e) = source.close().await {
            debug!(error = %e, "Cursor close failed");
        }

        let fatal = match streamed {
            Ok(()) => {
                let bulk_result = async {
                    match bulk.take() {
                        Some(upload) => {
                            let key = upload.key.clone();
                            upload.finish().await.map(|bytes| Some((key, bytes)))
                        }
                        None => Ok(None),
                    }
                };
                let (bulk_result, relays) = tokio::join!(bulk_result, limiter.drain());
                outcome.tally(relays);

                match bulk_result {
                    Ok(Some((key, bytes))) => {
                        outcome.record_key = Some(key);
                        outcome.record_bytes = bytes;
                        None
                    }
                    Ok(None) => None,
                    Err(e) => Some(e),
                }
            }
            Err(e) => {
                let reason = e.reason();
                let upload_error = match bulk.take() {
                    Some(upload) => upload.abort(&reason).await,
                    None => None,
                };
                outcome.tally(limiter.abort().await);

                // A closed pipe means the upload itself gave up first
                match (e, upload_error) {
                    (ExportError::Pipeline(PipelineError::PipeClosed), Some(upload)) => Some(upload),
                    (e, _) => Some(e),
                }
            }
        };

        outcome.elapsed_ms = started.elapsed().as_millis() as u64;

        match fatal {
            None => {
                info!(
                    records = outcome.records,
                    binaries = outcome.binaries,
                    not_found = outcome.not_found.len(),
                    failures = outcome.failures.len(),
                    elapsed_ms = outcome.elapsed_ms,
                    "Export completed"
                );
                events.emit(TransferEvent::Complete {
                    records: outcome.records,
                    binaries: outcome.binaries,
                    failures: outcome.failure_events(),
                    elapsed_ms: outcome.elapsed_ms,
                });
            }
            Some(e) => {
                let reason = e.reason();
                error!(reason = %reason, records = outcome.records, "Export aborted");
                events.emit(TransferEvent::FatalError {
                    reason: reason.clone(),
                });
                outcome.fatal = Some(reason);
            }
        }

        outcome
    }

    async fn emit_counts(&self, events: &EventSender) {
        match self.count().await {
            Ok((total_records, total_binaries)) => {
                debug!(total_records, total_binaries, "Counted export");
                events.emit(TransferEvent::Count {
                    total_records,
                    total_binaries,
                });
            }
            Err(e) => {
                warn!(error = %e, "Count unavailable, continuing without totals");
                events.emit(TransferEvent::CountUnavailable);
            }
        }
    }

    async fn count(&self) -> Result<(u64, u64)> {
        let records = self.documents.count_records(&self.request).await?;
        let binaries = match &self.request.binary_linkage {
            Some(linkage) => self.count_binaries(linkage).await?,
            None => 0,
        };
        Ok((records, binaries))
    }

    async fn count_binaries(&self, linkage: &BinaryLinkage) -> Result<u64> {
        self.documents.count_binaries(&self.request, linkage).await
    }

    fn start_bulk_upload(&self) -> Option<BulkUpload> {
        if !self.request.include_records {
            return None;
        }
        let key = self.request.record_key();
        let (writer, reader) = bulk_pipe(self.settings.pipe_capacity);
        let target = UploadTarget::new(key.clone(), self.settings.record_content_type.clone());
        let sink = self.objects.clone();
        let handle = tokio::spawn(async move { sink.upload(target, reader).await });

        debug!(key = %key, "Bulk record upload started");
        Some(BulkUpload {
            writer,
            handle,
            key,
        })
    }

    async fn stream_records(
        &self,
        source: &mut dyn RecordSource,
        events: &EventSender,
        bulk: Option<&BulkUpload>,
        relay: Option<&BinaryRelay>,
        limiter: &mut TaskLimiter<RelayOutcome>,
        outcome: &mut ExportOutcome,
    ) -> Result<()> {
        let serializer = RecordSerializer::new();
        let linkage = self.request.binary_linkage.clone();

        loop {
            if let Some(token) = &self.cancel_token {
                if token.is_cancelled() {
                    info!(records = outcome.records, "Export cancelled");
                    return Err(PipelineError::Cancelled.into());
                }
            }

            let Some(record) = source.next_record().await? else {
                break;
            };
            outcome.records += 1;

            if let Some(bulk) = bulk {
                bulk.writer.write(serializer.serialize(&record)).await?;
                events.emit(TransferEvent::RecordProgress {
                    processed: outcome.records,
                });
            }

            if let (Some(linkage), Some(relay)) = (&linkage, relay) {
                match linkage.task_for(&record) {
                    Some(task) => {
                        debug!(key = %task.lookup.raw, "Submitting binary relay");
                        let relay = relay.clone();
                        limiter.submit(async move { relay.relay(task).await }).await?;
                    }
                    None => debug!(
                        field = %linkage.source_field,
                        "Record has no linkage value, skipping relay"
                    ),
                }
            }
        }

        debug!(
            records = outcome.records,
            peak_relays = limiter.peak_in_flight(),
            "Cursor exhausted"
        );
        Ok(())
    }
}
