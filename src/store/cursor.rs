//! Cursor-backed record source
//!
//! Works for both find and aggregate cursors: the caller pulls one record
//! at a time so the result set is never materialized.

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::Cursor;
use mongodb::bson::Document;
use tracing::{debug, info};

use super::RecordSource;
use crate::error::{ExportError, PipelineError, Result};

/// Record source over a driver cursor
pub struct CursorRecordSource {
    cursor: Option<Cursor<Document>>,
    total_fetched: u64,
    query_type: &'static str,
    closed: bool,
}

impl CursorRecordSource {
    /// Wrap a cursor; `query_type` is used for logging ("find" or "aggregate")
    pub fn new(cursor: Cursor<Document>, query_type: &'static str) -> Self {
        Self {
            cursor: Some(cursor),
            total_fetched: 0,
            query_type,
            closed: false,
        }
    }

    pub fn find(cursor: Cursor<Document>) -> Self {
        Self::new(cursor, "find")
    }

    pub fn aggregate(cursor: Cursor<Document>) -> Self {
        Self::new(cursor, "aggregate")
    }

    pub fn total_fetched(&self) -> u64 {
        self.total_fetched
    }
}

#[async_trait]
impl RecordSource for CursorRecordSource {
    async fn next_record(&mut self) -> Result<Option<Document>> {
        if self.closed {
            return Ok(None);
        }

        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };

        match cursor.try_next().await {
            Ok(Some(record)) => {
                self.total_fetched += 1;
                Ok(Some(record))
            }
            Ok(None) => {
                debug!(
                    query_type = self.query_type,
                    total = self.total_fetched,
                    "Cursor exhausted"
                );
                self.cursor = None;
                self.closed = true;
                Ok(None)
            }
            Err(e) => {
                // Release the cursor before surfacing the failure
                self.cursor = None;
                self.closed = true;
                Err(ExportError::Pipeline(PipelineError::Cursor(
                    ExportError::MongoDb(e).reason(),
                )))
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.cursor = None;
            self.closed = true;
            info!(
                query_type = self.query_type,
                total = self.total_fetched,
                "Closed cursor"
            );
        }
        Ok(())
    }
}

impl Drop for CursorRecordSource {
    fn drop(&mut self) {
        if !self.closed {
            debug!(query_type = self.query_type, "Cursor dropped without explicit close");
            self.cursor = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_source_trait_object() {
        fn _accepts_record_source(_source: Box<dyn RecordSource>) {}
        fn _boxes_cursor(cursor: Cursor<Document>) -> Box<dyn RecordSource> {
            Box::new(CursorRecordSource::find(cursor))
        }
    }
}
