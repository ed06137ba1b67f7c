//! MongoDB to S3 streaming export
//!
//! Streams the result of a MongoDB query or aggregation into an S3 bucket as
//! one JSON Lines object, and relays the GridFS files referenced by each
//! record into the same bucket with content-sniffed types and extensions.
//!
//! # Modules
//!
//! - `broadcast`: Per-session progress fan-out and SSE framing
//! - `cli`: Command-line interface and argument parsing
//! - `config`: Configuration management
//! - `connection`: MongoDB and S3 client construction
//! - `error`: Error types and handling
//! - `export`: Export pipeline (coordinator, relay, sniffer, limiter, events)
//! - `server`: HTTP surface for staging and streaming exports
//! - `storage`: Object sinks (S3 single-shot and multipart uploads)
//! - `store`: Record sources and GridFS access
//!
//! # Example
//!
//! ```no_run
//! use mongo_s3_export::{Config, ConnectionManager, ExportCoordinator, ExportRequest};
//! use mongo_s3_export::export::{ExportSettings, event_channel};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(None)?;
//!     let mut manager = ConnectionManager::new(config.clone());
//!     manager.connect().await?;
//!
//!     let coordinator =
//!         ExportCoordinator::new(manager.resources(), ExportSettings::from_config(&config)?);
//!     let request = ExportRequest::from_json(
//!         r#"{"collection":"users","mode":"query","filter":{},"includeRecords":true}"#,
//!     )?;
//!
//!     let (events, _rx) = event_channel();
//!     let outcome = coordinator.run(request, events).await?;
//!     println!("exported {} records", outcome.records);
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod export;
pub mod server;
pub mod storage;
pub mod store;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::Config;
pub use connection::ConnectionManager;
pub use error::{ExportError, Result};
pub use export::{ExportCoordinator, ExportOutcome, ExportRequest, TransferEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library version string
pub fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
