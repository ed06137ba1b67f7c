//! Error handling for the export pipeline.
//!
//! Errors are grouped by how the pipeline reacts to them:
//! - `ResourceUnavailable` / `Configuration`: fail fast, before any event
//! - `NotFound` / `Transfer`: recorded against a single binary relay
//! - `Pipeline`: aborts the export, reported once as a `fatal` event
//!
//! MongoDB driver errors are summarised into one-line reasons by [`mongo`].

pub mod kinds;
pub mod mongo;

// Re-export commonly used types
pub use kinds::{
    ConfigError, ExportError, PipelineError, ResourceError, Result, TransferError,
};
pub use mongo::{ErrorInfo, summarize};
