use std::{fmt, io};

use crate::error::mongo::summarize;

/// Crate-wide `Result` type using [`ExportError`] as the error.
///
/// This alias is re-exported by the parent `error` module and is intended
/// to be used throughout the crate for fallible operations.
pub type Result<T> = std::result::Result<T, ExportError>;

/// Top-level error type for export operations.
///
/// The first five variants mirror how a failure is handled by the pipeline;
/// the remaining ones wrap lower-level errors before they are classified.
#[derive(Debug)]
pub enum ExportError {
    /// A store or bucket client is missing or unreachable. Fatal before any work starts.
    ResourceUnavailable(ResourceError),

    /// The request or configuration is inconsistent. Fatal before any work starts.
    Configuration(ConfigError),

    /// A computed lookup key has no matching binary object.
    NotFound(String),

    /// I/O failure while relaying one binary object.
    Transfer(TransferError),

    /// Cursor or bulk-upload failure that aborts the whole export.
    Pipeline(PipelineError),

    /// I/O errors.
    Io(io::Error),

    /// MongoDB driver errors.
    MongoDb(mongodb::error::Error),

    /// Generic error with a free-form message.
    Generic(String),
}

/// Missing or unreachable collaborators.
#[derive(Debug)]
pub enum ResourceError {
    /// No MongoDB client was configured.
    NoDocumentStore,

    /// No object storage client or bucket was configured.
    NoObjectStorage,

    /// Binary linkage requested but no chunked store is available.
    NoBlobStore,

    /// The store answered with a connectivity failure.
    Unreachable(String),
}

/// Configuration and request validation errors.
#[derive(Debug)]
pub enum ConfigError {
    /// Config file not found.
    FileNotFound(String),

    /// Invalid config format.
    InvalidFormat(String),

    /// Invalid field value.
    InvalidValue { field: String, value: String },

    /// The export request is invalid.
    InvalidRequest(String),

    /// The linkage source field is removed by the query projection.
    FieldNotProjected(String),
}

/// Per-binary transfer failures.
#[derive(Debug)]
pub enum TransferError {
    /// Reading the chunked-store object failed.
    Read(String),

    /// The object storage upload failed.
    Upload(String),

    /// The upload was aborted after a failed part.
    Aborted(String),

    /// The relay task panicked before settling.
    Panicked,
}

/// Export-wide failures.
#[derive(Debug)]
pub enum PipelineError {
    /// The result cursor failed while streaming.
    Cursor(String),

    /// The bulk record upload failed.
    BulkUpload(String),

    /// A write was attempted on a closed pipe.
    PipeClosed,

    /// A relay task could not be scheduled.
    Scheduler(String),

    /// The export was cancelled between records.
    Cancelled,
}

impl ExportError {
    /// Whether this error aborts the whole export rather than a single relay.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ExportError::NotFound(_) | ExportError::Transfer(_))
    }

    /// Whether this error was raised while acquiring resources, before any event.
    pub fn is_acquisition(&self) -> bool {
        matches!(
            self,
            ExportError::ResourceUnavailable(_) | ExportError::Configuration(_)
        )
    }

    /// Classify an error raised while opening the result cursor.
    ///
    /// Connectivity problems become [`ExportError::ResourceUnavailable`];
    /// server-side rejections of the query itself are configuration errors.
    pub fn from_open_failure(err: ExportError) -> ExportError {
        match err {
            ExportError::MongoDb(e) => {
                use mongodb::error::ErrorKind;
                match e.kind.as_ref() {
                    ErrorKind::ServerSelection { .. }
                    | ErrorKind::Io(_)
                    | ErrorKind::Authentication { .. }
                    | ErrorKind::DnsResolve { .. }
                    | ErrorKind::ConnectionPoolCleared { .. } => {
                        ResourceError::Unreachable(summarize(&e)).into()
                    }
                    _ => ConfigError::InvalidRequest(summarize(&e)).into(),
                }
            }
            other => other,
        }
    }

    /// One-line, human-readable reason for event payloads.
    pub fn reason(&self) -> String {
        match self {
            ExportError::MongoDb(e) => summarize(e),
            ExportError::NotFound(_) => "not found".to_string(),
            ExportError::Transfer(e) => e.to_string(),
            ExportError::Pipeline(e) => e.to_string(),
            other => other.to_string(),
        }
    }
}

/* ========================= Display & Error impls ========================= */

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportError::ResourceUnavailable(e) => write!(f, "Resource unavailable: {e}"),
            ExportError::Configuration(e) => write!(f, "Configuration error: {e}"),
            ExportError::NotFound(key) => write!(f, "Binary object not found: {key}"),
            ExportError::Transfer(e) => write!(f, "Transfer failed: {e}"),
            ExportError::Pipeline(e) => write!(f, "Export aborted: {e}"),
            ExportError::Io(e) => write!(f, "I/O error: {e}"),
            ExportError::MongoDb(e) => write!(f, "MongoDB error: {}", summarize(e)),
            ExportError::Generic(msg) => write!(f, "{msg}"),
        }
    }
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceError::NoDocumentStore => write!(f, "No Mongo client initialized"),
            ResourceError::NoObjectStorage => write!(f, "No object storage client initialized"),
            ResourceError::NoBlobStore => write!(f, "No GridFS bucket available"),
            ResourceError::Unreachable(msg) => write!(f, "Store unreachable: {msg}"),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {path}"),
            ConfigError::InvalidFormat(msg) => write!(f, "Invalid config format: {msg}"),
            ConfigError::InvalidValue { field, value } => {
                write!(f, "Invalid value '{value}' for field '{field}'")
            }
            ConfigError::InvalidRequest(msg) => write!(f, "Invalid export request: {msg}"),
            ConfigError::FieldNotProjected(field) => {
                write!(f, "GridFS source field '{field}' missing in projection query")
            }
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Read(msg) => write!(f, "read failed: {msg}"),
            TransferError::Upload(msg) => write!(f, "upload failed: {msg}"),
            TransferError::Aborted(msg) => write!(f, "upload aborted: {msg}"),
            TransferError::Panicked => write!(f, "relay panicked"),
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Cursor(msg) => write!(f, "cursor failed: {msg}"),
            PipelineError::BulkUpload(msg) => write!(f, "record upload failed: {msg}"),
            PipelineError::PipeClosed => write!(f, "record pipe already closed"),
            PipelineError::Scheduler(msg) => write!(f, "relay scheduling failed: {msg}"),
            PipelineError::Cancelled => write!(f, "export cancelled"),
        }
    }
}

impl std::error::Error for ExportError {}
impl std::error::Error for ResourceError {}
impl std::error::Error for ConfigError {}
impl std::error::Error for TransferError {}
impl std::error::Error for PipelineError {}

/* ========================= Conversions to ExportError ========================= */

impl From<io::Error> for ExportError {
    fn from(err: io::Error) -> Self {
        ExportError::Io(err)
    }
}

impl From<mongodb::error::Error> for ExportError {
    fn from(err: mongodb::error::Error) -> Self {
        ExportError::MongoDb(err)
    }
}

impl From<ResourceError> for ExportError {
    fn from(err: ResourceError) -> Self {
        ExportError::ResourceUnavailable(err)
    }
}

impl From<ConfigError> for ExportError {
    fn from(err: ConfigError) -> Self {
        ExportError::Configuration(err)
    }
}

impl From<TransferError> for ExportError {
    fn from(err: TransferError) -> Self {
        ExportError::Transfer(err)
    }
}

impl From<PipelineError> for ExportError {
    fn from(err: PipelineError) -> Self {
        ExportError::Pipeline(err)
    }
}

impl From<toml::de::Error> for ExportError {
    fn from(err: toml::de::Error) -> Self {
        ExportError::Configuration(ConfigError::InvalidFormat(err.to_string()))
    }
}

impl From<serde_json::Error> for ExportError {
    fn from(err: serde_json::Error) -> Self {
        ExportError::Configuration(ConfigError::InvalidRequest(err.to_string()))
    }
}

impl From<String> for ExportError {
    fn from(msg: String) -> Self {
        ExportError::Generic(msg)
    }
}

impl From<&str> for ExportError {
    fn from(msg: &str) -> Self {
        ExportError::Generic(msg.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_classification() {
        assert!(!ExportError::NotFound("a".into()).is_fatal());
        assert!(!ExportError::Transfer(TransferError::Read("eof".into())).is_fatal());
        assert!(ExportError::Pipeline(PipelineError::PipeClosed).is_fatal());
        assert!(ExportError::from(ResourceError::NoDocumentStore).is_acquisition());
        assert!(!ExportError::Pipeline(PipelineError::PipeClosed).is_acquisition());
    }

    #[test]
    fn test_not_found_reason() {
        assert_eq!(ExportError::NotFound("abc".into()).reason(), "not found");
    }

    #[test]
    fn test_display_messages() {
        let err = ExportError::from(ConfigError::FieldNotProjected("photo".into()));
        assert_eq!(
            err.to_string(),
            "Configuration error: GridFS source field 'photo' missing in projection query"
        );
        let err = ExportError::from(TransferError::Read("connection reset".into()));
        assert_eq!(err.reason(), "read failed: connection reset");
    }

    #[test]
    fn test_panic_and_cancellation_reasons() {
        let panicked = ExportError::from(TransferError::Panicked);
        assert!(!panicked.is_fatal());
        assert_eq!(panicked.reason(), "relay panicked");

        let cancelled = ExportError::from(PipelineError::Cancelled);
        assert!(cancelled.is_fatal());
        assert!(!cancelled.is_acquisition());
        assert_eq!(cancelled.reason(), "export cancelled");
    }
}
