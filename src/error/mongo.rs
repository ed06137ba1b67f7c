use serde::{Deserialize, Serialize};

/// Structured error information extracted from MongoDB errors.
///
/// Feeds [`summarize`], which produces the reasons carried by events.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub(crate) error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) message: Option<String>,
}

impl ErrorInfo {
    /// Convert error info to compact JSON string (single line).
    pub fn to_json_compact(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Extract structured information from a MongoDB error using the driver API.
///
/// Only read-path failures matter here: cursor commands, aggregation,
/// GridFS lookups and connectivity.
pub fn extract_error_info(error: &mongodb::error::Error) -> ErrorInfo {
    use mongodb::error::{ErrorKind, GridFsErrorKind};

    let mut info = ErrorInfo::default();

    match error.kind.as_ref() {
        ErrorKind::Command(command_error) => {
            info.error_type = Some("mongo.command_error".to_string());
            info.code = Some(command_error.code);
            info.message = Some(command_error.message.clone());
            info.name = get_error_name(command_error.code);
        }
        ErrorKind::Authentication { message, .. } => {
            info.error_type = Some("mongo.authentication_error".to_string());
            info.message = Some(message.clone());
        }
        ErrorKind::InvalidArgument { message, .. } => {
            info.error_type = Some("mongo.invalid_argument".to_string());
            info.message = Some(message.clone());
        }
        ErrorKind::ServerSelection { message, .. } => {
            info.error_type = Some("mongo.server_selection_error".to_string());
            info.message = Some(message.clone());
        }
        ErrorKind::Io(io_error) => {
            info.error_type = Some("mongo.io_error".to_string());
            info.message = Some(io_error.to_string());
        }
        ErrorKind::GridFs(GridFsErrorKind::FileNotFound { identifier, .. }) => {
            info.error_type = Some("mongo.gridfs_error".to_string());
            info.message = Some(format!("file not found: {identifier:?}"));
        }
        _ => {
            // For other error types, fall back to the Display representation.
            info.message = Some(error.to_string());
        }
    }

    info
}

/// One-line summary of a driver error, e.g. `Unauthorized (13): not authorized on db`.
pub fn summarize(error: &mongodb::error::Error) -> String {
    let info = extract_error_info(error);
    let message = info.message.unwrap_or_else(|| error.to_string());
    match (info.name, info.code) {
        (Some(name), Some(code)) => format!("{name} ({code}): {message}"),
        (None, Some(code)) => format!("code {code}: {message}"),
        _ => message,
    }
}

/// Get a human-readable error name from a MongoDB error code.
fn get_error_name(code: i32) -> Option<String> {
    let name = match code {
        2 => "BadValue",
        13 => "Unauthorized",
        18 => "AuthenticationFailed",
        26 => "NamespaceNotFound",
        43 => "CursorNotFound",
        50 => "MaxTimeMSExpired",
        292 => "QueryExceededMemoryLimitNoDiskUseAllowed",
        40324 => "UnrecognizedPipelineStage",
        _ => return None,
    };

    Some(name.to_string())
}
