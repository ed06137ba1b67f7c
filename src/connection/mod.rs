//! Store and bucket clients
//!
//! Builds the MongoDB client and the S3 sink from configuration. Either may
//! be left uninitialized when its settings are absent; exports then fail
//! with a resource error at preparation time rather than at startup.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mongodb::bson::doc;
use mongodb::options::ClientOptions;
use mongodb::{Client, Database};
use tracing::{debug, info, warn};

use crate::config::{Config, MongoConfig, StorageConfig};
use crate::error::{ExportError, ResourceError, Result};
use crate::export::ExportResources;
use crate::storage::S3Sink;
use crate::store::MongoDocumentStore;

/// Connection state information
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No URI configured
    Unconfigured,

    /// Client built and the server answered a ping
    Connected,

    /// Client built but the server did not answer
    Failed(String),
}

/// Health check result
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Whether the server answered
    pub is_healthy: bool,

    /// Response time in milliseconds
    pub response_time_ms: u64,
}

/// Owns the MongoDB client and the S3 sink for the process
pub struct ConnectionManager {
    config: Config,
    client: Option<Client>,
    sink: Option<S3Sink>,
    state: ConnectionState,
}

impl ConnectionManager {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            client: None,
            sink: None,
            state: ConnectionState::Unconfigured,
        }
    }

    /// Build both clients
    ///
    /// Only malformed settings fail here; an unreachable server is recorded
    /// in [`ConnectionManager::state`] and surfaces when an export starts.
    pub async fn connect(&mut self) -> Result<()> {
        self.client = connect_mongo(&self.config.mongo).await?;

        self.state = match &self.client {
            None => ConnectionState::Unconfigured,
            Some(client) => match ping(&client.database(&self.config.mongo.database)).await {
                Ok(status) => {
                    info!(
                        database = %self.config.mongo.database,
                        response_time_ms = status.response_time_ms,
                        "Connected to MongoDB"
                    );
                    ConnectionState::Connected
                }
                Err(e) => {
                    warn!(error = %e, "MongoDB did not answer ping");
                    ConnectionState::Failed(e.reason())
                }
            },
        };

        if let Some(bucket) = &self.config.storage.bucket {
            let client = build_s3_client(&self.config.storage).await;
            self.sink = S3Sink::from_config(client, &self.config.storage);
            info!(bucket = %bucket, "S3 storage initialized");
        } else {
            warn!("No bucket configured, exports will be rejected");
        }

        Ok(())
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn client(&self) -> Option<&Client> {
        self.client.as_ref()
    }

    pub fn database(&self) -> Result<Database> {
        self.client
            .as_ref()
            .map(|c| c.database(&self.config.mongo.database))
            .ok_or_else(|| ExportError::from(ResourceError::NoDocumentStore))
    }

    pub fn sink(&self) -> Option<&S3Sink> {
        self.sink.as_ref()
    }

    /// Stores and sinks for the export coordinator
    pub fn resources(&self) -> ExportResources {
        ExportResources {
            documents: self.client.as_ref().map(|client| {
                Arc::new(MongoDocumentStore::new(
                    client.database(&self.config.mongo.database),
                    self.config.mongo.batch_size,
                )) as Arc<dyn crate::store::DocumentStore>
            }),
            objects: self
                .sink
                .clone()
                .map(|sink| Arc::new(sink) as Arc<dyn crate::storage::ObjectSink>),
        }
    }
}

/// Build a MongoDB client, or `None` when no URI is configured
pub async fn connect_mongo(config: &MongoConfig) -> Result<Option<Client>> {
    let Some(uri) = config.uri.as_deref() else {
        return Ok(None);
    };

    let mut options = ClientOptions::parse(uri)
        .await
        .map_err(|e| ExportError::from_open_failure(e.into()))?;
    options.app_name = Some(config.app_name.clone());
    options.server_selection_timeout = Some(Duration::from_secs(config.timeout));

    let client = Client::with_options(options)?;
    debug!(app_name = %config.app_name, "MongoDB client created");
    Ok(Some(client))
}

/// Round-trip a ping to the server
pub async fn ping(database: &Database) -> Result<HealthStatus> {
    let started = Instant::now();
    database
        .run_command(doc! { "ping": 1 })
        .await
        .map_err(|e| ExportError::from_open_failure(e.into()))?;
    Ok(HealthStatus {
        is_healthy: true,
        response_time_ms: started.elapsed().as_millis() as u64,
    })
}

/// Build an S3 client from storage configuration
///
/// A custom endpoint switches to path-style addressing, which most
/// S3-compatible services require.
pub async fn build_s3_client(config: &StorageConfig) -> aws_sdk_s3::Client {
    let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest());

    if let Some(region) = &config.region {
        config_loader = config_loader.region(aws_sdk_s3::config::Region::new(region.clone()));
    }

    let sdk_config = config_loader.load().await;
    let mut s3_config = aws_sdk_s3::config::Builder::from(&sdk_config);

    if let Some(endpoint_url) = &config.endpoint {
        s3_config = s3_config.endpoint_url(endpoint_url).force_path_style(true);
    }

    aws_sdk_s3::Client::from_conf(s3_config.build())
}
