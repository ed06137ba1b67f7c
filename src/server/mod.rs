//! HTTP surface
//!
//! Clients stage an export, then open its event stream to start it:
//!
//! ```text
//! POST /api/exports              stage a request, returns { sessionId }
//! GET  /api/exports/{id}/events  run the staged export, stream events (SSE)
//! GET  /api/exports/{id}         run the staged export, return the outcome
//! GET  /health                   liveness
//! ```
//!
//! Each session id is a slot holding at most one export. Staging into a slot
//! whose export is running is rejected; a staged but unstarted request is
//! replaced.

pub mod error;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::{ProgressHub, SessionId};
use crate::config::ServerConfig;
use crate::error::{ConfigError, Result};
use crate::export::{ExportCoordinator, ExportRequest};

pub use error::ApiError;

/// What a session slot currently holds
#[derive(Debug)]
pub enum Slot {
    /// Validated and waiting for a client to start it
    Staged(ExportRequest),
    /// Started; released when the export reaches its terminal event
    Running,
}

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<ExportCoordinator>,
    pub hub: Arc<ProgressHub>,
    pub slots: Arc<DashMap<SessionId, Slot>>,
    pub keep_alive: Duration,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(coordinator: ExportCoordinator, keep_alive: Duration) -> Self {
        Self {
            coordinator: Arc::new(coordinator),
            hub: Arc::new(ProgressHub::new()),
            slots: Arc::new(DashMap::new()),
            keep_alive,
            shutdown: CancellationToken::new(),
        }
    }

    /// Move a staged request into the running state
    pub fn claim(&self, id: &str) -> std::result::Result<SlotClaim, ApiError> {
        let Some(mut slot) = self.slots.get_mut(id) else {
            return Err(ApiError::not_found(
                "SESSION_NOT_FOUND",
                format!("No export staged for session {id}"),
            ));
        };
        let request = match std::mem::replace(slot.value_mut(), Slot::Running) {
            Slot::Staged(request) => request,
            Slot::Running => {
                return Err(ApiError::conflict(
                    "EXPORT_RUNNING",
                    format!("Export for session {id} is already running"),
                ));
            }
        };
        drop(slot);

        Ok(SlotClaim {
            slots: self.slots.clone(),
            id: id.to_string(),
            request: Some(request),
        })
    }
}

/// A running slot; the slot is released when the claim is dropped
pub struct SlotClaim {
    slots: Arc<DashMap<SessionId, Slot>>,
    id: SessionId,
    request: Option<ExportRequest>,
}

impl SlotClaim {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Take the staged request out of the claim
    pub fn take_request(&mut self) -> Option<ExportRequest> {
        self.request.take()
    }
}

impl Drop for SlotClaim {
    fn drop(&mut self) {
        self.slots
            .remove_if(&self.id, |_, slot| matches!(slot, Slot::Running));
        debug!(session = %self.id, "Session slot released");
    }
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/api/exports", post(routes::stage))
        .route("/api/exports/{id}", get(routes::run))
        .route("/api/exports/{id}/events", get(routes::events))
        .with_state(state)
}

/// Serve until Ctrl+C or SIGTERM
///
/// Running exports are cancelled on shutdown so their streams end.
pub async fn serve(config: &ServerConfig, state: AppState) -> Result<()> {
    let addr: SocketAddr = config.bind.parse().map_err(|_| ConfigError::InvalidValue {
        field: "server.bind".to_string(),
        value: config.bind.clone(),
    })?;

    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "Export server listening");

    let shutdown = state.shutdown.clone();
    let app = router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await?;

    info!("Export server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => debug!("Received Ctrl+C, shutting down"),
        _ = terminate => debug!("Received SIGTERM, shutting down"),
    }
}
