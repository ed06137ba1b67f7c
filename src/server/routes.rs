//! Request handlers

use std::convert::Infallible;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use dashmap::mapref::entry::Entry;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use super::{ApiError, AppState, Slot, SlotClaim};
use crate::broadcast::{Session, SinkGuard};
use crate::export::{ExportOutcome, ExportRequest, PreparedExport, event_channel};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageQuery {
    /// Reuse an existing slot instead of allocating one
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResponse {
    pub session_id: String,
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "OK" })))
}

/// Validate a request and stage it in a session slot
pub async fn stage(
    State(state): State<AppState>,
    Query(query): Query<StageQuery>,
    body: String,
) -> Result<(StatusCode, Json<StageResponse>), ApiError> {
    let request = ExportRequest::from_json(&body)?;
    request.validate()?;

    let session_id = query
        .session_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    match state.slots.entry(session_id.clone()) {
        Entry::Occupied(mut slot) => {
            if matches!(slot.get(), Slot::Running) {
                return Err(ApiError::conflict(
                    "EXPORT_RUNNING",
                    format!("Export for session {session_id} is still running"),
                ));
            }
            slot.insert(Slot::Staged(request));
        }
        Entry::Vacant(slot) => {
            slot.insert(Slot::Staged(request));
        }
    }

    info!(session = %session_id, "Export staged");
    Ok((StatusCode::CREATED, Json(StageResponse { session_id })))
}

/// Start the staged export and stream its events
///
/// Resource and request errors are returned as plain HTTP errors before the
/// stream opens. The stream ends with an `end` frame; closing the connection
/// only detaches this listener.
pub async fn events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let (claim, prepared) = claim_and_prepare(&state, &id).await?;

    let session = state.hub.session(&id);
    let (sink, mut frames) = session.subscribe();
    let guard = SinkGuard::new(session.clone(), sink);

    spawn_export(&state, claim, prepared, session);

    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(frame) = frames.recv().await {
            let end = frame.is_end();
            yield Ok(Event::default().event(frame.tag()).data(frame.data()));
            if end {
                break;
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.keep_alive)
            .text("keep-alive"),
    ))
}

/// Run the staged export and answer with its outcome
pub async fn run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExportOutcome>, ApiError> {
    let (claim, prepared) = claim_and_prepare(&state, &id).await?;
    let session = state.hub.session(&id);

    let outcome = spawn_export(&state, claim, prepared, session)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(outcome))
}

async fn claim_and_prepare(
    state: &AppState,
    id: &str,
) -> Result<(SlotClaim, PreparedExport), ApiError> {
    let mut claim = state.claim(id)?;
    let request = claim
        .take_request()
        .ok_or_else(|| ApiError::internal("staged request missing"))?;

    let prepared = state
        .coordinator
        .prepare(request)
        .await?
        .with_cancellation(state.shutdown.child_token());
    Ok((claim, prepared))
}

/// Run an export detached from the HTTP connection
///
/// Events are pumped into the session until the terminal event; the slot is
/// released once both sides are done.
fn spawn_export(
    state: &AppState,
    claim: SlotClaim,
    prepared: PreparedExport,
    session: std::sync::Arc<Session>,
) -> JoinHandle<ExportOutcome> {
    let hub = state.hub.clone();
    tokio::spawn(async move {
        let (tx, rx) = event_channel();
        let (outcome, ()) = tokio::join!(prepared.execute(tx), hub.pump(session, rx));

        info!(
            session = %claim.id(),
            records = outcome.records,
            binaries = outcome.binaries,
            failed = outcome.failure_events(),
            fatal = outcome.fatal.is_some(),
            "Export session finished"
        );
        drop(claim);
        outcome
    })
}
