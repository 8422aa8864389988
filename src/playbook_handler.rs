use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::cron_handler::verify_api_key;
use crate::errors::{ActionResult, AppError};
use crate::handlers::AppState;
use crate::playbook_sync::{PlaybookAction, PlaybookSync};

#[derive(Debug, Deserialize)]
pub struct PlaybookActionRequest {
    pub action: PlaybookAction,
}

fn playbook_sync(state: &AppState, headers: &HeaderMap) -> Result<PlaybookSync, AppError> {
    let key = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    verify_api_key(&state.config, key)?;

    let client = state.playbook_client.clone().ok_or_else(|| {
        AppError::InternalError("Dialer integration is not configured".to_string())
    })?;
    Ok(PlaybookSync::new(state.db.clone(), client))
}

/// DELETE /api/playbooks/:id
///
/// Removes the playbook's contacts from the dialer, then deletes it locally.
///
/// # Arguments
///
/// * `headers` - Must carry the shared secret in `X-Api-Key`.
/// * `id` - Local playbook id.
pub async fn delete_playbook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<ActionResult>, AppError> {
    tracing::info!("DELETE /api/playbooks/{}", id);

    let removed = playbook_sync(&state, &headers)?.delete_playbook(id).await?;
    Ok(Json(
        ActionResult::ok("Playbook deleted").with_data(&json!({ "contacts_removed": removed })),
    ))
}

/// POST /api/playbooks/:id with `{"action": "start" | "stop"}`.
pub async fn playbook_action(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(payload): Json<PlaybookActionRequest>,
) -> Result<Json<ActionResult>, AppError> {
    tracing::info!("POST /api/playbooks/{} - {:?}", id, payload.action);

    let playbook = playbook_sync(&state, &headers)?
        .apply_action(id, payload.action)
        .await?;
    Ok(Json(
        ActionResult::ok(format!("Playbook {}", playbook.status)).with_data(&playbook),
    ))
}

/// POST /api/playbooks/:id/sync
pub async fn sync_playbook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<ActionResult>, AppError> {
    let result = playbook_sync(&state, &headers)?.sync_contacts(id).await?;
    Ok(Json(
        ActionResult::ok(format!(
            "{} of {} contact(s) synced",
            result.succeeded, result.total
        ))
        .with_data(&result),
    ))
}
