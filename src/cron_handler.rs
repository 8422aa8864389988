use axum::{extract::State, Json};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::calendar::{TimeslotGenerator, MAX_GENERATION_DAYS};
use crate::config::Config;
use crate::errors::{ActionResult, AppError};
use crate::handlers::AppState;
use crate::playbook_sync::PlaybookSync;
use crate::status_rules::Disposition;
use crate::status_service::StatusService;

const DEFAULT_GENERATION_DAYS: i64 = 14;

/// Body shared by every cron endpoint; the scheduler sends the key inline.
#[derive(Debug, Deserialize)]
pub struct CronRequest {
    pub api_key: Option<String>,
    #[serde(default)]
    pub disposition: Disposition,
    pub days_ahead: Option<i64>,
}

#[derive(Debug, Serialize)]
struct PlaybookSyncEntry {
    playbook_id: uuid::Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<crate::playbook_sync::SyncResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Checks a caller-supplied key against `CRON_API_KEY`.
pub fn verify_api_key(config: &Config, provided: Option<&str>) -> Result<(), AppError> {
    let provided =
        provided.ok_or_else(|| AppError::Unauthorized("Missing API key".to_string()))?;

    // Constant-time comparison to prevent timing attacks
    if !constant_time_compare(provided, &config.cron_api_key) {
        tracing::warn!("Invalid API key received");
        return Err(AppError::Unauthorized("Invalid API key".to_string()));
    }
    Ok(())
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// POST /api/cron/appointment-status
///
/// Marks upcoming appointments that started more than the configured
/// threshold ago as `done` (default) or `missed`.
pub async fn appointment_status(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CronRequest>,
) -> Result<Json<ActionResult>, AppError> {
    verify_api_key(&state.config, payload.api_key.as_deref())?;

    let summary = StatusService::new(state.db.clone(), &state.config)
        .sweep_appointments(Utc::now(), payload.disposition, None)
        .await?;

    Ok(Json(
        ActionResult::ok(format!(
            "{} appointment(s) marked {}",
            summary.appointment_ids.len(),
            payload.disposition.status()
        ))
        .with_data(&summary),
    ))
}

/// POST /api/cron/generate-timeslots
///
/// Generates slots from today for `days_ahead` days (default two weeks).
pub async fn generate_timeslots(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CronRequest>,
) -> Result<Json<ActionResult>, AppError> {
    verify_api_key(&state.config, payload.api_key.as_deref())?;

    let days = payload.days_ahead.unwrap_or(DEFAULT_GENERATION_DAYS);
    if !(1..=MAX_GENERATION_DAYS).contains(&days) {
        return Err(AppError::Validation(format!(
            "days_ahead must be between 1 and {}",
            MAX_GENERATION_DAYS
        )));
    }

    let from = state.config.business_today();
    let to = from + Duration::days(days - 1);
    let summary = TimeslotGenerator::new(state.db.clone())
        .generate(from, to)
        .await?;

    Ok(Json(
        ActionResult::ok(format!(
            "{} timeslot(s) created, {} already existed",
            summary.created, summary.skipped_existing
        ))
        .with_data(&summary),
    ))
}

/// POST /api/cron/requeue-no-answer
pub async fn requeue_no_answer(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CronRequest>,
) -> Result<Json<ActionResult>, AppError> {
    verify_api_key(&state.config, payload.api_key.as_deref())?;

    let summary = StatusService::new(state.db.clone(), &state.config)
        .requeue_no_answer(Utc::now())
        .await?;

    Ok(Json(
        ActionResult::ok(format!("{} lead(s) moved to follow-up", summary.requeued))
            .with_data(&summary),
    ))
}

/// POST /api/cron/sync-playbooks
///
/// Pushes pending contacts of every playbook to the dialer. One failing
/// playbook is reported and the rest still run.
pub async fn sync_playbooks(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CronRequest>,
) -> Result<Json<ActionResult>, AppError> {
    verify_api_key(&state.config, payload.api_key.as_deref())?;

    let client = state.playbook_client.clone().ok_or_else(|| {
        AppError::InternalError("Dialer integration is not configured".to_string())
    })?;

    let results = PlaybookSync::new(state.db.clone(), client).sync_all().await?;
    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
    let entries: Vec<PlaybookSyncEntry> = results
        .into_iter()
        .map(|(playbook_id, outcome)| match outcome {
            Ok(result) => PlaybookSyncEntry {
                playbook_id,
                result: Some(result),
                error: None,
            },
            Err(error) => PlaybookSyncEntry {
                playbook_id,
                result: None,
                error: Some(error),
            },
        })
        .collect();

    Ok(Json(
        ActionResult::ok(format!(
            "{} playbook(s) synced, {} failed",
            entries.len() - failed,
            failed
        ))
        .with_data(&entries),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    #[test]
    fn test_api_key_checks() {
        let config = test_config();
        assert!(verify_api_key(&config, Some(&config.cron_api_key)).is_ok());
        assert!(matches!(
            verify_api_key(&config, Some("wrong")),
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            verify_api_key(&config, None),
            Err(AppError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("secret", "secret"));
        assert!(!constant_time_compare("secret", "secreT"));
        assert!(!constant_time_compare("short", "longer"));
    }

    #[test]
    fn test_cron_request_defaults() {
        let request: CronRequest = serde_json::from_str(r#"{"api_key": "k"}"#).unwrap();
        assert_eq!(request.disposition, Disposition::Done);
        assert!(request.days_ahead.is_none());
    }
}
