use crate::assignment_storage::{AutoAssigner, CheckIn, SettingsUpdate};
use crate::calendar::TimeslotGenerator;
use crate::capacity::TimeslotStore;
use crate::config::Config;
use crate::errors::{ActionResult, AppError};
use crate::models::{AppointmentStatus, LeadStatus, Subject, SubjectKind};
use crate::playbook_client::PlaybookClient;
use crate::scheduler::{AppointmentDetails, AppointmentPatch, AppointmentScheduler, NewAppointment};
use crate::status_rules::Disposition;
use crate::status_service::StatusService;
use crate::webhook_client::{AppointmentWebhookPayload, WebhookClient};
use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    Json,
};
use chrono::{NaiveDate, NaiveTime, Utc};
use moka::future::Cache;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub db: PgPool,
    /// Application configuration.
    pub config: Config,
    /// Dialer client; `None` when the integration is not configured.
    pub playbook_client: Option<PlaybookClient>,
    /// Appointment webhook sender; `None` without `APPOINTMENT_WEBHOOK_URL`.
    pub webhook_client: Option<WebhookClient>,
    /// Leads currently being auto-assigned by some request.
    pub assigning_leads: Cache<Uuid, ()>,
}

/// Acting user id, taken from the `X-Actor-Id` header the identity proxy sets.
#[derive(Debug, Clone)]
pub struct Actor(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-actor-id")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Actor(v.to_string()))
            .ok_or_else(|| AppError::Unauthorized("Missing X-Actor-Id header".to_string()))
    }
}

/// Health check endpoint.
///
/// # Returns
///
/// * `(StatusCode, Json<serde_json::Value>)` - HTTP 200 OK with health status JSON.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "loan-crm",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

fn scheduler(state: &AppState) -> AppointmentScheduler {
    AppointmentScheduler::new(state.db.clone()).with_policy(state.config.transition_policy)
}

fn status_service(state: &AppState) -> StatusService {
    StatusService::new(state.db.clone(), &state.config)
}

/// Sends the appointment webhook in the background. Delivery problems are
/// logged and never reach the caller.
fn notify_webhook(state: &AppState, event: &'static str, details: &AppointmentDetails) {
    let Some(client) = state.webhook_client.clone() else {
        return;
    };
    let pool = state.db.clone();
    let details = details.clone();
    let offset = state.config.business_offset();

    tokio::spawn(async move {
        let sent: Result<(), AppError> = async {
            let payload = AppointmentWebhookPayload::load(&pool, event, &details, offset).await?;
            client.send(&payload).await
        }
        .await;

        if let Err(e) = sent {
            tracing::warn!(
                "Webhook {} for appointment {} not delivered: {}",
                event,
                details.appointment.id,
                e
            );
        }
    });
}

// ============ Appointments ============

/// POST /api/v1/appointments
///
/// Books an appointment for a lead or borrower and reserves its timeslots.
///
/// # Arguments
///
/// * `state` - The application state.
/// * `actor` - The acting user.
/// * `payload` - The booking request; the first timeslot is the primary one.
///
/// # Returns
///
/// * `Result<Json<ActionResult>, AppError>` - The booked appointment, or a
///   conflict when the person already has an active appointment or a slot is full.
pub async fn create_appointment(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Json(payload): Json<NewAppointment>,
) -> Result<Json<ActionResult>, AppError> {
    tracing::info!("POST /appointments - {}", payload.subject);

    let details = scheduler(&state).create(&actor, payload).await?;
    notify_webhook(&state, "appointment.created", &details);

    Ok(Json(
        ActionResult::ok("Appointment created").with_data(&details),
    ))
}

pub async fn get_appointment(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(SubjectKind, Uuid)>,
) -> Result<Json<ActionResult>, AppError> {
    let details = scheduler(&state).get(kind, id).await?;
    Ok(Json(ActionResult::ok("Appointment loaded").with_data(&details)))
}

/// PATCH /api/v1/appointments/:kind/:id
///
/// Partial update. A `timeslot_ids` list replaces the linked slots.
pub async fn update_appointment(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path((kind, id)): Path<(SubjectKind, Uuid)>,
    Json(patch): Json<AppointmentPatch>,
) -> Result<Json<ActionResult>, AppError> {
    tracing::info!("PATCH /appointments/{}/{}", kind.entity_type(), id);

    let details = scheduler(&state).update(&actor, kind, id, patch).await?;
    notify_webhook(&state, "appointment.updated", &details);

    Ok(Json(
        ActionResult::ok("Appointment updated").with_data(&details),
    ))
}

pub async fn delete_appointment(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path((kind, id)): Path<(SubjectKind, Uuid)>,
) -> Result<Json<ActionResult>, AppError> {
    tracing::info!("DELETE /appointments/{}/{}", kind.entity_type(), id);
    scheduler(&state).delete(&actor, kind, id).await?;
    Ok(Json(ActionResult::ok("Appointment deleted")))
}

#[derive(Debug, Deserialize)]
pub struct AppointmentStatusRequest {
    pub status: AppointmentStatus,
    pub notes: Option<String>,
}

pub async fn update_appointment_status(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path((kind, id)): Path<(SubjectKind, Uuid)>,
    Json(payload): Json<AppointmentStatusRequest>,
) -> Result<Json<ActionResult>, AppError> {
    let details = scheduler(&state)
        .update_status(&actor, kind, id, payload.status, payload.notes)
        .await?;
    Ok(Json(
        ActionResult::ok(format!("Appointment marked {}", payload.status)).with_data(&details),
    ))
}

pub async fn list_subject_appointments(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(SubjectKind, Uuid)>,
) -> Result<Json<ActionResult>, AppError> {
    let appointments = scheduler(&state)
        .list_for_subject(Subject { kind, id })
        .await?;
    Ok(Json(
        ActionResult::ok(format!("{} appointment(s)", appointments.len())).with_data(&appointments),
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct SweepRequest {
    #[serde(default)]
    pub disposition: Disposition,
}

/// POST /api/v1/appointments/sweep
///
/// Manual trigger of the stale-appointment sweep.
pub async fn sweep_appointments(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Json(payload): Json<SweepRequest>,
) -> Result<Json<ActionResult>, AppError> {
    let summary = status_service(&state)
        .sweep_appointments(Utc::now(), payload.disposition, Some(&actor))
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

// ============ Lead / borrower status ============

/// GET /api/v1/subjects/:kind/:id
pub async fn get_subject(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(SubjectKind, Uuid)>,
) -> Result<Json<ActionResult>, AppError> {
    let service = status_service(&state);
    let result = match kind {
        SubjectKind::Lead => ActionResult::ok("Lead loaded").with_data(&service.get_lead(id).await?),
        SubjectKind::Borrower => {
            ActionResult::ok("Borrower loaded").with_data(&service.get_borrower(id).await?)
        }
    };
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct TerminalStatusRequest {
    pub reason: String,
    #[serde(alias = "customReasonText")]
    pub custom_reason_text: Option<String>,
}

pub async fn apply_terminal_status(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path((kind, id)): Path<(SubjectKind, Uuid)>,
    Json(payload): Json<TerminalStatusRequest>,
) -> Result<Json<ActionResult>, AppError> {
    let decision = status_service(&state)
        .apply_terminal_reason(
            &actor,
            Subject { kind, id },
            &payload.reason,
            payload.custom_reason_text.as_deref(),
        )
        .await?;
    Ok(Json(
        ActionResult::ok(format!("{} marked {}", kind.label(), decision.status)).with_data(&decision),
    ))
}

#[derive(Debug, Deserialize)]
pub struct FollowUpRequest {
    pub date: NaiveDate,
    pub time: Option<NaiveTime>,
}

pub async fn schedule_follow_up(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path((kind, id)): Path<(SubjectKind, Uuid)>,
    Json(payload): Json<FollowUpRequest>,
) -> Result<Json<ActionResult>, AppError> {
    let follow_up = status_service(&state)
        .schedule_follow_up(&actor, Subject { kind, id }, payload.date, payload.time)
        .await?;
    Ok(Json(
        ActionResult::ok("Follow-up scheduled").with_data(&json!({ "follow_up_date": follow_up })),
    ))
}

pub async fn mark_no_answer(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path((kind, id)): Path<(SubjectKind, Uuid)>,
) -> Result<Json<ActionResult>, AppError> {
    status_service(&state)
        .mark_no_answer(&actor, Subject { kind, id })
        .await?;
    Ok(Json(ActionResult::ok(format!("{} marked no answer", kind.label()))))
}

#[derive(Debug, Deserialize)]
pub struct SubjectStatusRequest {
    pub status: LeadStatus,
}

pub async fn set_subject_status(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path((kind, id)): Path<(SubjectKind, Uuid)>,
    Json(payload): Json<SubjectStatusRequest>,
) -> Result<Json<ActionResult>, AppError> {
    status_service(&state)
        .set_status(&actor, Subject { kind, id }, payload.status)
        .await?;
    Ok(Json(ActionResult::ok(format!(
        "{} status set to {}",
        kind.label(),
        payload.status
    ))))
}

// ============ Timeslots ============

#[derive(Debug, Deserialize)]
pub struct TimeslotQuery {
    pub date: NaiveDate,
}

/// GET /api/v1/timeslots?date=YYYY-MM-DD
///
/// Bookable slots for a day, earliest first.
pub async fn list_timeslots(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TimeslotQuery>,
) -> Result<Json<ActionResult>, AppError> {
    let slots = TimeslotStore::new(state.db.clone())
        .list_available(query.date)
        .await?;
    Ok(Json(
        ActionResult::ok(format!("{} available timeslot(s)", slots.len())).with_data(&slots),
    ))
}

#[derive(Debug, Deserialize)]
pub struct DisableRequest {
    pub is_disabled: bool,
}

pub async fn set_timeslot_disabled(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(id): Path<Uuid>,
    Json(payload): Json<DisableRequest>,
) -> Result<Json<ActionResult>, AppError> {
    tracing::info!("Timeslot {} disabled={} by {}", id, payload.is_disabled, actor);
    let slot = TimeslotStore::new(state.db.clone())
        .set_disabled(id, payload.is_disabled)
        .await?;
    Ok(Json(ActionResult::ok("Timeslot updated").with_data(&slot)))
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

pub async fn generate_timeslots(
    State(state): State<Arc<AppState>>,
    Actor(_actor): Actor,
    Json(payload): Json<GenerateRequest>,
) -> Result<Json<ActionResult>, AppError> {
    let summary = TimeslotGenerator::new(state.db.clone())
        .generate(payload.from, payload.to)
        .await?;
    Ok(Json(
        ActionResult::ok(format!("{} timeslot(s) created", summary.created)).with_data(&summary),
    ))
}

// ============ Auto-assignment ============

pub async fn check_in(
    State(state): State<Arc<AppState>>,
    Actor(_actor): Actor,
    Json(payload): Json<CheckIn>,
) -> Result<Json<ActionResult>, AppError> {
    let row = AutoAssigner::new(state.db.clone())
        .check_in(state.config.business_today(), payload)
        .await?;
    Ok(Json(ActionResult::ok("Checked in").with_data(&row)))
}

#[derive(Debug, Deserialize)]
pub struct CheckOutRequest {
    pub agent_id: Uuid,
}

pub async fn check_out(
    State(state): State<Arc<AppState>>,
    Actor(_actor): Actor,
    Json(payload): Json<CheckOutRequest>,
) -> Result<Json<ActionResult>, AppError> {
    let row = AutoAssigner::new(state.db.clone())
        .check_out(state.config.business_today(), payload.agent_id)
        .await?;
    Ok(Json(ActionResult::ok("Checked out").with_data(&row)))
}

pub async fn list_checked_in_agents(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ActionResult>, AppError> {
    let agents = AutoAssigner::new(state.db.clone())
        .checked_in_agents(state.config.business_today())
        .await?;
    Ok(Json(
        ActionResult::ok(format!("{} agent(s) checked in", agents.len())).with_data(&agents),
    ))
}

pub async fn get_assignment_settings(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ActionResult>, AppError> {
    let settings = AutoAssigner::new(state.db.clone()).settings().await?;
    Ok(Json(ActionResult::ok("Settings loaded").with_data(&settings)))
}

pub async fn update_assignment_settings(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Json(payload): Json<SettingsUpdate>,
) -> Result<Json<ActionResult>, AppError> {
    let settings = AutoAssigner::new(state.db.clone())
        .update_settings(&actor, payload)
        .await?;
    Ok(Json(ActionResult::ok("Settings updated").with_data(&settings)))
}

/// POST /api/v1/assignment/leads/:id
///
/// Auto-assigns one lead. Business failures (disabled, no agents) come back
/// as `success: false` with 200; a second request for a lead that is still
/// being assigned is rejected.
pub async fn auto_assign_lead(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(lead_id): Path<Uuid>,
) -> Result<Json<ActionResult>, AppError> {
    let entry = state.assigning_leads.entry(lead_id).or_insert(()).await;
    if !entry.is_fresh() {
        tracing::warn!("Lead {} is already being assigned", lead_id);
        return Err(AppError::Conflict(format!(
            "Lead {} is already being assigned",
            lead_id
        )));
    }

    let outcome = AutoAssigner::new(state.db.clone())
        .assign_single(state.config.business_today(), lead_id, Some(&actor))
        .await;
    state.assigning_leads.invalidate(&lead_id).await;

    let result = if outcome.success {
        ActionResult::ok(outcome.message.clone())
    } else {
        ActionResult::failed(outcome.message.clone(), outcome.message.clone())
    };
    Ok(Json(result.with_data(&outcome)))
}

pub async fn auto_assign_bulk(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
) -> Result<Json<ActionResult>, AppError> {
    let result = AutoAssigner::new(state.db.clone())
        .assign_bulk(state.config.business_today(), Some(&actor))
        .await?;
    Ok(Json(
        ActionResult::ok(format!(
            "{} of {} lead(s) assigned",
            result.succeeded, result.total
        ))
        .with_data(&result),
    ))
}

pub async fn assign_even_split(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
) -> Result<Json<ActionResult>, AppError> {
    let result = AutoAssigner::new(state.db.clone())
        .assign_even_split(state.config.business_today(), Some(&actor))
        .await?;
    Ok(Json(
        ActionResult::ok(format!(
            "{} of {} lead(s) assigned",
            result.succeeded, result.total
        ))
        .with_data(&result),
    ))
}

pub async fn assignment_preview(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ActionResult>, AppError> {
    let preview = AutoAssigner::new(state.db.clone())
        .preview(state.config.business_today())
        .await?;
    Ok(Json(
        ActionResult::ok(format!(
            "{} of {} lead(s) can be assigned",
            preview.assignable, preview.lead_count
        ))
        .with_data(&preview),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ManualAssignRequest {
    pub agent_id: Uuid,
    pub reason: Option<String>,
}

pub async fn assign_lead_manually(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(lead_id): Path<Uuid>,
    Json(payload): Json<ManualAssignRequest>,
) -> Result<Json<ActionResult>, AppError> {
    let history = AutoAssigner::new(state.db.clone())
        .assign_manual(&actor, lead_id, payload.agent_id, payload.reason)
        .await?;
    Ok(Json(ActionResult::ok("Lead assigned").with_data(&history)))
}

pub async fn lead_assignment_history(
    State(state): State<Arc<AppState>>,
    Path(lead_id): Path<Uuid>,
) -> Result<Json<ActionResult>, AppError> {
    let rows = AutoAssigner::new(state.db.clone()).history(lead_id).await?;
    Ok(Json(
        ActionResult::ok(format!("{} assignment(s)", rows.len())).with_data(&rows),
    ))
}
