use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::audit::{self, AuditEntry};
use crate::capacity::{ensure_distinct, TimeslotStore};
use crate::errors::{AppError, ResultExt};
use crate::models::{Appointment, AppointmentStatus, Subject, SubjectKind};
use crate::status_rules::TransitionPolicy;

/// Request to book an appointment for a lead or borrower.
#[derive(Debug, Clone, Deserialize)]
pub struct NewAppointment {
    pub subject: Subject,
    pub agent_id: Uuid,
    pub start_datetime: DateTime<Utc>,
    pub end_datetime: DateTime<Utc>,
    /// First id is the primary slot.
    #[serde(default)]
    pub timeslot_ids: Vec<Uuid>,
    pub loan_status: Option<String>,
    pub notes: Option<String>,
}

/// Partial update. `None` leaves a field untouched; `timeslot_ids`
/// replaces the linked slots when present.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppointmentPatch {
    pub agent_id: Option<Uuid>,
    pub start_datetime: Option<DateTime<Utc>>,
    pub end_datetime: Option<DateTime<Utc>>,
    pub loan_status: Option<String>,
    pub notes: Option<String>,
    pub timeslot_ids: Option<Vec<Uuid>>,
}

/// An appointment together with its linked timeslots (primary first).
#[derive(Debug, Clone, Serialize)]
pub struct AppointmentDetails {
    pub kind: SubjectKind,
    #[serde(flatten)]
    pub appointment: Appointment,
    pub timeslot_ids: Vec<Uuid>,
}

pub fn validate_window(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), AppError> {
    if end <= start {
        return Err(AppError::Validation(
            "Appointment end time must be after its start time".to_string(),
        ));
    }
    Ok(())
}

/// Flat `field: old → new` list describing what a patch changes.
pub fn change_log(existing: &Appointment, patch: &AppointmentPatch) -> Vec<String> {
    fn opt(value: &Option<String>) -> &str {
        value.as_deref().unwrap_or("-")
    }

    let mut changes = Vec::new();

    if let Some(agent_id) = patch.agent_id {
        if agent_id != existing.agent_id {
            changes.push(format!("agent_id: {} → {}", existing.agent_id, agent_id));
        }
    }
    if let Some(start) = patch.start_datetime {
        if start != existing.start_datetime {
            changes.push(format!(
                "start_datetime: {} → {}",
                existing.start_datetime.to_rfc3339(),
                start.to_rfc3339()
            ));
        }
    }
    if let Some(end) = patch.end_datetime {
        if end != existing.end_datetime {
            changes.push(format!(
                "end_datetime: {} → {}",
                existing.end_datetime.to_rfc3339(),
                end.to_rfc3339()
            ));
        }
    }
    if patch.loan_status.is_some() && patch.loan_status != existing.loan_status {
        changes.push(format!(
            "loan_status: {} → {}",
            opt(&existing.loan_status),
            opt(&patch.loan_status)
        ));
    }
    if patch.notes.is_some() && patch.notes != existing.notes {
        changes.push(format!(
            "notes: {} → {}",
            opt(&existing.notes),
            opt(&patch.notes)
        ));
    }

    changes
}

fn appointment_columns(kind: SubjectKind) -> String {
    format!(
        "id, {} AS subject_id, agent_id, status, start_datetime, end_datetime, loan_status, notes, \
         created_by, updated_by, created_at, updated_at",
        kind.fk_column()
    )
}

fn same_slots(a: &[Uuid], b: &[Uuid]) -> bool {
    a.first() == b.first() && a.len() == b.len() && a.iter().all(|id| b.contains(id))
}

/// Books, reschedules and cancels appointments while keeping timeslot
/// occupancy and the one-active-appointment rule consistent. Every compound
/// operation runs in a single transaction.
pub struct AppointmentScheduler {
    pool: PgPool,
    policy: TransitionPolicy,
}

impl AppointmentScheduler {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            policy: TransitionPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: TransitionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Books an appointment and reserves its timeslots.
    #[tracing::instrument(skip(self, new), fields(subject = %new.subject, agent = %new.agent_id))]
    pub async fn create(
        &self,
        actor: &str,
        new: NewAppointment,
    ) -> Result<AppointmentDetails, AppError> {
        validate_window(new.start_datetime, new.end_datetime)?;
        ensure_distinct(&new.timeslot_ids)?;

        let kind = new.subject.kind;
        let mut tx = self.pool.begin().await?;

        lock_subject(&mut tx, new.subject).await?;
        ensure_agent_exists(&mut tx, new.agent_id).await?;

        if has_active_appointment(&mut tx, new.subject, None).await? {
            return Err(AppError::Conflict(format!(
                "{} already has an upcoming appointment",
                kind.label()
            )));
        }

        TimeslotStore::lock_bookable(&mut tx, &new.timeslot_ids).await?;

        let appointment = sqlx::query_as::<_, Appointment>(&format!(
            r#"
            INSERT INTO {} ({}, agent_id, status, start_datetime, end_datetime, loan_status, notes, created_by, updated_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            RETURNING {}
            "#,
            kind.appointment_table(),
            kind.fk_column(),
            appointment_columns(kind)
        ))
        .bind(new.subject.id)
        .bind(new.agent_id)
        .bind(AppointmentStatus::Upcoming.as_str())
        .bind(new.start_datetime)
        .bind(new.end_datetime)
        .bind(&new.loan_status)
        .bind(&new.notes)
        .bind(actor)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| active_conflict(kind, e))?;

        link_timeslots(&mut tx, kind, appointment.id, &new.timeslot_ids, true).await?;

        audit::record(
            &mut tx,
            AuditEntry {
                entity_type: kind.appointment_entity_type(),
                entity_id: appointment.id,
                action: "create",
                content: format!(
                    "Appointment booked for {} {} - {} ({} timeslot(s))",
                    new.subject,
                    appointment.start_datetime.to_rfc3339(),
                    appointment.end_datetime.to_rfc3339(),
                    new.timeslot_ids.len()
                ),
                actor: Some(actor),
            },
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            "Appointment {} booked for {} with {} timeslot(s)",
            appointment.id,
            new.subject,
            new.timeslot_ids.len()
        );

        Ok(AppointmentDetails {
            kind,
            appointment,
            timeslot_ids: new.timeslot_ids,
        })
    }

    /// Applies a partial update; swapping timeslots releases the old ones and
    /// reserves the new ones in the same transaction.
    #[tracing::instrument(skip(self, patch))]
    pub async fn update(
        &self,
        actor: &str,
        kind: SubjectKind,
        id: Uuid,
        patch: AppointmentPatch,
    ) -> Result<AppointmentDetails, AppError> {
        let mut tx = self.pool.begin().await?;
        let existing = lock_appointment(&mut tx, kind, id).await?;

        if let Some(agent_id) = patch.agent_id {
            if agent_id != existing.agent_id {
                ensure_agent_exists(&mut tx, agent_id).await?;
            }
        }

        let start = patch.start_datetime.unwrap_or(existing.start_datetime);
        let end = patch.end_datetime.unwrap_or(existing.end_datetime);
        validate_window(start, end)?;

        let mut changes = change_log(&existing, &patch);

        let appointment = sqlx::query_as::<_, Appointment>(&format!(
            r#"
            UPDATE {}
            SET agent_id = $2, start_datetime = $3, end_datetime = $4,
                loan_status = $5, notes = $6, updated_by = $7, updated_at = now()
            WHERE id = $1
            RETURNING {}
            "#,
            kind.appointment_table(),
            appointment_columns(kind)
        ))
        .bind(id)
        .bind(patch.agent_id.unwrap_or(existing.agent_id))
        .bind(start)
        .bind(end)
        .bind(patch.loan_status.as_ref().or(existing.loan_status.as_ref()))
        .bind(patch.notes.as_ref().or(existing.notes.as_ref()))
        .bind(actor)
        .fetch_one(&mut *tx)
        .await
        .context("update appointment")?;

        let old_slots = linked_timeslots(&mut tx, kind, id).await?;
        let timeslot_ids = match patch.timeslot_ids {
            Some(new_slots) if !same_slots(&old_slots, &new_slots) => {
                ensure_distinct(&new_slots)?;
                let holds = existing.status.holds_capacity();

                let mut all: Vec<Uuid> = old_slots.clone();
                all.extend(new_slots.iter().filter(|id| !old_slots.contains(id)));
                TimeslotStore::lock(&mut tx, &all).await?;

                if holds {
                    for slot_id in &old_slots {
                        TimeslotStore::release(&mut tx, *slot_id).await?;
                    }
                }
                sqlx::query(&format!(
                    "DELETE FROM {} WHERE appointment_id = $1",
                    kind.junction_table()
                ))
                .bind(id)
                .execute(&mut *tx)
                .await
                .context("unlink timeslots")?;

                if holds {
                    TimeslotStore::lock_bookable(&mut tx, &new_slots).await?;
                }
                link_timeslots(&mut tx, kind, id, &new_slots, holds).await?;

                changes.push(format!(
                    "timeslots: [{}] → [{}]",
                    join_ids(&old_slots),
                    join_ids(&new_slots)
                ));
                new_slots
            }
            _ => old_slots,
        };

        audit::record(
            &mut tx,
            AuditEntry {
                entity_type: kind.appointment_entity_type(),
                entity_id: id,
                action: "update",
                content: if changes.is_empty() {
                    "No field changes".to_string()
                } else {
                    changes.join("\n")
                },
                actor: Some(actor),
            },
        )
        .await?;

        tx.commit().await?;

        tracing::info!("Appointment {} updated ({} change(s))", id, changes.len());

        Ok(AppointmentDetails {
            kind,
            appointment,
            timeslot_ids,
        })
    }

    /// Deletes an appointment (junction rows cascade) and releases the slots
    /// it was holding.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, actor: &str, kind: SubjectKind, id: Uuid) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        let existing = lock_appointment(&mut tx, kind, id).await?;
        let slots = linked_timeslots(&mut tx, kind, id).await?;

        sqlx::query(&format!(
            "DELETE FROM {} WHERE id = $1",
            kind.appointment_table()
        ))
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("delete appointment")?;

        if existing.status.holds_capacity() {
            for slot_id in &slots {
                TimeslotStore::release(&mut tx, *slot_id).await?;
            }
        }

        audit::record(
            &mut tx,
            AuditEntry {
                entity_type: kind.appointment_entity_type(),
                entity_id: id,
                action: "delete",
                content: format!(
                    "Appointment ({}) deleted, {} timeslot(s) unlinked",
                    existing.status,
                    slots.len()
                ),
                actor: Some(actor),
            },
        )
        .await?;

        tx.commit().await?;

        tracing::info!("Appointment {} deleted", id);
        Ok(())
    }

    /// Sets the status directly, subject to the configured transition policy.
    ///
    /// Moving to `cancelled` releases the linked slots; moving out of
    /// `cancelled` reserves them again and fails if they filled up meanwhile.
    #[tracing::instrument(skip(self, notes))]
    pub async fn update_status(
        &self,
        actor: &str,
        kind: SubjectKind,
        id: Uuid,
        status: AppointmentStatus,
        notes: Option<String>,
    ) -> Result<AppointmentDetails, AppError> {
        let mut tx = self.pool.begin().await?;
        let existing = lock_appointment(&mut tx, kind, id).await?;
        let from = existing.status;

        self.policy.check_appointment(from, status)?;

        if status.is_active() && !from.is_active() {
            let subject = Subject {
                kind,
                id: existing.subject_id,
            };
            if has_active_appointment(&mut tx, subject, Some(id)).await? {
                return Err(AppError::Conflict(format!(
                    "{} already has an upcoming appointment",
                    kind.label()
                )));
            }
        }

        let slots = linked_timeslots(&mut tx, kind, id).await?;
        match (from.holds_capacity(), status.holds_capacity()) {
            (true, false) => {
                for slot_id in &slots {
                    TimeslotStore::release(&mut tx, *slot_id).await?;
                }
            }
            (false, true) => {
                TimeslotStore::lock_bookable(&mut tx, &slots).await?;
                for slot_id in &slots {
                    TimeslotStore::reserve(&mut tx, *slot_id).await?;
                }
            }
            _ => {}
        }

        let appointment = sqlx::query_as::<_, Appointment>(&format!(
            r#"
            UPDATE {}
            SET status = $2, notes = COALESCE($3, notes), updated_by = $4, updated_at = now()
            WHERE id = $1
            RETURNING {}
            "#,
            kind.appointment_table(),
            appointment_columns(kind)
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(&notes)
        .bind(actor)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| active_conflict(kind, e))?;

        let mut content = format!("status: {} → {}", from, status);
        if let Some(ref text) = notes {
            content.push_str(&format!("\nnotes: {}", text));
        }
        audit::record(
            &mut tx,
            AuditEntry {
                entity_type: kind.appointment_entity_type(),
                entity_id: id,
                action: "status",
                content,
                actor: Some(actor),
            },
        )
        .await?;

        tx.commit().await?;

        tracing::info!("Appointment {} status {} → {}", id, from, status);

        Ok(AppointmentDetails {
            kind,
            appointment,
            timeslot_ids: slots,
        })
    }

    pub async fn get(&self, kind: SubjectKind, id: Uuid) -> Result<AppointmentDetails, AppError> {
        let mut conn = self.pool.acquire().await?;
        let appointment = sqlx::query_as::<_, Appointment>(&format!(
            "SELECT {} FROM {} WHERE id = $1",
            appointment_columns(kind),
            kind.appointment_table()
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Appointment {} not found", id)))?;

        let timeslot_ids = linked_timeslots(&mut conn, kind, id).await?;
        Ok(AppointmentDetails {
            kind,
            appointment,
            timeslot_ids,
        })
    }

    /// All appointments of a lead or borrower, newest first.
    pub async fn list_for_subject(&self, subject: Subject) -> Result<Vec<Appointment>, AppError> {
        let rows = sqlx::query_as::<_, Appointment>(&format!(
            "SELECT {} FROM {} WHERE {} = $1 ORDER BY start_datetime DESC",
            appointment_columns(subject.kind),
            subject.kind.appointment_table(),
            subject.kind.fk_column()
        ))
        .bind(subject.id)
        .fetch_all(&self.pool)
        .await
        .context("list appointments")?;

        Ok(rows)
    }
}

fn join_ids(ids: &[Uuid]) -> String {
    ids.iter()
        .map(Uuid::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Maps a violation of the partial unique index on active appointments to
/// the same conflict the pre-check reports.
fn active_conflict(kind: SubjectKind, err: sqlx::Error) -> AppError {
    let err = AppError::DatabaseError(err);
    if err.is_unique_violation() {
        AppError::Conflict(format!(
            "{} already has an upcoming appointment",
            kind.label()
        ))
    } else {
        err
    }
}

/// Locks the lead/borrower row so concurrent bookings for the same person
/// serialize on it.
async fn lock_subject(conn: &mut PgConnection, subject: Subject) -> Result<(), AppError> {
    let found = sqlx::query_scalar::<_, Uuid>(&format!(
        "SELECT id FROM {} WHERE id = $1 AND is_deleted = false FOR UPDATE",
        subject.kind.person_table()
    ))
    .bind(subject.id)
    .fetch_optional(&mut *conn)
    .await
    .context("lock subject")?;

    found.map(|_| ()).ok_or_else(|| {
        AppError::NotFound(format!("{} {} not found", subject.kind.label(), subject.id))
    })
}

pub(crate) async fn ensure_agent_exists(
    conn: &mut PgConnection,
    agent_id: Uuid,
) -> Result<(), AppError> {
    let exists = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS(SELECT 1 FROM users WHERE id = $1 AND is_active = true)",
    )
    .bind(agent_id)
    .fetch_one(&mut *conn)
    .await
    .context("check agent")?;

    if !exists {
        return Err(AppError::NotFound(format!("Agent {} not found", agent_id)));
    }
    Ok(())
}

async fn has_active_appointment(
    conn: &mut PgConnection,
    subject: Subject,
    exclude: Option<Uuid>,
) -> Result<bool, AppError> {
    let exists = sqlx::query_scalar::<_, bool>(&format!(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM {}
            WHERE {} = $1 AND status = ANY($2) AND ($3::uuid IS NULL OR id <> $3)
        )
        "#,
        subject.kind.appointment_table(),
        subject.kind.fk_column()
    ))
    .bind(subject.id)
    .bind(
        AppointmentStatus::ACTIVE
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>(),
    )
    .bind(exclude)
    .fetch_one(&mut *conn)
    .await
    .context("check active appointment")?;

    Ok(exists)
}

async fn lock_appointment(
    conn: &mut PgConnection,
    kind: SubjectKind,
    id: Uuid,
) -> Result<Appointment, AppError> {
    sqlx::query_as::<_, Appointment>(&format!(
        "SELECT {} FROM {} WHERE id = $1 FOR UPDATE",
        appointment_columns(kind),
        kind.appointment_table()
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("Appointment {} not found", id)))
}

/// Linked timeslot ids, primary first.
async fn linked_timeslots(
    conn: &mut PgConnection,
    kind: SubjectKind,
    appointment_id: Uuid,
) -> Result<Vec<Uuid>, AppError> {
    let ids = sqlx::query_scalar::<_, Uuid>(&format!(
        "SELECT timeslot_id FROM {} WHERE appointment_id = $1 ORDER BY is_primary DESC, timeslot_id",
        kind.junction_table()
    ))
    .bind(appointment_id)
    .fetch_all(&mut *conn)
    .await
    .context("load linked timeslots")?;

    Ok(ids)
}

/// Inserts junction rows (first one primary), reserving each slot when
/// `reserve` is set.
async fn link_timeslots(
    conn: &mut PgConnection,
    kind: SubjectKind,
    appointment_id: Uuid,
    timeslot_ids: &[Uuid],
    reserve: bool,
) -> Result<(), AppError> {
    for (i, slot_id) in timeslot_ids.iter().enumerate() {
        sqlx::query(&format!(
            "INSERT INTO {} (appointment_id, timeslot_id, is_primary) VALUES ($1, $2, $3)",
            kind.junction_table()
        ))
        .bind(appointment_id)
        .bind(slot_id)
        .bind(i == 0)
        .execute(&mut *conn)
        .await
        .context("link timeslot")?;

        if reserve {
            TimeslotStore::reserve(conn, *slot_id).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn appointment() -> Appointment {
        let start = Utc.with_ymd_and_hms(2026, 10, 20, 2, 0, 0).unwrap();
        Appointment {
            id: Uuid::new_v4(),
            subject_id: Uuid::new_v4(),
            agent_id: Uuid::nil(),
            status: AppointmentStatus::Upcoming,
            start_datetime: start,
            end_datetime: start + chrono::Duration::minutes(30),
            loan_status: Some("pending_documents".to_string()),
            notes: None,
            created_by: Some("agent-1".to_string()),
            updated_by: None,
            created_at: start,
            updated_at: start,
        }
    }

    #[test]
    fn test_change_log_lists_only_changed_fields() {
        let existing = appointment();
        let patch = AppointmentPatch {
            agent_id: Some(existing.agent_id),
            loan_status: Some("approved".to_string()),
            notes: Some("bring payslips".to_string()),
            ..Default::default()
        };

        let changes = change_log(&existing, &patch);
        assert_eq!(
            changes,
            vec![
                "loan_status: pending_documents → approved".to_string(),
                "notes: - → bring payslips".to_string(),
            ]
        );
    }

    #[test]
    fn test_change_log_reschedule() {
        let existing = appointment();
        let new_start = existing.start_datetime + chrono::Duration::hours(1);
        let patch = AppointmentPatch {
            start_datetime: Some(new_start),
            ..Default::default()
        };

        let changes = change_log(&existing, &patch);
        assert_eq!(changes.len(), 1);
        assert!(changes[0].starts_with("start_datetime: 2026-10-20T02:00:00+00:00 → "));
    }

    #[test]
    fn test_empty_patch_has_no_changes() {
        assert!(change_log(&appointment(), &AppointmentPatch::default()).is_empty());
    }

    #[test]
    fn test_validate_window() {
        let a = appointment();
        assert!(validate_window(a.start_datetime, a.end_datetime).is_ok());
        assert!(validate_window(a.end_datetime, a.start_datetime).is_err());
        assert!(validate_window(a.start_datetime, a.start_datetime).is_err());
    }

    #[test]
    fn test_same_slots_respects_primary() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(same_slots(&[a, b], &[a, b]));
        assert!(!same_slots(&[a, b], &[b, a]));
        assert!(!same_slots(&[a], &[a, b]));
        assert!(same_slots(&[], &[]));
    }

    #[test]
    fn test_new_appointment_deserializes_subject() {
        let body = serde_json::json!({
            "subject": {"kind": "borrower", "id": Uuid::nil()},
            "agent_id": Uuid::nil(),
            "start_datetime": "2026-10-20T02:00:00Z",
            "end_datetime": "2026-10-20T02:30:00Z"
        });
        let new: NewAppointment = serde_json::from_value(body).unwrap();
        assert_eq!(new.subject.kind, SubjectKind::Borrower);
        assert!(new.timeslot_ids.is_empty());
    }
}
