use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::audit::{self, AuditEntry};
use crate::config::Config;
use crate::errors::{AppError, ResultExt};
use crate::models::{
    AppointmentStatus, Borrower, ContactSyncStatus, Lead, LeadStatus, Subject, SubjectKind,
    BORROWER_COLUMNS, LEAD_COLUMNS,
};
use crate::status_rules::{
    ensure_direct_status, promotion_cutoff, requeue_cutoff, resolve_terminal_reason, Disposition,
    FollowUpClock, TerminalDecision, TransitionPolicy, NO_ANSWER_NOTE,
};

#[derive(Debug, Clone, Serialize)]
pub struct RequeueSummary {
    pub cutoff: DateTime<Utc>,
    pub requeued: usize,
    pub contacts_removed: u64,
    pub lead_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary {
    pub disposition: Disposition,
    pub cutoff: DateTime<Utc>,
    pub lead_appointments: usize,
    pub borrower_appointments: usize,
    pub appointment_ids: Vec<Uuid>,
}

/// Reason-based and time-based status changes for leads, borrowers and
/// appointments.
pub struct StatusService {
    pool: PgPool,
    policy: TransitionPolicy,
    clock: FollowUpClock,
    requeue_days: i64,
    sweep_threshold: Duration,
}

impl StatusService {
    pub fn new(pool: PgPool, config: &Config) -> Self {
        Self {
            pool,
            policy: config.transition_policy,
            clock: FollowUpClock::new(config.business_offset(), config.follow_up_default_time),
            requeue_days: config.no_answer_requeue_days,
            sweep_threshold: config.appointment_threshold(),
        }
    }

    pub async fn get_lead(&self, id: Uuid) -> Result<Lead, AppError> {
        sqlx::query_as::<_, Lead>(&format!(
            "SELECT {} FROM leads WHERE id = $1 AND is_deleted = false",
            LEAD_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Lead {} not found", id)))
    }

    pub async fn get_borrower(&self, id: Uuid) -> Result<Borrower, AppError> {
        sqlx::query_as::<_, Borrower>(&format!(
            "SELECT {} FROM borrowers WHERE id = $1 AND is_deleted = false",
            BORROWER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Borrower {} not found", id)))
    }

    /// Moves a lead or borrower to `blacklisted` or `give_up` for a reason
    /// from the fixed taxonomy. The reason is validated before anything is
    /// written.
    #[tracing::instrument(skip(self, custom_reason_text))]
    pub async fn apply_terminal_reason(
        &self,
        actor: &str,
        subject: Subject,
        reason_code: &str,
        custom_reason_text: Option<&str>,
    ) -> Result<TerminalDecision, AppError> {
        let decision = resolve_terminal_reason(reason_code, custom_reason_text)?;

        let mut tx = self.pool.begin().await?;
        let from = lock_status(&mut tx, subject).await?;
        self.policy.check_lead(from, decision.status)?;

        write_status(&mut tx, subject, decision.status, None, actor).await?;
        audit::add_note(&mut tx, subject, &decision.note, Some(actor)).await?;
        audit::record(
            &mut tx,
            AuditEntry {
                entity_type: subject.kind.entity_type(),
                entity_id: subject.id,
                action: "status",
                content: format!("status: {} → {} ({})", from, decision.status, decision.reason.code()),
                actor: Some(actor),
            },
        )
        .await?;
        tx.commit().await?;

        tracing::info!("{} marked {} ({})", subject, decision.status, decision.reason.code());
        Ok(decision)
    }

    /// Sets `follow_up` with a date normalized to business local time.
    #[tracing::instrument(skip(self))]
    pub async fn schedule_follow_up(
        &self,
        actor: &str,
        subject: Subject,
        date: NaiveDate,
        time: Option<NaiveTime>,
    ) -> Result<DateTime<Utc>, AppError> {
        let follow_up = self.clock.normalize(date, time)?;
        let note = self.clock.note(follow_up);

        let mut tx = self.pool.begin().await?;
        let from = lock_status(&mut tx, subject).await?;
        self.policy.check_lead(from, LeadStatus::FollowUp)?;

        write_status(&mut tx, subject, LeadStatus::FollowUp, Some(follow_up), actor).await?;
        audit::add_note(&mut tx, subject, &note, Some(actor)).await?;
        tx.commit().await?;

        tracing::info!("{} follow-up set for {}", subject, follow_up.to_rfc3339());
        Ok(follow_up)
    }

    /// Sets `no_answer` and clears any follow-up date.
    #[tracing::instrument(skip(self))]
    pub async fn mark_no_answer(&self, actor: &str, subject: Subject) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        let from = lock_status(&mut tx, subject).await?;
        self.policy.check_lead(from, LeadStatus::NoAnswer)?;

        write_status(&mut tx, subject, LeadStatus::NoAnswer, None, actor).await?;
        audit::add_note(&mut tx, subject, NO_ANSWER_NOTE, Some(actor)).await?;
        tx.commit().await?;

        tracing::info!("{} marked no answer", subject);
        Ok(())
    }

    /// Explicit status change, e.g. reactivating a closed lead to `new`.
    /// Clears any follow-up date; `follow_up` itself is rejected.
    pub async fn set_status(
        &self,
        actor: &str,
        subject: Subject,
        status: LeadStatus,
    ) -> Result<(), AppError> {
        ensure_direct_status(status)?;

        let mut tx = self.pool.begin().await?;
        let from = lock_status(&mut tx, subject).await?;
        self.policy.check_lead(from, status)?;

        write_status(&mut tx, subject, status, None, actor).await?;
        audit::record(
            &mut tx,
            AuditEntry {
                entity_type: subject.kind.entity_type(),
                entity_id: subject.id,
                action: "status",
                content: format!("status: {} → {}", from, status),
                actor: Some(actor),
            },
        )
        .await?;
        tx.commit().await?;

        tracing::info!("{} status {} → {}", subject, from, status);
        Ok(())
    }

    /// Puts stale `no_answer` leads back into the follow-up pool and marks
    /// their dialer contacts removed.
    pub async fn requeue_no_answer(&self, now: DateTime<Utc>) -> Result<RequeueSummary, AppError> {
        let cutoff = requeue_cutoff(now, self.requeue_days);
        let mut tx = self.pool.begin().await?;

        let lead_ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE leads
            SET status = $1, follow_up_date = $2, updated_at = $2, updated_by = 'system'
            WHERE status = $3 AND is_deleted = false AND updated_at < $4
            RETURNING id
            "#,
        )
        .bind(LeadStatus::FollowUp.as_str())
        .bind(now)
        .bind(LeadStatus::NoAnswer.as_str())
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .context("requeue no-answer leads")?;

        let contacts_removed = if lead_ids.is_empty() {
            0
        } else {
            sqlx::query(
                "UPDATE playbook_contacts SET sync_status = $1 WHERE lead_id = ANY($2) AND sync_status <> $1",
            )
            .bind(ContactSyncStatus::Removed.as_str())
            .bind(&lead_ids)
            .execute(&mut *tx)
            .await
            .context("mark requeued contacts removed")?
            .rows_affected()
        };

        for lead_id in &lead_ids {
            audit::record(
                &mut tx,
                AuditEntry {
                    entity_type: SubjectKind::Lead.entity_type(),
                    entity_id: *lead_id,
                    action: "requeue",
                    content: format!(
                        "status: {} → {} (no answer for {} day(s))",
                        LeadStatus::NoAnswer,
                        LeadStatus::FollowUp,
                        self.requeue_days
                    ),
                    actor: None,
                },
            )
            .await?;
        }

        tx.commit().await?;

        tracing::info!(
            "Requeued {} no-answer lead(s) idle since {}, {} playbook contact(s) removed",
            lead_ids.len(),
            cutoff.to_rfc3339(),
            contacts_removed
        );
        Ok(RequeueSummary {
            cutoff,
            requeued: lead_ids.len(),
            contacts_removed,
            lead_ids,
        })
    }

    /// Closes out upcoming appointments whose start is further in the past
    /// than the configured threshold, for leads and borrowers alike.
    #[tracing::instrument(skip(self, actor))]
    pub async fn sweep_appointments(
        &self,
        now: DateTime<Utc>,
        disposition: Disposition,
        actor: Option<&str>,
    ) -> Result<SweepSummary, AppError> {
        let cutoff = promotion_cutoff(now, self.sweep_threshold);
        let target = disposition.status();
        self.policy.check_appointment(AppointmentStatus::Upcoming, target)?;

        let mut tx = self.pool.begin().await?;
        let leads = sweep_table(&mut tx, SubjectKind::Lead, target, cutoff, actor).await?;
        let borrowers = sweep_table(&mut tx, SubjectKind::Borrower, target, cutoff, actor).await?;
        tx.commit().await?;

        tracing::info!(
            "Appointment sweep → {}: {} lead and {} borrower appointment(s) started before {}",
            target,
            leads.len(),
            borrowers.len(),
            cutoff.to_rfc3339()
        );

        let lead_appointments = leads.len();
        let borrower_appointments = borrowers.len();
        let mut appointment_ids = leads;
        appointment_ids.extend(borrowers);

        Ok(SweepSummary {
            disposition,
            cutoff,
            lead_appointments,
            borrower_appointments,
            appointment_ids,
        })
    }
}

async fn lock_status(conn: &mut PgConnection, subject: Subject) -> Result<LeadStatus, AppError> {
    let raw = sqlx::query_scalar::<_, String>(&format!(
        "SELECT status FROM {} WHERE id = $1 AND is_deleted = false FOR UPDATE",
        subject.kind.person_table()
    ))
    .bind(subject.id)
    .fetch_optional(&mut *conn)
    .await
    .context("lock subject status")?
    .ok_or_else(|| {
        AppError::NotFound(format!("{} {} not found", subject.kind.label(), subject.id))
    })?;

    raw.parse()
}

async fn write_status(
    conn: &mut PgConnection,
    subject: Subject,
    status: LeadStatus,
    follow_up: Option<DateTime<Utc>>,
    actor: &str,
) -> Result<(), AppError> {
    sqlx::query(&format!(
        r#"
        UPDATE {}
        SET status = $2, follow_up_date = $3, updated_by = $4, updated_at = now()
        WHERE id = $1
        "#,
        subject.kind.person_table()
    ))
    .bind(subject.id)
    .bind(status.as_str())
    .bind(follow_up)
    .bind(actor)
    .execute(&mut *conn)
    .await
    .context("write subject status")?;

    Ok(())
}

async fn sweep_table(
    conn: &mut PgConnection,
    kind: SubjectKind,
    target: AppointmentStatus,
    cutoff: DateTime<Utc>,
    actor: Option<&str>,
) -> Result<Vec<Uuid>, AppError> {
    let ids = sqlx::query_scalar::<_, Uuid>(&format!(
        r#"
        UPDATE {}
        SET status = $1, updated_by = COALESCE($4, 'system'), updated_at = now()
        WHERE status = $2 AND start_datetime < $3
        RETURNING id
        "#,
        kind.appointment_table()
    ))
    .bind(target.as_str())
    .bind(AppointmentStatus::Upcoming.as_str())
    .bind(cutoff)
    .bind(actor)
    .fetch_all(&mut *conn)
    .await
    .with_context(|| format!("sweep {}", kind.appointment_table()))?;

    for id in &ids {
        audit::record(
            conn,
            AuditEntry {
                entity_type: kind.appointment_entity_type(),
                entity_id: *id,
                action: "status",
                content: format!("status: {} → {} (sweep)", AppointmentStatus::Upcoming, target),
                actor,
            },
        )
        .await?;
    }

    Ok(ids)
}
