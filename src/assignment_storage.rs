use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::assignment::{
    self, even_split, select_agent, AgentLoad, AssignmentPreview, AssignmentStrategy,
    RotationCursor, MAX_AGENT_WEIGHT,
};
use crate::errors::{AppError, ResultExt};
use crate::models::{
    AssignmentMethod, AutoAssignmentSettings, CheckedInAgent, HistoryMethod,
    Lead, LeadAssignmentHistory, LeadStatus, LEAD_COLUMNS,
};
use crate::scheduler::ensure_agent_exists;

const SETTINGS_COLUMNS: &str = "is_enabled, assignment_method, current_round_robin_index, \
                                last_assigned_agent_id, max_leads_per_agent_per_day, updated_at";

const CHECK_IN_COLUMNS: &str =
    "id, agent_id, check_in_date, lead_capacity, weight, current_lead_count, is_active";

const HISTORY_COLUMNS: &str = "id, lead_id, agent_id, assigned_by, method, reason, created_at";

/// Result of one assignment attempt. Failures are reported here rather than
/// as errors so that batches can keep going.
#[derive(Debug, Clone, Serialize)]
pub struct AssignmentOutcome {
    pub lead_id: Uuid,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<HistoryMethod>,
    pub message: String,
}

impl AssignmentOutcome {
    fn assigned(lead_id: Uuid, agent_id: Uuid, method: HistoryMethod) -> Self {
        Self {
            lead_id,
            success: true,
            agent_id: Some(agent_id),
            method: Some(method),
            message: format!("Lead assigned to agent {}", agent_id),
        }
    }

    fn failed(lead_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            lead_id,
            success: false,
            agent_id: None,
            method: None,
            message: message.into(),
        }
    }
}

/// Per-lead outcomes of a batch run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkAssignmentResult {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub details: Vec<AssignmentOutcome>,
}

impl BulkAssignmentResult {
    fn push(&mut self, outcome: AssignmentOutcome) {
        self.total += 1;
        if outcome.success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.details.push(outcome);
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub is_enabled: Option<bool>,
    pub assignment_method: Option<AssignmentMethod>,
    pub max_leads_per_agent_per_day: Option<i32>,
    /// Puts the rotation back at the first eligible agent.
    #[serde(default)]
    pub reset_cursor: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckIn {
    pub agent_id: Uuid,
    /// Defaults to `max_leads_per_agent_per_day`.
    pub lead_capacity: Option<i32>,
    pub weight: Option<i32>,
}

/// Database side of lead auto-assignment: check-ins, the settings row, and
/// the transactional apply step around the decisions made in `assignment`.
pub struct AutoAssigner {
    pool: PgPool,
}

impl AutoAssigner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn settings(&self) -> Result<AutoAssignmentSettings, AppError> {
        sqlx::query_as::<_, AutoAssignmentSettings>(&format!(
            "SELECT {} FROM auto_assignment_settings WHERE id = 1",
            SETTINGS_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::InternalError("Auto-assignment settings row missing".to_string()))
    }

    pub async fn update_settings(
        &self,
        actor: &str,
        update: SettingsUpdate,
    ) -> Result<AutoAssignmentSettings, AppError> {
        if let Some(max) = update.max_leads_per_agent_per_day {
            if max < 0 {
                return Err(AppError::Validation(
                    "Max leads per agent per day cannot be negative".to_string(),
                ));
            }
        }

        let settings = sqlx::query_as::<_, AutoAssignmentSettings>(&format!(
            r#"
            UPDATE auto_assignment_settings
            SET is_enabled = COALESCE($1, is_enabled),
                assignment_method = COALESCE($2, assignment_method),
                max_leads_per_agent_per_day = COALESCE($3, max_leads_per_agent_per_day),
                current_round_robin_index = CASE WHEN $4 THEN 0 ELSE current_round_robin_index END,
                updated_at = now()
            WHERE id = 1
            RETURNING {}
            "#,
            SETTINGS_COLUMNS
        ))
        .bind(update.is_enabled)
        .bind(update.assignment_method.map(|m| m.as_str()))
        .bind(update.max_leads_per_agent_per_day)
        .bind(update.reset_cursor)
        .fetch_optional(&self.pool)
        .await
        .context("update auto-assignment settings")?
        .ok_or_else(|| AppError::InternalError("Auto-assignment settings row missing".to_string()))?;

        tracing::info!(
            "Auto-assignment settings updated by {}: enabled={}, method={}, max/day={}",
            actor,
            settings.is_enabled,
            settings.assignment_method,
            settings.max_leads_per_agent_per_day
        );
        Ok(settings)
    }

    /// Upserts today's check-in. Checking in again reactivates the row and
    /// keeps the leads already counted against it.
    #[tracing::instrument(skip(self, request), fields(agent = %request.agent_id))]
    pub async fn check_in(
        &self,
        today: NaiveDate,
        request: CheckIn,
    ) -> Result<CheckedInAgent, AppError> {
        let weight = check_in_weight(request.weight)?;
        let lead_capacity = match request.lead_capacity {
            Some(capacity) => capacity,
            None => self.settings().await?.max_leads_per_agent_per_day,
        };
        if lead_capacity < 0 {
            return Err(AppError::Validation(
                "Lead capacity cannot be negative".to_string(),
            ));
        }

        let mut conn = self.pool.acquire().await?;
        ensure_agent_exists(&mut conn, request.agent_id).await?;

        let row = sqlx::query_as::<_, CheckedInAgent>(&format!(
            r#"
            INSERT INTO checked_in_agents (agent_id, check_in_date, lead_capacity, weight)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (agent_id, check_in_date) DO UPDATE
            SET lead_capacity = EXCLUDED.lead_capacity,
                weight = EXCLUDED.weight,
                is_active = true,
                updated_at = now()
            RETURNING {}
            "#,
            CHECK_IN_COLUMNS
        ))
        .bind(request.agent_id)
        .bind(today)
        .bind(lead_capacity)
        .bind(weight)
        .fetch_one(&mut *conn)
        .await
        .context("check in agent")?;

        tracing::info!(
            "Agent {} checked in for {} (capacity {}, weight {})",
            row.agent_id,
            today,
            row.lead_capacity,
            row.weight
        );
        Ok(row)
    }

    pub async fn check_out(&self, today: NaiveDate, agent_id: Uuid) -> Result<CheckedInAgent, AppError> {
        let row = sqlx::query_as::<_, CheckedInAgent>(&format!(
            r#"
            UPDATE checked_in_agents SET is_active = false, updated_at = now()
            WHERE agent_id = $1 AND check_in_date = $2
            RETURNING {}
            "#,
            CHECK_IN_COLUMNS
        ))
        .bind(agent_id)
        .bind(today)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!("Agent {} is not checked in for {}", agent_id, today))
        })?;

        tracing::info!("Agent {} checked out for {}", agent_id, today);
        Ok(row)
    }

    /// Today's check-ins, active or not, in rotation order.
    pub async fn checked_in_agents(&self, today: NaiveDate) -> Result<Vec<CheckedInAgent>, AppError> {
        let rows = sqlx::query_as::<_, CheckedInAgent>(&format!(
            "SELECT {} FROM checked_in_agents WHERE check_in_date = $1 ORDER BY id",
            CHECK_IN_COLUMNS
        ))
        .bind(today)
        .fetch_all(&self.pool)
        .await
        .context("load checked-in agents")?;

        Ok(rows)
    }

    /// Daily rollover: deactivates check-ins left over from earlier days so
    /// agents start each day unchecked.
    pub async fn close_previous_days(&self, today: NaiveDate) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE checked_in_agents SET is_active = false, updated_at = now() WHERE check_in_date < $1 AND is_active = true",
        )
        .bind(today)
        .execute(&self.pool)
        .await
        .context("close previous check-ins")?;

        tracing::info!(
            "Closed {} check-in(s) from before {}",
            result.rows_affected(),
            today
        );
        Ok(result.rows_affected())
    }

    /// Auto-assigns one lead. Never fails: errors are logged and reported as
    /// an unsuccessful outcome, and leave nothing half-written.
    pub async fn assign_single(
        &self,
        today: NaiveDate,
        lead_id: Uuid,
        actor: Option<&str>,
    ) -> AssignmentOutcome {
        match self.try_assign_single(today, lead_id, actor).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Auto-assignment of lead {} failed: {}", lead_id, e);
                AssignmentOutcome::failed(lead_id, e.public_message())
            }
        }
    }

    #[tracing::instrument(skip(self, actor))]
    async fn try_assign_single(
        &self,
        today: NaiveDate,
        lead_id: Uuid,
        actor: Option<&str>,
    ) -> Result<AssignmentOutcome, AppError> {
        let mut tx = self.pool.begin().await?;

        let settings = sqlx::query_as::<_, AutoAssignmentSettings>(&format!(
            "SELECT {} FROM auto_assignment_settings WHERE id = 1 FOR UPDATE",
            SETTINGS_COLUMNS
        ))
        .fetch_optional(&mut *tx)
        .await
        .context("lock auto-assignment settings")?
        .ok_or_else(|| AppError::InternalError("Auto-assignment settings row missing".to_string()))?;

        if !settings.is_enabled {
            return Ok(AssignmentOutcome::failed(
                lead_id,
                "Auto-assignment is not enabled",
            ));
        }

        let lead = lock_lead(&mut tx, lead_id).await?;
        if let Some(agent_id) = lead.assigned_to {
            return Ok(AssignmentOutcome::failed(
                lead_id,
                format!("Lead is already assigned to agent {}", agent_id),
            ));
        }

        let agents = lock_check_ins(&mut tx, today).await?;
        let loads: Vec<AgentLoad> = agents.iter().map(AgentLoad::from).collect();
        let strategy = AssignmentStrategy::from(settings.assignment_method);
        let mut cursor = RotationCursor::new(settings.current_round_robin_index);
        let position = cursor.index();

        let Some(decision) = select_agent(&loads, &mut cursor, strategy) else {
            tracing::warn!("No available agents for lead {} on {}", lead_id, today);
            return Ok(AssignmentOutcome::failed(
                lead_id,
                "No available agents: every checked-in agent is at capacity or none are checked in",
            ));
        };

        let reason = format!(
            "Rotation position {} of {} eligible agent(s)",
            position, decision.eligible_count
        );
        apply_assignment(
            &mut tx,
            lead_id,
            decision.agent.agent_id,
            Some(decision.agent.check_in_id),
            decision.method,
            Some(reason.as_str()),
            actor,
        )
        .await?;

        sqlx::query(
            r#"
            UPDATE auto_assignment_settings
            SET current_round_robin_index = $1, last_assigned_agent_id = $2, updated_at = now()
            WHERE id = 1
            "#,
        )
        .bind(cursor.index())
        .bind(decision.agent.agent_id)
        .execute(&mut *tx)
        .await
        .context("advance rotation cursor")?;

        tx.commit().await?;

        tracing::info!(
            "Lead {} auto-assigned to agent {} ({}), cursor {} → {}",
            lead_id,
            decision.agent.agent_id,
            decision.method,
            position,
            cursor.index()
        );
        Ok(AssignmentOutcome::assigned(
            lead_id,
            decision.agent.agent_id,
            decision.method,
        ))
    }

    /// Auto-assigns every unassigned new lead, oldest first, one transaction
    /// per lead.
    pub async fn assign_bulk(
        &self,
        today: NaiveDate,
        actor: Option<&str>,
    ) -> Result<BulkAssignmentResult, AppError> {
        let leads = self.unassigned_leads().await?;
        let mut result = BulkAssignmentResult::default();

        for lead_id in leads {
            result.push(self.assign_single(today, lead_id, actor).await);
        }

        tracing::info!(
            "Bulk assignment: {} total, {} assigned, {} failed",
            result.total,
            result.succeeded,
            result.failed
        );
        Ok(result)
    }

    /// One-off balancing across today's active check-ins. Capacity and the
    /// rotation cursor are left out of it.
    pub async fn assign_even_split(
        &self,
        today: NaiveDate,
        actor: Option<&str>,
    ) -> Result<BulkAssignmentResult, AppError> {
        let agents: Vec<CheckedInAgent> = self
            .checked_in_agents(today)
            .await?
            .into_iter()
            .filter(|a| a.is_active)
            .collect();
        if agents.is_empty() {
            return Err(AppError::Conflict(
                "No agents are checked in today".to_string(),
            ));
        }

        let leads = self.unassigned_leads().await?;
        let agent_ids: Vec<Uuid> = agents.iter().map(|a| a.agent_id).collect();
        let mut result = BulkAssignmentResult::default();

        for (agent_id, slice) in even_split(&agent_ids, &leads) {
            let check_in_id = agents
                .iter()
                .find(|a| a.agent_id == agent_id)
                .map(|a| a.id);
            for lead_id in slice {
                let outcome = match self
                    .assign_directly(
                        *lead_id,
                        agent_id,
                        check_in_id,
                        HistoryMethod::ManualEvenSplit,
                        None,
                        actor,
                    )
                    .await
                {
                    Ok(_) => AssignmentOutcome::assigned(
                        *lead_id,
                        agent_id,
                        HistoryMethod::ManualEvenSplit,
                    ),
                    Err(e) => {
                        tracing::error!("Even split of lead {} failed: {}", lead_id, e);
                        AssignmentOutcome::failed(*lead_id, e.public_message())
                    }
                };
                result.push(outcome);
            }
        }

        tracing::info!(
            "Even split over {} agent(s): {} assigned, {} failed",
            agents.len(),
            result.succeeded,
            result.failed
        );
        Ok(result)
    }

    /// Replays the rotation over the current unassigned backlog without
    /// writing anything.
    pub async fn preview(&self, today: NaiveDate) -> Result<AssignmentPreview, AppError> {
        let settings = self.settings().await?;
        let agents = self.checked_in_agents(today).await?;
        let backlog = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM leads WHERE assigned_to IS NULL AND status = $1 AND is_deleted = false",
        )
        .bind(LeadStatus::New.as_str())
        .fetch_one(&self.pool)
        .await
        .context("count unassigned leads")?;

        let loads: Vec<AgentLoad> = agents.iter().map(AgentLoad::from).collect();
        Ok(assignment::preview(
            &loads,
            RotationCursor::new(settings.current_round_robin_index),
            AssignmentStrategy::from(settings.assignment_method),
            backlog.max(0) as usize,
        ))
    }

    /// Assigns a lead to a specific agent, bypassing rotation and capacity.
    #[tracing::instrument(skip(self, reason))]
    pub async fn assign_manual(
        &self,
        actor: &str,
        lead_id: Uuid,
        agent_id: Uuid,
        reason: Option<String>,
    ) -> Result<LeadAssignmentHistory, AppError> {
        let history = self
            .assign_directly(
                lead_id,
                agent_id,
                None,
                HistoryMethod::Manual,
                reason.as_deref(),
                Some(actor),
            )
            .await?;

        tracing::info!("Lead {} manually assigned to agent {} by {}", lead_id, agent_id, actor);
        Ok(history)
    }

    /// Assignment history of a lead, newest first.
    pub async fn history(&self, lead_id: Uuid) -> Result<Vec<LeadAssignmentHistory>, AppError> {
        let rows = sqlx::query_as::<_, LeadAssignmentHistory>(&format!(
            "SELECT {} FROM lead_assignment_history WHERE lead_id = $1 ORDER BY created_at DESC, id DESC",
            HISTORY_COLUMNS
        ))
        .bind(lead_id)
        .fetch_all(&self.pool)
        .await
        .context("load assignment history")?;

        Ok(rows)
    }

    async fn assign_directly(
        &self,
        lead_id: Uuid,
        agent_id: Uuid,
        check_in_id: Option<i64>,
        method: HistoryMethod,
        reason: Option<&str>,
        actor: Option<&str>,
    ) -> Result<LeadAssignmentHistory, AppError> {
        let mut tx = self.pool.begin().await?;
        lock_lead(&mut tx, lead_id).await?;
        ensure_agent_exists(&mut tx, agent_id).await?;
        let history =
            apply_assignment(&mut tx, lead_id, agent_id, check_in_id, method, reason, actor).await?;
        tx.commit().await?;
        Ok(history)
    }

    async fn unassigned_leads(&self) -> Result<Vec<Uuid>, AppError> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM leads
            WHERE assigned_to IS NULL AND status = $1 AND is_deleted = false
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(LeadStatus::New.as_str())
        .fetch_all(&self.pool)
        .await
        .context("load unassigned leads")?;

        Ok(ids)
    }
}

async fn lock_lead(conn: &mut PgConnection, lead_id: Uuid) -> Result<Lead, AppError> {
    sqlx::query_as::<_, Lead>(&format!(
        "SELECT {} FROM leads WHERE id = $1 AND is_deleted = false FOR UPDATE",
        LEAD_COLUMNS
    ))
    .bind(lead_id)
    .fetch_optional(&mut *conn)
    .await
    .context("lock lead")?
    .ok_or_else(|| AppError::NotFound(format!("Lead {} not found", lead_id)))
}

async fn lock_check_ins(
    conn: &mut PgConnection,
    today: NaiveDate,
) -> Result<Vec<CheckedInAgent>, AppError> {
    let rows = sqlx::query_as::<_, CheckedInAgent>(&format!(
        "SELECT {} FROM checked_in_agents WHERE check_in_date = $1 ORDER BY id FOR UPDATE",
        CHECK_IN_COLUMNS
    ))
    .bind(today)
    .fetch_all(&mut *conn)
    .await
    .context("lock checked-in agents")?;

    Ok(rows)
}

/// Writes the lead, the agent's daily counter and the history row.
async fn apply_assignment(
    conn: &mut PgConnection,
    lead_id: Uuid,
    agent_id: Uuid,
    check_in_id: Option<i64>,
    method: HistoryMethod,
    reason: Option<&str>,
    actor: Option<&str>,
) -> Result<LeadAssignmentHistory, AppError> {
    sqlx::query(
        r#"
        UPDATE leads
        SET assigned_to = $2, status = $3, updated_by = $4, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(lead_id)
    .bind(agent_id)
    .bind(LeadStatus::Assigned.as_str())
    .bind(actor)
    .execute(&mut *conn)
    .await
    .context("assign lead")?;

    if let Some(check_in_id) = check_in_id {
        sqlx::query(
            "UPDATE checked_in_agents SET current_lead_count = current_lead_count + 1, updated_at = now() WHERE id = $1",
        )
        .bind(check_in_id)
        .execute(&mut *conn)
        .await
        .context("increment agent lead count")?;
    }

    let history = sqlx::query_as::<_, LeadAssignmentHistory>(&format!(
        r#"
        INSERT INTO lead_assignment_history (lead_id, agent_id, assigned_by, method, reason)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING {}
        "#,
        HISTORY_COLUMNS
    ))
    .bind(lead_id)
    .bind(agent_id)
    .bind(actor)
    .bind(method.as_str())
    .bind(reason)
    .fetch_one(&mut *conn)
    .await
    .context("write assignment history")?;

    Ok(history)
}

fn check_in_weight(weight: Option<i32>) -> Result<i32, AppError> {
    let weight = weight.unwrap_or(1);
    if !(1..=MAX_AGENT_WEIGHT).contains(&weight) {
        return Err(AppError::Validation(format!(
            "Weight must be between 1 and {}",
            MAX_AGENT_WEIGHT
        )));
    }
    Ok(weight)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_result_counts() {
        let mut result = BulkAssignmentResult::default();
        result.push(AssignmentOutcome::assigned(
            Uuid::new_v4(),
            Uuid::new_v4(),
            HistoryMethod::AutoRoundRobin,
        ));
        result.push(AssignmentOutcome::failed(Uuid::new_v4(), "No available agents"));

        assert_eq!(result.total, 2);
        assert_eq!(result.succeeded, 1);
        assert_eq!(result.failed, 1);
    }

    #[test]
    fn test_failed_outcome_serializes_without_agent() {
        let outcome = AssignmentOutcome::failed(Uuid::nil(), "Auto-assignment is not enabled");
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["success"], false);
        assert!(json.get("agent_id").is_none());
        assert_eq!(json["message"], "Auto-assignment is not enabled");
    }

    #[test]
    fn test_check_in_weight_bounds() {
        assert_eq!(check_in_weight(None).unwrap(), 1);
        assert_eq!(check_in_weight(Some(MAX_AGENT_WEIGHT)).unwrap(), MAX_AGENT_WEIGHT);
        assert!(matches!(check_in_weight(Some(0)), Err(AppError::Validation(_))));
        assert!(matches!(
            check_in_weight(Some(2_000_000_000)),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_settings_update_defaults() {
        let update: SettingsUpdate = serde_json::from_str(r#"{"is_enabled": true}"#).unwrap();
        assert_eq!(update.is_enabled, Some(true));
        assert!(update.assignment_method.is_none());
        assert!(!update.reset_cursor);

        let update: SettingsUpdate =
            serde_json::from_str(r#"{"assignment_method": "weighted"}"#).unwrap();
        assert_eq!(update.assignment_method, Some(AssignmentMethod::Weighted));
    }
}
