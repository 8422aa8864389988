use sqlx::PgConnection;
use uuid::Uuid;

use crate::errors::{AppError, ResultExt};
use crate::models::Subject;

/// One append-only audit row.
#[derive(Debug, Clone)]
pub struct AuditEntry<'a> {
    pub entity_type: &'a str,
    pub entity_id: Uuid,
    pub action: &'a str,
    pub content: String,
    pub actor: Option<&'a str>,
}

pub async fn record(conn: &mut PgConnection, entry: AuditEntry<'_>) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO audit_logs (entity_type, entity_id, action, content, actor)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(entry.entity_type)
    .bind(entry.entity_id)
    .bind(entry.action)
    .bind(&entry.content)
    .bind(entry.actor)
    .execute(&mut *conn)
    .await
    .context("write audit log")?;

    tracing::debug!(
        "Audit {} {} {}",
        entry.entity_type,
        entry.entity_id,
        entry.action
    );
    Ok(())
}

/// Adds a human-readable note to a lead or borrower timeline.
pub async fn add_note(
    conn: &mut PgConnection,
    subject: Subject,
    content: &str,
    actor: Option<&str>,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO notes (entity_type, entity_id, content, created_by) VALUES ($1, $2, $3, $4)",
    )
    .bind(subject.kind.entity_type())
    .bind(subject.id)
    .bind(content)
    .bind(actor)
    .execute(&mut *conn)
    .await
    .context("write note")?;

    Ok(())
}
