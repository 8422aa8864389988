use chrono::FixedOffset;
use serde::Serialize;
use sqlx::PgPool;
use std::time::Duration;

use crate::errors::{AppError, ResultExt};
use crate::scheduler::AppointmentDetails;

/// Flat appointment record in the receiver's field naming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppointmentWebhookPayload {
    pub event: String,
    pub appointment_id: String,
    #[serde(rename = "类型")]
    pub subject_type: String,
    #[serde(rename = "客户ID")]
    pub subject_id: String,
    #[serde(rename = "客户姓名")]
    pub customer_name: String,
    pub phone: String,
    #[serde(rename = "负责人")]
    pub agent_name: String,
    #[serde(rename = "预约日期")]
    pub date: String,
    #[serde(rename = "预约时间")]
    pub time_range: String,
    pub status: String,
    #[serde(rename = "贷款状态")]
    pub loan_status: String,
    #[serde(rename = "备注")]
    pub notes: String,
}

#[derive(sqlx::FromRow)]
struct WebhookNames {
    customer_name: String,
    phone: Option<String>,
    agent_name: Option<String>,
}

impl AppointmentWebhookPayload {
    /// Builds the payload; dates and times are rendered in business local time.
    pub fn build(
        event: &str,
        details: &AppointmentDetails,
        customer_name: &str,
        phone: Option<&str>,
        agent_name: Option<&str>,
        offset: FixedOffset,
    ) -> Self {
        let appointment = &details.appointment;
        let start = appointment.start_datetime.with_timezone(&offset);
        let end = appointment.end_datetime.with_timezone(&offset);

        Self {
            event: event.to_string(),
            appointment_id: appointment.id.to_string(),
            subject_type: details.kind.entity_type().to_string(),
            subject_id: appointment.subject_id.to_string(),
            customer_name: customer_name.to_string(),
            phone: phone.unwrap_or_default().to_string(),
            agent_name: agent_name.unwrap_or_default().to_string(),
            date: start.format("%Y-%m-%d").to_string(),
            time_range: format!("{} - {}", start.format("%H:%M"), end.format("%H:%M")),
            status: appointment.status.to_string(),
            loan_status: appointment.loan_status.clone().unwrap_or_default(),
            notes: appointment.notes.clone().unwrap_or_default(),
        }
    }

    /// Loads customer and agent names for `details` and builds the payload.
    pub async fn load(
        pool: &PgPool,
        event: &str,
        details: &AppointmentDetails,
        offset: FixedOffset,
    ) -> Result<Self, AppError> {
        let names = sqlx::query_as::<_, WebhookNames>(&format!(
            r#"
            SELECT p.full_name AS customer_name, p.phone, u.name AS agent_name
            FROM {} p
            LEFT JOIN users u ON u.id = $2
            WHERE p.id = $1
            "#,
            details.kind.person_table()
        ))
        .bind(details.appointment.subject_id)
        .bind(details.appointment.agent_id)
        .fetch_one(pool)
        .await
        .context("load webhook names")?;

        Ok(Self::build(
            event,
            details,
            &names.customer_name,
            names.phone.as_deref(),
            names.agent_name.as_deref(),
            offset,
        ))
    }
}

/// Posts appointment events to the automation receiver. One attempt per
/// event, no signature.
#[derive(Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
    url: String,
}

impl WebhookClient {
    pub fn new(url: String) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create webhook client: {}", e))
            })?;

        Ok(Self { client, url })
    }

    pub async fn send(&self, payload: &AppointmentWebhookPayload) -> Result<(), AppError> {
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("Webhook request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::ExternalApiError(format!(
                "Webhook receiver returned {}: {}",
                status, error_text
            )));
        }

        tracing::info!(
            "Webhook {} delivered for appointment {}",
            payload.event,
            payload.appointment_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Appointment, AppointmentStatus, SubjectKind};
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn details() -> AppointmentDetails {
        let start = Utc.with_ymd_and_hms(2026, 10, 20, 2, 0, 0).unwrap();
        AppointmentDetails {
            kind: SubjectKind::Borrower,
            appointment: Appointment {
                id: Uuid::nil(),
                subject_id: Uuid::nil(),
                agent_id: Uuid::nil(),
                status: AppointmentStatus::Upcoming,
                start_datetime: start,
                end_datetime: start + chrono::Duration::minutes(30),
                loan_status: Some("pending_documents".to_string()),
                notes: None,
                created_by: None,
                updated_by: None,
                created_at: start,
                updated_at: start,
            },
            timeslot_ids: vec![],
        }
    }

    #[test]
    fn test_payload_uses_receiver_keys_and_local_time() {
        let offset = FixedOffset::east_opt(8 * 3600).unwrap();
        let payload = AppointmentWebhookPayload::build(
            "appointment.created",
            &details(),
            "Tan Mei Ling",
            Some("+60123456789"),
            Some("Aisyah"),
            offset,
        );

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["客户姓名"], "Tan Mei Ling");
        assert_eq!(json["预约日期"], "2026-10-20");
        assert_eq!(json["预约时间"], "10:00 - 10:30");
        assert_eq!(json["类型"], "borrower");
        assert_eq!(json["贷款状态"], "pending_documents");
        assert_eq!(json["备注"], "");
        assert_eq!(json["phone"], "+60123456789");
        assert_eq!(json["status"], "upcoming");
    }
}
