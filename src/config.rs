use chrono::{FixedOffset, NaiveDate, NaiveTime, Offset, Utc};
use serde::Deserialize;

use crate::status_rules::TransitionPolicy;

/// One week.
const MAX_DONE_THRESHOLD_MINUTES: i64 = 7 * 24 * 60;
const MAX_REQUEUE_DAYS: i64 = 365;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Shared secret for `/api/cron/*` and `/api/playbooks/*`.
    pub cron_api_key: String,
    pub playbook_api_url: Option<String>,
    pub playbook_api_key: Option<String>,
    pub appointment_webhook_url: Option<String>,
    /// Minutes after `start_datetime` before an upcoming appointment is swept.
    pub appointment_done_threshold_minutes: i64,
    pub follow_up_default_time: NaiveTime,
    pub no_answer_requeue_days: i64,
    pub business_utc_offset_hours: i32,
    pub transition_policy: TransitionPolicy,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .or_else(|_| std::env::var("DB_URL"))
                .map_err(|_| {
                    anyhow::anyhow!("DATABASE_URL or DB_URL environment variable required")
                })
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DATABASE_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DATABASE_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            cron_api_key: std::env::var("CRON_API_KEY")
                .map_err(|_| anyhow::anyhow!("CRON_API_KEY environment variable required"))
                .and_then(|key| {
                    if key.trim().is_empty() {
                        anyhow::bail!("CRON_API_KEY cannot be empty");
                    }
                    Ok(key)
                })?,
            playbook_api_url: optional_url("PLAYBOOK_API_URL")?,
            playbook_api_key: std::env::var("PLAYBOOK_API_KEY")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            appointment_webhook_url: optional_url("APPOINTMENT_WEBHOOK_URL")?,
            appointment_done_threshold_minutes: parse_or(
                "APPOINTMENT_DONE_THRESHOLD_MINUTES",
                150,
            )?,
            follow_up_default_time: match std::env::var("FOLLOW_UP_DEFAULT_TIME") {
                Ok(raw) => NaiveTime::parse_from_str(raw.trim(), "%H:%M").map_err(|_| {
                    anyhow::anyhow!("FOLLOW_UP_DEFAULT_TIME must be HH:MM, got '{}'", raw)
                })?,
                Err(_) => NaiveTime::from_hms_opt(10, 0, 0)
                    .ok_or_else(|| anyhow::anyhow!("invalid default follow-up time"))?,
            },
            no_answer_requeue_days: parse_or("NO_ANSWER_REQUEUE_DAYS", 3)?,
            business_utc_offset_hours: parse_or("BUSINESS_UTC_OFFSET_HOURS", 8)?,
            transition_policy: match std::env::var("STATUS_TRANSITION_POLICY")
                .unwrap_or_default()
                .trim()
                .to_lowercase()
                .as_str()
            {
                "" | "permissive" => TransitionPolicy::Permissive,
                "strict" => TransitionPolicy::Strict,
                other => anyhow::bail!(
                    "STATUS_TRANSITION_POLICY must be 'permissive' or 'strict', got '{}'",
                    other
                ),
            },
        };

        config.validate()?;

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Database URL: {}...",
            &config.database_url[..20.min(config.database_url.len())]
        );
        match config.playbook_api_url {
            Some(ref url) => tracing::info!("Dialer integration enabled: {}", url),
            None => tracing::warn!("PLAYBOOK_API_URL not set, dialer integration disabled"),
        }
        if config.appointment_webhook_url.is_none() {
            tracing::warn!("APPOINTMENT_WEBHOOK_URL not set, appointment webhooks disabled");
        }
        tracing::debug!(
            "Business offset: UTC{:+}, sweep threshold: {} min",
            config.business_utc_offset_hours,
            config.appointment_done_threshold_minutes
        );
        tracing::info!("Status transition policy: {:?}", config.transition_policy);
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }

    /// Cross-field and range checks on an assembled config.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.playbook_api_url.is_some() != self.playbook_api_key.is_some() {
            anyhow::bail!("PLAYBOOK_API_URL and PLAYBOOK_API_KEY must be set together");
        }
        if !(-12..=14).contains(&self.business_utc_offset_hours) {
            anyhow::bail!("BUSINESS_UTC_OFFSET_HOURS must be between -12 and 14");
        }
        if !(0..=MAX_DONE_THRESHOLD_MINUTES).contains(&self.appointment_done_threshold_minutes) {
            anyhow::bail!(
                "APPOINTMENT_DONE_THRESHOLD_MINUTES must be between 0 and {}",
                MAX_DONE_THRESHOLD_MINUTES
            );
        }
        if !(1..=MAX_REQUEUE_DAYS).contains(&self.no_answer_requeue_days) {
            anyhow::bail!(
                "NO_ANSWER_REQUEUE_DAYS must be between 1 and {}",
                MAX_REQUEUE_DAYS
            );
        }
        Ok(())
    }

    /// Fixed business-day offset (UTC+8 unless configured otherwise).
    pub fn business_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.business_utc_offset_hours * 3600)
            .unwrap_or_else(|| Utc.fix())
    }

    /// Calendar date "today" in the business timezone; check-ins are keyed by it.
    pub fn business_today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.business_offset()).date_naive()
    }

    pub fn appointment_threshold(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.appointment_done_threshold_minutes)
    }
}

fn optional_url(var: &str) -> anyhow::Result<Option<String>> {
    match std::env::var(var).ok().filter(|s| !s.trim().is_empty()) {
        Some(url) => {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("{} must start with http:// or https://", var);
            }
            Ok(Some(url.trim_end_matches('/').to_string()))
        }
        None => Ok(None),
    }
}

fn parse_or<T>(var: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
{
    match std::env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a number, got '{}'", var, raw)),
        _ => Ok(default),
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        database_url: "postgresql://localhost/loan_crm_test".to_string(),
        port: 3000,
        cron_api_key: "cron-secret".to_string(),
        playbook_api_url: None,
        playbook_api_key: None,
        appointment_webhook_url: None,
        appointment_done_threshold_minutes: 150,
        follow_up_default_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        no_answer_requeue_days: 3,
        business_utc_offset_hours: 8,
        transition_policy: TransitionPolicy::Permissive,
    }
}
