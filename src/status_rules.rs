//! Time-based and reason-based status rules for leads, borrowers and
//! appointments.
//!
//! Everything here is pure: callers load rows, ask these rules what should
//! happen, and persist the outcome (see `status_service`).

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::errors::AppError;
use crate::models::{AppointmentStatus, LeadStatus};

// ============ Transition policy ============

/// How strictly explicit status changes are validated.
///
/// `Permissive` accepts any status to any status, which is how operators
/// have always been able to correct records. `Strict` enforces the
/// documented lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionPolicy {
    #[default]
    Permissive,
    Strict,
}

impl TransitionPolicy {
    pub fn check_appointment(
        &self,
        from: AppointmentStatus,
        to: AppointmentStatus,
    ) -> Result<(), AppError> {
        if *self == TransitionPolicy::Permissive || from == to {
            return Ok(());
        }

        use AppointmentStatus::*;
        let allowed = match from {
            Upcoming => matches!(to, Scheduled | Done | Missed | Cancelled),
            Scheduled => matches!(to, Upcoming | Done | Missed | Cancelled),
            Done | Missed | Cancelled => false,
        };

        if allowed {
            Ok(())
        } else {
            Err(AppError::Validation(format!(
                "Appointment cannot move from '{}' to '{}'",
                from, to
            )))
        }
    }

    pub fn check_lead(&self, from: LeadStatus, to: LeadStatus) -> Result<(), AppError> {
        if *self == TransitionPolicy::Permissive || from == to {
            return Ok(());
        }

        // Terminal records only leave through an explicit reactivation;
        // everything else moves freely but never back to `new`.
        let allowed = if from.is_terminal() {
            to == LeadStatus::New
        } else {
            to != LeadStatus::New
        };

        if allowed {
            Ok(())
        } else {
            Err(AppError::Validation(format!(
                "Status cannot move from '{}' to '{}'",
                from, to
            )))
        }
    }
}

// ============ Terminal reasons ============

/// Fixed taxonomy of reasons for closing out a lead or borrower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    BlacklistedDoNotCall,
    BlacklistedFraud,
    BlacklistedOthers,
    GiveUpUnemployed,
    GiveUpLowIncome,
    GiveUpNotInterested,
    GiveUpUnreachable,
    GiveUpOthers,
}

impl TerminalReason {
    pub const ALL: [TerminalReason; 8] = [
        TerminalReason::BlacklistedDoNotCall,
        TerminalReason::BlacklistedFraud,
        TerminalReason::BlacklistedOthers,
        TerminalReason::GiveUpUnemployed,
        TerminalReason::GiveUpLowIncome,
        TerminalReason::GiveUpNotInterested,
        TerminalReason::GiveUpUnreachable,
        TerminalReason::GiveUpOthers,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            TerminalReason::BlacklistedDoNotCall => "blacklisted_do_not_call",
            TerminalReason::BlacklistedFraud => "blacklisted_fraud",
            TerminalReason::BlacklistedOthers => "blacklisted_others",
            TerminalReason::GiveUpUnemployed => "give_up_unemployed",
            TerminalReason::GiveUpLowIncome => "give_up_low_income",
            TerminalReason::GiveUpNotInterested => "give_up_not_interested",
            TerminalReason::GiveUpUnreachable => "give_up_unreachable",
            TerminalReason::GiveUpOthers => "give_up_others",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TerminalReason::BlacklistedDoNotCall => "Blacklisted - Do not call",
            TerminalReason::BlacklistedFraud => "Blacklisted - Suspected fraud",
            TerminalReason::BlacklistedOthers => "Blacklisted - Others",
            TerminalReason::GiveUpUnemployed => "Give up - Unemployed",
            TerminalReason::GiveUpLowIncome => "Give up - Income too low",
            TerminalReason::GiveUpNotInterested => "Give up - Not interested",
            TerminalReason::GiveUpUnreachable => "Give up - Unreachable",
            TerminalReason::GiveUpOthers => "Give up - Others",
        }
    }

    pub fn terminal_status(&self) -> LeadStatus {
        match self {
            TerminalReason::BlacklistedDoNotCall
            | TerminalReason::BlacklistedFraud
            | TerminalReason::BlacklistedOthers => LeadStatus::Blacklisted,
            _ => LeadStatus::GiveUp,
        }
    }

    /// Reasons that need a free-text elaboration.
    pub fn requires_custom_reason(&self) -> bool {
        matches!(
            self,
            TerminalReason::BlacklistedOthers | TerminalReason::GiveUpOthers
        )
    }
}

impl FromStr for TerminalReason {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TerminalReason::ALL
            .iter()
            .copied()
            .find(|reason| reason.code() == s)
            .ok_or_else(|| AppError::Validation(format!("Unknown status reason '{}'", s)))
    }
}

/// Outcome of validating a terminal reason: the status to persist and the
/// note text to record with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminalDecision {
    pub reason: TerminalReason,
    pub status: LeadStatus,
    pub note: String,
}

/// Validates a reason code and optional free text. Fails before anything is
/// written when a reason that needs elaboration comes without it.
pub fn resolve_terminal_reason(
    code: &str,
    custom_reason_text: Option<&str>,
) -> Result<TerminalDecision, AppError> {
    let reason: TerminalReason = code.trim().parse()?;
    let custom = custom_reason_text
        .map(str::trim)
        .filter(|text| !text.is_empty());

    if reason.requires_custom_reason() && custom.is_none() {
        return Err(AppError::Validation(format!(
            "Please describe the reason for '{}'",
            reason.label()
        )));
    }

    let note = match custom {
        Some(text) => format!("{}: {}", reason.label(), text),
        None => reason.label().to_string(),
    };

    Ok(TerminalDecision {
        reason,
        status: reason.terminal_status(),
        note,
    })
}

// ============ Follow-up scheduling ============

/// Converts operator-entered follow-up dates (business local time) to UTC.
#[derive(Debug, Clone, Copy)]
pub struct FollowUpClock {
    pub offset: FixedOffset,
    pub default_time: NaiveTime,
}

impl FollowUpClock {
    pub fn new(offset: FixedOffset, default_time: NaiveTime) -> Self {
        Self {
            offset,
            default_time,
        }
    }

    /// Date-only input lands on the default time of day; seconds are dropped.
    /// Dates whose UTC equivalent is not representable are rejected.
    pub fn normalize(
        &self,
        date: NaiveDate,
        time: Option<NaiveTime>,
    ) -> Result<DateTime<Utc>, AppError> {
        let time = time.unwrap_or(self.default_time);
        let time = time
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(time);

        date.and_time(time)
            .checked_sub_signed(self.offset_duration())
            .map(|utc| Utc.from_utc_datetime(&utc))
            .ok_or_else(|| {
                AppError::Validation(format!("Follow-up date {} is out of range", date))
            })
    }

    /// Audit note summarizing the new follow-up, in business local time.
    pub fn note(&self, follow_up: DateTime<Utc>) -> String {
        let local = follow_up.with_timezone(&self.offset);
        format!(
            "Follow-up scheduled for {} at {} (UTC{})",
            local.format("%Y-%m-%d"),
            local.format("%H:%M"),
            self.offset_label()
        )
    }

    fn offset_duration(&self) -> Duration {
        Duration::seconds(self.offset.local_minus_utc() as i64)
    }

    fn offset_label(&self) -> String {
        let hours = self.offset.local_minus_utc() / 3600;
        format!("{:+}", hours)
    }
}

/// Statuses a plain status change may set. `follow_up` needs a date and
/// goes through follow-up scheduling instead.
pub fn ensure_direct_status(status: LeadStatus) -> Result<(), AppError> {
    if status == LeadStatus::FollowUp {
        return Err(AppError::Validation(
            "Use follow-up scheduling to set 'follow_up' with a date".to_string(),
        ));
    }
    Ok(())
}

pub const NO_ANSWER_NOTE: &str = "No answer - follow-up date cleared";

// ============ Appointment sweep ============

/// Operator-supplied outcome for stale upcoming appointments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    #[default]
    Done,
    Missed,
}

impl Disposition {
    pub fn status(&self) -> AppointmentStatus {
        match self {
            Disposition::Done => AppointmentStatus::Done,
            Disposition::Missed => AppointmentStatus::Missed,
        }
    }
}

/// An upcoming appointment is due once its start is more than `threshold`
/// in the past.
pub fn promotion_due(
    status: AppointmentStatus,
    start: DateTime<Utc>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> bool {
    status == AppointmentStatus::Upcoming && start < now - threshold
}

/// Cut-off for the sweep query; mirrors `promotion_due`.
pub fn promotion_cutoff(now: DateTime<Utc>, threshold: Duration) -> DateTime<Utc> {
    now - threshold
}

/// No-answer leads untouched since before this instant re-enter follow-up.
pub fn requeue_cutoff(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    now - Duration::days(days)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> FollowUpClock {
        FollowUpClock::new(
            FixedOffset::east_opt(8 * 3600).unwrap(),
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_permissive_policy_accepts_anything() {
        let policy = TransitionPolicy::default();
        assert!(policy
            .check_appointment(AppointmentStatus::Done, AppointmentStatus::Upcoming)
            .is_ok());
        assert!(policy
            .check_lead(LeadStatus::Blacklisted, LeadStatus::Assigned)
            .is_ok());
    }

    #[test]
    fn test_strict_policy_blocks_reopening_appointments() {
        let policy = TransitionPolicy::Strict;
        assert!(policy
            .check_appointment(AppointmentStatus::Upcoming, AppointmentStatus::Missed)
            .is_ok());
        assert!(policy
            .check_appointment(AppointmentStatus::Done, AppointmentStatus::Upcoming)
            .is_err());
        assert!(policy
            .check_appointment(AppointmentStatus::Cancelled, AppointmentStatus::Scheduled)
            .is_err());
    }

    #[test]
    fn test_strict_policy_terminal_leads_only_reactivate() {
        let policy = TransitionPolicy::Strict;
        assert!(policy
            .check_lead(LeadStatus::GiveUp, LeadStatus::FollowUp)
            .is_err());
        assert!(policy.check_lead(LeadStatus::GiveUp, LeadStatus::New).is_ok());
        assert!(policy
            .check_lead(LeadStatus::Assigned, LeadStatus::NoAnswer)
            .is_ok());
    }

    #[test]
    fn test_every_reason_maps_to_one_terminal_status() {
        for reason in TerminalReason::ALL {
            let status = reason.terminal_status();
            assert!(status == LeadStatus::Blacklisted || status == LeadStatus::GiveUp);
            assert!(reason.code().starts_with(match status {
                LeadStatus::Blacklisted => "blacklisted_",
                _ => "give_up_",
            }));
        }
    }

    #[test]
    fn test_blacklisted_others_without_text_fails() {
        let err = resolve_terminal_reason("blacklisted_others", None).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = resolve_terminal_reason("blacklisted_others", Some("   ")).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_custom_reason_is_appended_to_note() {
        let decision =
            resolve_terminal_reason("give_up_others", Some(" moved overseas ")).unwrap();
        assert_eq!(decision.status, LeadStatus::GiveUp);
        assert_eq!(decision.note, "Give up - Others: moved overseas");

        let decision = resolve_terminal_reason("blacklisted_do_not_call", None).unwrap();
        assert_eq!(decision.status, LeadStatus::Blacklisted);
        assert_eq!(decision.note, "Blacklisted - Do not call");
    }

    #[test]
    fn test_unknown_reason_rejected() {
        assert!(resolve_terminal_reason("give_up_bored", None).is_err());
    }

    #[test]
    fn test_follow_up_date_only_uses_default_time() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 20).unwrap();
        let utc = clock().normalize(date, None).unwrap();
        // 10:00 at UTC+8 is 02:00 UTC the same day.
        assert_eq!(utc.to_rfc3339(), "2026-10-20T02:00:00+00:00");
    }

    #[test]
    fn test_follow_up_explicit_time_crosses_utc_midnight() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 20).unwrap();
        let time = NaiveTime::from_hms_opt(7, 30, 45).unwrap();
        let utc = clock().normalize(date, Some(time)).unwrap();
        assert_eq!(utc.to_rfc3339(), "2026-10-19T23:30:00+00:00");
        assert_eq!(
            clock().note(utc),
            "Follow-up scheduled for 2026-10-20 at 07:30 (UTC+8)"
        );
    }

    #[test]
    fn test_follow_up_out_of_range_date_rejected() {
        let result = clock().normalize(NaiveDate::MIN, Some(NaiveTime::MIN));
        assert!(matches!(result, Err(AppError::Validation(_))));

        let west = FollowUpClock::new(
            FixedOffset::west_opt(5 * 3600).unwrap(),
            NaiveTime::from_hms_opt(23, 0, 0).unwrap(),
        );
        assert!(west.normalize(NaiveDate::MAX, None).is_err());
    }

    #[test]
    fn test_follow_up_not_settable_directly() {
        assert!(matches!(
            ensure_direct_status(LeadStatus::FollowUp),
            Err(AppError::Validation(_))
        ));
        assert!(ensure_direct_status(LeadStatus::Contacted).is_ok());
        assert!(ensure_direct_status(LeadStatus::New).is_ok());
    }

    #[test]
    fn test_promotion_threshold() {
        let threshold = Duration::minutes(150);
        let now = Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap();

        let stale = now - Duration::minutes(151);
        let fresh = now - Duration::minutes(149);

        assert!(promotion_due(AppointmentStatus::Upcoming, stale, now, threshold));
        assert!(!promotion_due(AppointmentStatus::Upcoming, fresh, now, threshold));
        assert!(!promotion_due(AppointmentStatus::Cancelled, stale, now, threshold));
        assert!(stale < promotion_cutoff(now, threshold));
    }

    #[test]
    fn test_disposition_status() {
        assert_eq!(Disposition::Done.status(), AppointmentStatus::Done);
        assert_eq!(Disposition::Missed.status(), AppointmentStatus::Missed);
    }
}
