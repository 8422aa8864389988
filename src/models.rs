use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::AppError;

/// Declares a closed status enum stored as TEXT.
///
/// Generates `as_str`, `Display`, `FromStr` and `TryFrom<String>` (used by
/// `#[sqlx(try_from = "String")]` on row fields). Serde names match the
/// stored text.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = AppError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(AppError::Validation(format!(
                        "Unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = AppError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }
    };
}

text_enum! {
    /// Lifecycle of a lead or borrower.
    LeadStatus {
        New => "new",
        Assigned => "assigned",
        NoAnswer => "no_answer",
        FollowUp => "follow_up",
        Contacted => "contacted",
        Appointment => "appointment",
        GiveUp => "give_up",
        Blacklisted => "blacklisted",
        Closed => "closed",
    }
}

impl LeadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LeadStatus::GiveUp | LeadStatus::Blacklisted | LeadStatus::Closed
        )
    }
}

text_enum! {
    AppointmentStatus {
        Upcoming => "upcoming",
        Scheduled => "scheduled",
        Done => "done",
        Missed => "missed",
        Cancelled => "cancelled",
    }
}

impl AppointmentStatus {
    /// Statuses covered by the one-active-appointment rule.
    pub const ACTIVE: [AppointmentStatus; 2] =
        [AppointmentStatus::Upcoming, AppointmentStatus::Scheduled];

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    /// Cancelled appointments give their timeslots back; every other status
    /// keeps occupying them.
    pub fn holds_capacity(&self) -> bool {
        !matches!(self, AppointmentStatus::Cancelled)
    }
}

text_enum! {
    /// Distribution strategy persisted in the settings row.
    AssignmentMethod {
        RoundRobin => "round_robin",
        Weighted => "weighted",
    }
}

text_enum! {
    /// How a lead ended up with its agent, as written to the history log.
    HistoryMethod {
        AutoRoundRobin => "auto_round_robin",
        AutoWeighted => "auto_weighted",
        Manual => "manual",
        ManualEvenSplit => "manual_even_split",
    }
}

text_enum! {
    /// Sync state of a contact relative to the dialer platform.
    ContactSyncStatus {
        Pending => "pending",
        Created => "created",
        Failed => "failed",
        Removed => "removed",
    }
}

text_enum! {
    PlaybookStatus {
        Draft => "draft",
        Running => "running",
        Stopped => "stopped",
    }
}

// ============ Subjects ============

/// Which person table an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Lead,
    Borrower,
}

impl SubjectKind {
    pub fn person_table(&self) -> &'static str {
        match self {
            SubjectKind::Lead => "leads",
            SubjectKind::Borrower => "borrowers",
        }
    }

    pub fn appointment_table(&self) -> &'static str {
        match self {
            SubjectKind::Lead => "appointments",
            SubjectKind::Borrower => "borrower_appointments",
        }
    }

    pub fn junction_table(&self) -> &'static str {
        match self {
            SubjectKind::Lead => "appointment_timeslots",
            SubjectKind::Borrower => "borrower_appointment_timeslots",
        }
    }

    /// Foreign-key column on the appointment table.
    pub fn fk_column(&self) -> &'static str {
        match self {
            SubjectKind::Lead => "lead_id",
            SubjectKind::Borrower => "borrower_id",
        }
    }

    pub fn entity_type(&self) -> &'static str {
        match self {
            SubjectKind::Lead => "lead",
            SubjectKind::Borrower => "borrower",
        }
    }

    pub fn appointment_entity_type(&self) -> &'static str {
        match self {
            SubjectKind::Lead => "appointment",
            SubjectKind::Borrower => "borrower_appointment",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SubjectKind::Lead => "Lead",
            SubjectKind::Borrower => "Borrower",
        }
    }
}

impl FromStr for SubjectKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lead" | "leads" => Ok(SubjectKind::Lead),
            "borrower" | "borrowers" => Ok(SubjectKind::Borrower),
            other => Err(AppError::Validation(format!("Unknown subject kind '{}'", other))),
        }
    }
}

/// A lead or borrower reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub kind: SubjectKind,
    pub id: Uuid,
}

impl Subject {
    pub fn lead(id: Uuid) -> Self {
        Self {
            kind: SubjectKind::Lead,
            id,
        }
    }

    pub fn borrower(id: Uuid) -> Self {
        Self {
            kind: SubjectKind::Borrower,
            id,
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.entity_type(), self.id)
    }
}

// ============ Database Models ============

pub(crate) const LEAD_COLUMNS: &str = "id, full_name, phone, email, source, status, assigned_to, \
                                       follow_up_date, is_deleted, created_at, updated_at";

pub(crate) const BORROWER_COLUMNS: &str = "id, lead_id, full_name, phone, email, source, status, \
                                           assigned_to, follow_up_date, loan_amount, is_deleted, \
                                           created_at, updated_at";

/// A prospective borrower captured from an acquisition channel.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub full_name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub source: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: LeadStatus,
    pub assigned_to: Option<Uuid>,
    pub follow_up_date: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A lead that progressed to an active loan relationship.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Borrower {
    pub id: Uuid,
    pub lead_id: Option<Uuid>,
    pub full_name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub source: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: LeadStatus,
    pub assigned_to: Option<Uuid>,
    pub follow_up_date: Option<DateTime<Utc>>,
    pub loan_amount: Option<BigDecimal>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Weekly template used to generate timeslots.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CalendarSetting {
    pub id: Uuid,
    pub name: String,
    /// 0 = Monday ... 6 = Sunday.
    pub weekday: i16,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub slot_duration_minutes: i32,
    pub max_capacity: i32,
    pub is_active: bool,
}

/// A bookable calendar interval with a capacity limit.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
pub struct Timeslot {
    pub id: Uuid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub max_capacity: i32,
    pub occupied_count: i32,
    pub calendar_setting_id: Option<Uuid>,
    pub is_disabled: bool,
}

/// Lead-facing or borrower-facing appointment. `subject_id` is the lead or
/// borrower id depending on which table the row came from.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Uuid,
    pub subject_id: Uuid,
    pub agent_id: Uuid,
    #[sqlx(try_from = "String")]
    pub status: AppointmentStatus,
    pub start_datetime: DateTime<Utc>,
    pub end_datetime: DateTime<Utc>,
    pub loan_status: Option<String>,
    pub notes: Option<String>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An agent marked available for lead assignment on a given day.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CheckedInAgent {
    pub id: i64,
    pub agent_id: Uuid,
    pub check_in_date: NaiveDate,
    pub lead_capacity: i32,
    pub weight: i32,
    pub current_lead_count: i32,
    pub is_active: bool,
}

/// Process-wide singleton row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AutoAssignmentSettings {
    pub is_enabled: bool,
    #[sqlx(try_from = "String")]
    pub assignment_method: AssignmentMethod,
    pub current_round_robin_index: i32,
    pub last_assigned_agent_id: Option<Uuid>,
    pub max_leads_per_agent_per_day: i32,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit row for each assignment decision.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LeadAssignmentHistory {
    pub id: i64,
    pub lead_id: Uuid,
    pub agent_id: Uuid,
    pub assigned_by: Option<String>,
    #[sqlx(try_from = "String")]
    pub method: HistoryMethod,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Local mirror of a dialer campaign.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Playbook {
    pub id: Uuid,
    pub name: String,
    pub external_id: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: PlaybookStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PlaybookContact {
    pub id: Uuid,
    pub playbook_id: Uuid,
    pub lead_id: Option<Uuid>,
    pub name: String,
    pub phone: String,
    pub external_contact_id: Option<String>,
    #[sqlx(try_from = "String")]
    pub sync_status: ContactSyncStatus,
    pub error_message: Option<String>,
    pub synced_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_enums_round_trip_through_storage_text() {
        for status in LeadStatus::ALL {
            assert_eq!(status.as_str().parse::<LeadStatus>().unwrap(), *status);
            let json = serde_json::to_string(status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        for status in AppointmentStatus::ALL {
            assert_eq!(
                AppointmentStatus::try_from(status.as_str().to_string()).unwrap(),
                *status
            );
        }
    }

    #[test]
    fn test_unknown_status_is_validation_error() {
        let err = "pending_review".parse::<AppointmentStatus>().unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_active_and_capacity_flags() {
        assert!(AppointmentStatus::Upcoming.is_active());
        assert!(AppointmentStatus::Scheduled.is_active());
        assert!(!AppointmentStatus::Done.is_active());
        assert!(AppointmentStatus::Missed.holds_capacity());
        assert!(!AppointmentStatus::Cancelled.holds_capacity());
        assert!(LeadStatus::Blacklisted.is_terminal());
        assert!(!LeadStatus::FollowUp.is_terminal());
    }

    #[test]
    fn test_subject_kind_tables() {
        let subject = Subject::borrower(Uuid::nil());
        assert_eq!(subject.kind.appointment_table(), "borrower_appointments");
        assert_eq!(subject.kind.fk_column(), "borrower_id");
        assert_eq!("lead".parse::<SubjectKind>().unwrap(), SubjectKind::Lead);
        let parsed: SubjectKind = serde_json::from_str("\"borrower\"").unwrap();
        assert_eq!(parsed, SubjectKind::Borrower);
    }
}
