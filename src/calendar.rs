use chrono::{Datelike, Duration, NaiveDate, NaiveTime};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::{AppError, ResultExt};
use crate::models::CalendarSetting;

/// Longest range a single generation call may cover.
pub const MAX_GENERATION_DAYS: i64 = 90;

/// A slot that a calendar setting says should exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedSlot {
    pub calendar_setting_id: Uuid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub max_capacity: i32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationSummary {
    pub planned: usize,
    pub created: usize,
    pub skipped_existing: usize,
}

/// Expands one setting into consecutive slots for every matching weekday in
/// `[from, to]`. A trailing interval shorter than the slot length is dropped.
pub fn plan_slots(setting: &CalendarSetting, from: NaiveDate, to: NaiveDate) -> Vec<PlannedSlot> {
    if !setting.is_active || setting.slot_duration_minutes <= 0 || from > to {
        return Vec::new();
    }

    let step = Duration::minutes(setting.slot_duration_minutes as i64);
    let mut planned = Vec::new();

    for date in from.iter_days().take_while(|d| *d <= to) {
        if date.weekday().num_days_from_monday() as i16 != setting.weekday {
            continue;
        }

        let mut start = setting.start_time;
        loop {
            let (end, wrapped) = start.overflowing_add_signed(step);
            if wrapped != 0 || end > setting.end_time {
                break;
            }
            planned.push(PlannedSlot {
                calendar_setting_id: setting.id,
                date,
                start_time: start,
                end_time: end,
                max_capacity: setting.max_capacity,
            });
            start = end;
        }
    }

    planned
}

/// Generates timeslots from the active calendar settings.
pub struct TimeslotGenerator {
    pool: PgPool,
}

impl TimeslotGenerator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn active_settings(&self) -> Result<Vec<CalendarSetting>, AppError> {
        let settings = sqlx::query_as::<_, CalendarSetting>(
            "SELECT id, name, weekday, start_time, end_time, slot_duration_minutes, max_capacity, is_active
             FROM calendar_settings WHERE is_active = true ORDER BY weekday, start_time",
        )
        .fetch_all(&self.pool)
        .await
        .context("load calendar settings")?;

        Ok(settings)
    }

    /// Creates missing slots for `[from, to]`. Re-running over the same range
    /// creates nothing new.
    #[tracing::instrument(skip(self))]
    pub async fn generate(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<GenerationSummary, AppError> {
        if from > to {
            return Err(AppError::Validation(format!(
                "Invalid range: {} is after {}",
                from, to
            )));
        }
        if (to - from).num_days() >= MAX_GENERATION_DAYS {
            return Err(AppError::Validation(format!(
                "Range too large: at most {} days per run",
                MAX_GENERATION_DAYS
            )));
        }

        let settings = self.active_settings().await?;
        let mut summary = GenerationSummary::default();

        let mut tx = self.pool.begin().await?;
        for setting in &settings {
            for slot in plan_slots(setting, from, to) {
                summary.planned += 1;
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO timeslots (date, start_time, end_time, max_capacity, calendar_setting_id)
                    SELECT $1, $2, $3, $4, $5
                    WHERE NOT EXISTS (
                        SELECT 1 FROM timeslots
                        WHERE date = $1 AND start_time = $2 AND calendar_setting_id = $5
                    )
                    "#,
                )
                .bind(slot.date)
                .bind(slot.start_time)
                .bind(slot.end_time)
                .bind(slot.max_capacity)
                .bind(slot.calendar_setting_id)
                .execute(&mut *tx)
                .await
                .context("insert generated timeslot")?;

                if inserted.rows_affected() > 0 {
                    summary.created += 1;
                } else {
                    summary.skipped_existing += 1;
                }
            }
        }
        tx.commit().await?;

        tracing::info!(
            "Timeslot generation {}..{}: {} planned, {} created, {} existing",
            from,
            to,
            summary.planned,
            summary.created,
            summary.skipped_existing
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setting(weekday: i16, start: (u32, u32), end: (u32, u32), minutes: i32) -> CalendarSetting {
        CalendarSetting {
            id: Uuid::new_v4(),
            name: "Branch".to_string(),
            weekday,
            start_time: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
            slot_duration_minutes: minutes,
            max_capacity: 3,
            is_active: true,
        }
    }

    #[test]
    fn test_plans_only_matching_weekdays() {
        // 2026-10-19 is a Monday.
        let monday = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let next_sunday = NaiveDate::from_ymd_opt(2026, 11, 1).unwrap();
        let s = setting(0, (9, 0), (11, 0), 30);

        let planned = plan_slots(&s, monday, next_sunday);
        assert_eq!(planned.len(), 8);
        assert!(planned
            .iter()
            .all(|p| p.date.weekday() == chrono::Weekday::Mon));
        assert_eq!(planned[0].start_time, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(planned[3].end_time, NaiveTime::from_hms_opt(11, 0, 0).unwrap());
    }

    #[test]
    fn test_partial_trailing_slot_dropped() {
        let monday = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let s = setting(0, (9, 0), (10, 45), 30);
        let planned = plan_slots(&s, monday, monday);
        assert_eq!(planned.len(), 3);
        assert_eq!(
            planned.last().unwrap().end_time,
            NaiveTime::from_hms_opt(10, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_inactive_or_empty_setting_plans_nothing() {
        let monday = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let mut s = setting(0, (9, 0), (10, 0), 30);
        s.is_active = false;
        assert!(plan_slots(&s, monday, monday).is_empty());

        let s = setting(0, (10, 0), (9, 0), 30);
        assert!(plan_slots(&s, monday, monday).is_empty());
    }

    #[test]
    fn test_slots_do_not_wrap_past_midnight() {
        let monday = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let s = setting(0, (23, 0), (23, 59), 45);
        let planned = plan_slots(&s, monday, monday);
        assert_eq!(planned.len(), 1);
    }
}
