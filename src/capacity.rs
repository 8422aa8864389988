use chrono::NaiveDate;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::errors::{AppError, ResultExt};
use crate::models::Timeslot;

const TIMESLOT_COLUMNS: &str = "id, date, start_time, end_time, max_capacity, occupied_count, \
                                calendar_setting_id, is_disabled";

impl Timeslot {
    /// A slot is bookable while enabled and below capacity.
    pub fn is_available(&self) -> bool {
        !self.is_disabled && self.occupied_count < self.max_capacity
    }

    pub fn remaining(&self) -> i32 {
        (self.max_capacity - self.occupied_count).max(0)
    }

    /// Counter semantics of a reservation; capacity is checked separately.
    pub fn reserve(&mut self) {
        self.occupied_count += 1;
    }

    /// Counter semantics of a release, floored at zero.
    pub fn release(&mut self) {
        self.occupied_count = (self.occupied_count - 1).max(0);
    }

    /// Rejects disabled or full slots with a user-facing message.
    pub fn ensure_bookable(&self) -> Result<(), AppError> {
        if self.is_disabled {
            return Err(AppError::Conflict(format!(
                "Timeslot {} {} is disabled",
                self.date,
                self.start_time.format("%H:%M")
            )));
        }
        if self.occupied_count >= self.max_capacity {
            return Err(AppError::Conflict(format!(
                "Timeslot {} {} is fully booked ({}/{})",
                self.date,
                self.start_time.format("%H:%M"),
                self.occupied_count,
                self.max_capacity
            )));
        }
        Ok(())
    }
}

/// Rejects duplicate ids in a booking request.
pub fn ensure_distinct(timeslot_ids: &[Uuid]) -> Result<(), AppError> {
    let mut seen = std::collections::HashSet::with_capacity(timeslot_ids.len());
    for id in timeslot_ids {
        if !seen.insert(id) {
            return Err(AppError::Validation(format!(
                "Timeslot {} listed more than once",
                id
            )));
        }
    }
    Ok(())
}

/// Authoritative occupancy counters for timeslots.
///
/// The transactional helpers take a `PgConnection` so that callers can run
/// lock, check and reserve inside one transaction; rows are locked in id
/// order to keep concurrent bookings from deadlocking each other.
pub struct TimeslotStore {
    pool: PgPool,
}

impl TimeslotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: Uuid) -> Result<Timeslot, AppError> {
        sqlx::query_as::<_, Timeslot>(&format!(
            "SELECT {} FROM timeslots WHERE id = $1",
            TIMESLOT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Timeslot {} not found", id)))
    }

    /// Enabled slots on `date` with room left, earliest first.
    pub async fn list_available(&self, date: NaiveDate) -> Result<Vec<Timeslot>, AppError> {
        let slots = sqlx::query_as::<_, Timeslot>(&format!(
            "SELECT {} FROM timeslots
             WHERE date = $1 AND is_disabled = false AND occupied_count < max_capacity
             ORDER BY start_time ASC",
            TIMESLOT_COLUMNS
        ))
        .bind(date)
        .fetch_all(&self.pool)
        .await
        .context("list available timeslots")?;

        tracing::debug!("{} available timeslots on {}", slots.len(), date);
        Ok(slots)
    }

    pub async fn set_disabled(&self, id: Uuid, is_disabled: bool) -> Result<Timeslot, AppError> {
        let slot = sqlx::query_as::<_, Timeslot>(&format!(
            "UPDATE timeslots SET is_disabled = $2 WHERE id = $1 RETURNING {}",
            TIMESLOT_COLUMNS
        ))
        .bind(id)
        .bind(is_disabled)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Timeslot {} not found", id)))?;

        tracing::info!("Timeslot {} disabled={}", id, is_disabled);
        Ok(slot)
    }

    /// Locks the given slots (`FOR UPDATE`, id order) and returns them in the
    /// order requested. Missing ids are `NotFound`.
    pub async fn lock(conn: &mut PgConnection, ids: &[Uuid]) -> Result<Vec<Timeslot>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let locked = sqlx::query_as::<_, Timeslot>(&format!(
            "SELECT {} FROM timeslots WHERE id = ANY($1) ORDER BY id FOR UPDATE",
            TIMESLOT_COLUMNS
        ))
        .bind(ids)
        .fetch_all(&mut *conn)
        .await
        .context("lock timeslots")?;

        ids.iter()
            .map(|id| {
                locked
                    .iter()
                    .find(|slot| slot.id == *id)
                    .cloned()
                    .ok_or_else(|| AppError::NotFound(format!("Timeslot {} not found", id)))
            })
            .collect()
    }

    /// Locks the slots and checks each one has room, without reserving.
    pub async fn lock_bookable(
        conn: &mut PgConnection,
        ids: &[Uuid],
    ) -> Result<Vec<Timeslot>, AppError> {
        let slots = Self::lock(conn, ids).await?;
        for slot in &slots {
            slot.ensure_bookable()?;
        }
        Ok(slots)
    }

    /// Increments `occupied_count`. Capacity must already have been checked
    /// under the row lock taken by `lock_bookable`.
    pub async fn reserve(conn: &mut PgConnection, id: Uuid) -> Result<(), AppError> {
        let result =
            sqlx::query("UPDATE timeslots SET occupied_count = occupied_count + 1 WHERE id = $1")
                .bind(id)
                .execute(&mut *conn)
                .await
                .context("reserve timeslot")?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Timeslot {} not found", id)));
        }
        tracing::debug!("Reserved timeslot {}", id);
        Ok(())
    }

    /// Decrements `occupied_count`, floored at zero. Releasing an empty or
    /// missing slot is a no-op.
    pub async fn release(conn: &mut PgConnection, id: Uuid) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE timeslots SET occupied_count = GREATEST(occupied_count - 1, 0) WHERE id = $1",
        )
        .bind(id)
        .execute(&mut *conn)
        .await
        .context("release timeslot")?;

        if result.rows_affected() == 0 {
            tracing::warn!("Release of unknown timeslot {} ignored", id);
        } else {
            tracing::debug!("Released timeslot {}", id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn slot(max_capacity: i32, occupied_count: i32) -> Timeslot {
        Timeslot {
            id: Uuid::new_v4(),
            date: NaiveDate::from_ymd_opt(2026, 10, 20).unwrap(),
            start_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(10, 30, 0).unwrap(),
            max_capacity,
            occupied_count,
            calendar_setting_id: None,
            is_disabled: false,
        }
    }

    #[test]
    fn test_release_on_empty_slot_stays_at_zero() {
        let mut s = slot(2, 0);
        s.release();
        s.release();
        assert_eq!(s.occupied_count, 0);
    }

    #[test]
    fn test_third_booking_rejected_on_capacity_two() {
        let mut s = slot(2, 0);

        s.ensure_bookable().unwrap();
        s.reserve();
        s.ensure_bookable().unwrap();
        s.reserve();

        let err = s.ensure_bookable().unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(s.occupied_count, 2);
        assert_eq!(s.remaining(), 0);
    }

    #[test]
    fn test_disabled_slot_not_bookable() {
        let mut s = slot(5, 0);
        s.is_disabled = true;
        assert!(!s.is_available());
        assert!(s.ensure_bookable().is_err());
    }

    #[test]
    fn test_ensure_distinct() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(ensure_distinct(&[a, b]).is_ok());
        assert!(matches!(
            ensure_distinct(&[a, b, a]),
            Err(AppError::Validation(_))
        ));
    }
}
