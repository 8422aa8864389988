use chrono::{Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use bigdecimal::BigDecimal;
use sqlx::PgPool;
use std::env;
use std::str::FromStr;
use uuid::Uuid;

use loan_crm::assignment_storage::{AutoAssigner, CheckIn, SettingsUpdate};
use loan_crm::capacity::TimeslotStore;
use loan_crm::config::Config;
use loan_crm::db::Database;
use loan_crm::errors::AppError;
use loan_crm::models::{AppointmentStatus, AssignmentMethod, LeadStatus, Subject, SubjectKind};
use loan_crm::scheduler::{AppointmentPatch, AppointmentScheduler, NewAppointment};
use loan_crm::status_rules::TransitionPolicy;
use loan_crm::status_service::StatusService;

// These tests write to a real database. They are ignored by default;
// set TEST_DATABASE_URL to a disposable Postgres instance to run them.

// The auto-assignment settings are a single shared row.
static SETTINGS_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

async fn pool() -> anyhow::Result<PgPool> {
    let db_url = env::var("TEST_DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("Set TEST_DATABASE_URL to run this test"))?;

    let db = Database::new(&db_url).await?;
    db.migrate().await?;
    Ok(db.pool)
}

async fn insert_user(pool: &PgPool, name: &str) -> anyhow::Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO users (id, name) VALUES ($1, $2)")
        .bind(id)
        .bind(name)
        .execute(pool)
        .await?;
    Ok(id)
}

async fn insert_lead(pool: &PgPool, name: &str) -> anyhow::Result<Uuid> {
    let id = sqlx::query_scalar::<_, Uuid>(
        "INSERT INTO leads (full_name, phone) VALUES ($1, '0123456789') RETURNING id",
    )
    .bind(name)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// A far-future date no other run shares, so check-ins and slots stay isolated.
fn isolated_date() -> NaiveDate {
    let offset = (Uuid::new_v4().as_u128() % 20_000) as i64;
    NaiveDate::from_ymd_opt(2200, 1, 1).unwrap() + Duration::days(offset)
}

async fn insert_timeslot(pool: &PgPool, date: NaiveDate, max_capacity: i32) -> anyhow::Result<Uuid> {
    let id = sqlx::query_scalar::<_, Uuid>(
        "INSERT INTO timeslots (date, start_time, end_time, max_capacity) VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(date)
    .bind(NaiveTime::from_hms_opt(10, 0, 0).unwrap())
    .bind(NaiveTime::from_hms_opt(10, 30, 0).unwrap())
    .bind(max_capacity)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

fn booking(subject: Subject, agent_id: Uuid, date: NaiveDate, slot: Uuid) -> NewAppointment {
    let start = Utc.from_utc_datetime(&date.and_hms_opt(2, 0, 0).unwrap());
    NewAppointment {
        subject,
        agent_id,
        start_datetime: start,
        end_datetime: start + Duration::minutes(30),
        timeslot_ids: vec![slot],
        loan_status: None,
        notes: None,
    }
}

#[tokio::test]
#[ignore]
async fn capacity_two_slot_accepts_two_bookings() -> anyhow::Result<()> {
    let pool = pool().await?;
    let scheduler = AppointmentScheduler::new(pool.clone());
    let store = TimeslotStore::new(pool.clone());

    let agent = insert_user(&pool, "Agent Booking").await?;
    let date = isolated_date();
    let slot = insert_timeslot(&pool, date, 2).await?;

    let first = insert_lead(&pool, "First Lead").await?;
    let second = insert_lead(&pool, "Second Lead").await?;
    let third = insert_lead(&pool, "Third Lead").await?;

    let booked = scheduler
        .create("tester", booking(Subject::lead(first), agent, date, slot))
        .await?;
    scheduler
        .create("tester", booking(Subject::lead(second), agent, date, slot))
        .await?;
    assert_eq!(store.get(slot).await?.occupied_count, 2);

    let full = scheduler
        .create("tester", booking(Subject::lead(third), agent, date, slot))
        .await;
    assert!(matches!(full, Err(AppError::Conflict(_))));
    assert_eq!(store.get(slot).await?.occupied_count, 2);

    // Cancelling frees the seat for the third lead.
    scheduler
        .update_status(
            "tester",
            SubjectKind::Lead,
            booked.appointment.id,
            AppointmentStatus::Cancelled,
            None,
        )
        .await?;
    assert_eq!(store.get(slot).await?.occupied_count, 1);

    scheduler
        .create("tester", booking(Subject::lead(third), agent, date, slot))
        .await?;
    assert_eq!(store.get(slot).await?.occupied_count, 2);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn second_active_appointment_is_rejected() -> anyhow::Result<()> {
    let pool = pool().await?;
    let scheduler = AppointmentScheduler::new(pool.clone());
    let store = TimeslotStore::new(pool.clone());

    let agent = insert_user(&pool, "Agent Duplicate").await?;
    let date = isolated_date();
    let slot = insert_timeslot(&pool, date, 5).await?;
    let lead = insert_lead(&pool, "Duplicate Lead").await?;

    scheduler
        .create("tester", booking(Subject::lead(lead), agent, date, slot))
        .await?;
    let duplicate = scheduler
        .create("tester", booking(Subject::lead(lead), agent, date, slot))
        .await;

    assert!(matches!(duplicate, Err(AppError::Conflict(_))));
    assert_eq!(store.get(slot).await?.occupied_count, 1);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn round_robin_alternates_and_wraps() -> anyhow::Result<()> {
    let _settings = SETTINGS_LOCK.lock().await;
    let pool = pool().await?;
    let assigner = AutoAssigner::new(pool.clone());
    let today = isolated_date();

    assigner
        .update_settings(
            "tester",
            SettingsUpdate {
                is_enabled: Some(true),
                assignment_method: Some(AssignmentMethod::RoundRobin),
                max_leads_per_agent_per_day: None,
                reset_cursor: true,
            },
        )
        .await?;

    let first = insert_user(&pool, "Agent One").await?;
    let second = insert_user(&pool, "Agent Two").await?;
    for (agent_id, weight) in [(first, 3), (second, 1)] {
        assigner
            .check_in(
                today,
                CheckIn {
                    agent_id,
                    lead_capacity: Some(10),
                    weight: Some(weight),
                },
            )
            .await?;
    }

    let mut assigned = Vec::new();
    for i in 0..3 {
        let lead = insert_lead(&pool, &format!("Rotation Lead {}", i)).await?;
        let outcome = assigner.assign_single(today, lead, Some("tester")).await;
        assert!(outcome.success, "{}", outcome.message);
        assigned.push(outcome.agent_id);
    }

    // Weight plays no part in round-robin.
    assert_eq!(assigned, vec![Some(first), Some(second), Some(first)]);
    assert_eq!(assigner.settings().await?.current_round_robin_index, 1);

    let counts: Vec<i32> = assigner
        .checked_in_agents(today)
        .await?
        .iter()
        .map(|a| a.current_lead_count)
        .collect();
    assert_eq!(counts, vec![2, 1]);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn update_moves_reservation_to_new_slots() -> anyhow::Result<()> {
    let pool = pool().await?;
    let scheduler = AppointmentScheduler::new(pool.clone());
    let store = TimeslotStore::new(pool.clone());

    let agent = insert_user(&pool, "Agent Reschedule").await?;
    let date = isolated_date();
    let dropped = insert_timeslot(&pool, date, 1).await?;
    let kept = insert_timeslot(&pool, date, 1).await?;
    let added = insert_timeslot(&pool, date, 1).await?;
    let lead = insert_lead(&pool, "Reschedule Lead").await?;

    let mut new = booking(Subject::lead(lead), agent, date, dropped);
    new.timeslot_ids = vec![dropped, kept];
    let booked = scheduler.create("tester", new).await?;
    assert_eq!(store.get(dropped).await?.occupied_count, 1);
    assert_eq!(store.get(kept).await?.occupied_count, 1);

    // `kept` is full with capacity 1 and appears on both sides of the swap.
    let updated = scheduler
        .update(
            "tester",
            SubjectKind::Lead,
            booked.appointment.id,
            AppointmentPatch {
                timeslot_ids: Some(vec![kept, added]),
                ..Default::default()
            },
        )
        .await?;

    assert_eq!(updated.timeslot_ids, vec![kept, added]);
    assert_eq!(store.get(dropped).await?.occupied_count, 0);
    assert_eq!(store.get(kept).await?.occupied_count, 1);
    assert_eq!(store.get(added).await?.occupied_count, 1);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn update_into_full_slot_is_rejected() -> anyhow::Result<()> {
    let pool = pool().await?;
    let scheduler = AppointmentScheduler::new(pool.clone());
    let store = TimeslotStore::new(pool.clone());

    let agent = insert_user(&pool, "Agent Full Move").await?;
    let date = isolated_date();
    let open = insert_timeslot(&pool, date, 1).await?;
    let full = insert_timeslot(&pool, date, 1).await?;
    let mover = insert_lead(&pool, "Mover Lead").await?;
    let holder = insert_lead(&pool, "Holder Lead").await?;

    let booked = scheduler
        .create("tester", booking(Subject::lead(mover), agent, date, open))
        .await?;
    scheduler
        .create("tester", booking(Subject::lead(holder), agent, date, full))
        .await?;

    let moved = scheduler
        .update(
            "tester",
            SubjectKind::Lead,
            booked.appointment.id,
            AppointmentPatch {
                timeslot_ids: Some(vec![full]),
                ..Default::default()
            },
        )
        .await;

    assert!(matches!(moved, Err(AppError::Conflict(_))));
    // The failed transaction leaves both slots as they were.
    assert_eq!(store.get(open).await?.occupied_count, 1);
    assert_eq!(store.get(full).await?.occupied_count, 1);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn delete_releases_only_held_slots() -> anyhow::Result<()> {
    let pool = pool().await?;
    let scheduler = AppointmentScheduler::new(pool.clone());
    let store = TimeslotStore::new(pool.clone());

    let agent = insert_user(&pool, "Agent Delete").await?;
    let date = isolated_date();
    let slot = insert_timeslot(&pool, date, 2).await?;
    let cancelled_lead = insert_lead(&pool, "Cancelled Lead").await?;
    let active_lead = insert_lead(&pool, "Active Lead").await?;

    let cancelled = scheduler
        .create("tester", booking(Subject::lead(cancelled_lead), agent, date, slot))
        .await?;
    let active = scheduler
        .create("tester", booking(Subject::lead(active_lead), agent, date, slot))
        .await?;
    assert_eq!(store.get(slot).await?.occupied_count, 2);

    scheduler
        .update_status(
            "tester",
            SubjectKind::Lead,
            cancelled.appointment.id,
            AppointmentStatus::Cancelled,
            None,
        )
        .await?;
    assert_eq!(store.get(slot).await?.occupied_count, 1);

    // Its seat went back on cancel; deleting must not take the active one's.
    scheduler
        .delete("tester", SubjectKind::Lead, cancelled.appointment.id)
        .await?;
    assert_eq!(store.get(slot).await?.occupied_count, 1);

    scheduler
        .delete("tester", SubjectKind::Lead, active.appointment.id)
        .await?;
    assert_eq!(store.get(slot).await?.occupied_count, 0);

    let gone = scheduler
        .delete("tester", SubjectKind::Lead, active.appointment.id)
        .await;
    assert!(matches!(gone, Err(AppError::NotFound(_))));
    Ok(())
}

#[tokio::test]
#[ignore]
async fn reactivating_into_full_slot_conflicts() -> anyhow::Result<()> {
    let pool = pool().await?;
    let scheduler = AppointmentScheduler::new(pool.clone());
    let store = TimeslotStore::new(pool.clone());

    let agent = insert_user(&pool, "Agent Reactivate").await?;
    let date = isolated_date();
    let slot = insert_timeslot(&pool, date, 1).await?;
    let first = insert_lead(&pool, "Returning Lead").await?;
    let second = insert_lead(&pool, "Replacement Lead").await?;

    let booked = scheduler
        .create("tester", booking(Subject::lead(first), agent, date, slot))
        .await?;
    scheduler
        .update_status(
            "tester",
            SubjectKind::Lead,
            booked.appointment.id,
            AppointmentStatus::Cancelled,
            None,
        )
        .await?;
    scheduler
        .create("tester", booking(Subject::lead(second), agent, date, slot))
        .await?;

    let reactivated = scheduler
        .update_status(
            "tester",
            SubjectKind::Lead,
            booked.appointment.id,
            AppointmentStatus::Upcoming,
            None,
        )
        .await;

    assert!(matches!(reactivated, Err(AppError::Conflict(_))));
    assert_eq!(store.get(slot).await?.occupied_count, 1);

    let status = sqlx::query_scalar::<_, String>("SELECT status FROM appointments WHERE id = $1")
        .bind(booked.appointment.id)
        .fetch_one(&pool)
        .await?;
    assert_eq!(status, "cancelled");
    Ok(())
}

async fn lead_assignment(pool: &PgPool, lead_id: Uuid) -> anyhow::Result<(String, Option<Uuid>)> {
    let row = sqlx::query_as::<_, (String, Option<Uuid>)>(
        "SELECT status, assigned_to FROM leads WHERE id = $1",
    )
    .bind(lead_id)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

#[tokio::test]
#[ignore]
async fn assignment_stops_at_capacity_and_when_disabled() -> anyhow::Result<()> {
    let _settings = SETTINGS_LOCK.lock().await;
    let pool = pool().await?;
    let assigner = AutoAssigner::new(pool.clone());
    let today = isolated_date();

    assigner
        .update_settings(
            "tester",
            SettingsUpdate {
                is_enabled: Some(true),
                assignment_method: Some(AssignmentMethod::RoundRobin),
                max_leads_per_agent_per_day: None,
                reset_cursor: true,
            },
        )
        .await?;

    let agent = insert_user(&pool, "Agent Ceiling").await?;
    assigner
        .check_in(
            today,
            CheckIn {
                agent_id: agent,
                lead_capacity: Some(1),
                weight: None,
            },
        )
        .await?;

    let filled = insert_lead(&pool, "Ceiling Lead").await?;
    let outcome = assigner.assign_single(today, filled, Some("tester")).await;
    assert!(outcome.success, "{}", outcome.message);
    assert_eq!(outcome.agent_id, Some(agent));

    let cursor = assigner.settings().await?.current_round_robin_index;

    let overflow = insert_lead(&pool, "Overflow Lead").await?;
    let outcome = assigner.assign_single(today, overflow, Some("tester")).await;
    assert!(!outcome.success);
    assert_eq!(lead_assignment(&pool, overflow).await?, ("new".to_string(), None));
    assert_eq!(assigner.settings().await?.current_round_robin_index, cursor);

    assigner
        .update_settings(
            "tester",
            SettingsUpdate {
                is_enabled: Some(false),
                assignment_method: None,
                max_leads_per_agent_per_day: None,
                reset_cursor: false,
            },
        )
        .await?;

    let idle = insert_lead(&pool, "Idle Lead").await?;
    let outcome = assigner.assign_single(today, idle, Some("tester")).await;
    assert!(!outcome.success);
    assert_eq!(outcome.message, "Auto-assignment is not enabled");
    assert_eq!(lead_assignment(&pool, idle).await?, ("new".to_string(), None));
    assert_eq!(assigner.settings().await?.current_round_robin_index, cursor);

    let loads: Vec<i32> = assigner
        .checked_in_agents(today)
        .await?
        .iter()
        .map(|a| a.current_lead_count)
        .collect();
    assert_eq!(loads, vec![1]);
    Ok(())
}

fn status_config(database_url: &str) -> Config {
    Config {
        database_url: database_url.to_string(),
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

#[tokio::test]
#[ignore]
async fn subject_rows_read_back_and_follow_up_needs_a_date() -> anyhow::Result<()> {
    let pool = pool().await?;
    let config = status_config(&env::var("TEST_DATABASE_URL")?);
    let service = StatusService::new(pool.clone(), &config);

    let lead_id = insert_lead(&pool, "Readable Lead").await?;
    let lead = service.get_lead(lead_id).await?;
    assert_eq!(lead.full_name, "Readable Lead");
    assert_eq!(lead.status, LeadStatus::New);
    assert_eq!(lead.assigned_to, None);

    let borrower_id = sqlx::query_scalar::<_, Uuid>(
        "INSERT INTO borrowers (lead_id, full_name, loan_amount) VALUES ($1, 'Readable Borrower', 12345.67) RETURNING id",
    )
    .bind(lead_id)
    .fetch_one(&pool)
    .await?;
    let borrower = service.get_borrower(borrower_id).await?;
    assert_eq!(borrower.lead_id, Some(lead_id));
    assert_eq!(borrower.loan_amount, Some(BigDecimal::from_str("12345.67")?));

    let direct = service
        .set_status("tester", Subject::lead(lead_id), LeadStatus::FollowUp)
        .await;
    assert!(matches!(direct, Err(AppError::Validation(_))));
    assert_eq!(lead_assignment(&pool, lead_id).await?, ("new".to_string(), None));

    sqlx::query("UPDATE leads SET is_deleted = true WHERE id = $1")
        .bind(lead_id)
        .execute(&pool)
        .await?;
    assert!(matches!(
        service.get_lead(lead_id).await,
        Err(AppError::NotFound(_))
    ));
    Ok(())
}
