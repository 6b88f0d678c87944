use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

use relayd_core::CommandAction;
use relayd_storage::{
    AuditLog, CommandLogEntry, CommandResult, DeviceDirectory, DeviceRecord, NewSchedule,
    RedbStore, RunLedger, RunOutcome, RunStatus, ScheduleStore, StorageError,
};

fn planned() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 9, 12, 0, 0).unwrap()
}

fn new_schedule(device_id: &str, next_run_at: DateTime<Utc>) -> NewSchedule {
    NewSchedule {
        device_id: device_id.to_string(),
        action: CommandAction::On,
        cron_expr: "0 8 * * *".to_string(),
        timezone: "America/New_York".to_string(),
        enabled: true,
        next_run_at,
        start_at: None,
        end_at: None,
        window_start_minute: Some(1080),
        window_end_minute: Some(1380),
        enforce_every_minute: Some(10),
    }
}

fn open(dir: &TempDir) -> RedbStore {
    RedbStore::open(dir.path().join("data").join("relayd.redb")).unwrap()
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let (schedule_id, second_id) = {
        let store = open(&dir);
        let first = store
            .insert_schedule(new_schedule("plug", planned()))
            .await
            .unwrap();
        let second = store
            .insert_schedule(new_schedule("lamp", planned()))
            .await
            .unwrap();
        assert!(store.claim_slot(first.id, planned()).await.unwrap());
        store
            .upsert_device(DeviceRecord::new("plug", "POWER2").with_name("Desk"))
            .await
            .unwrap();
        (first.id, second.id)
    };
    assert_ne!(schedule_id, second_id);

    let store = open(&dir);
    let schedules = store.list_schedules().await.unwrap();
    assert_eq!(schedules.len(), 2);
    assert_eq!(schedules[0].window_start_minute, Some(1080));
    assert!(!store.claim_slot(schedule_id, planned()).await.unwrap());
    assert_eq!(store.command_channel("plug").await.unwrap(), "POWER2");
    assert_eq!(
        store.get_device("plug").await.unwrap().unwrap().name.as_deref(),
        Some("Desk")
    );

    // Ids keep increasing after reopen.
    let third = store
        .insert_schedule(new_schedule("fan", planned()))
        .await
        .unwrap();
    assert!(third.id > second_id);
}

#[tokio::test]
async fn test_concurrent_claims_grant_one_slot() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open(&dir));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.claim_slot(42, planned()).await.unwrap()
        }));
    }
    let mut granted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            granted += 1;
        }
    }
    assert_eq!(granted, 1);
    assert_eq!(store.list_runs(42, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_run_outcome_and_listing_order() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let first = planned();
    let second = first + Duration::days(1);

    store.claim_slot(1, first).await.unwrap();
    store.claim_slot(1, second).await.unwrap();
    store.claim_slot(2, first).await.unwrap();

    store
        .complete_run(1, first, RunOutcome::success("sch-1-a", first))
        .await
        .unwrap();
    store
        .complete_run(1, second, RunOutcome::failed("sch-1-b", second, "broker down"))
        .await
        .unwrap();

    let runs = store.list_runs(1, 10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].planned_at, second);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[0].error_message.as_deref(), Some("broker down"));
    assert_eq!(runs[1].status, RunStatus::Success);
    assert_eq!(runs[1].request_id.as_deref(), Some("sch-1-a"));

    assert_eq!(store.list_runs(1, 1).await.unwrap().len(), 1);
    assert_eq!(store.list_runs(2, 10).await.unwrap()[0].status, RunStatus::Skipped);

    let err = store
        .complete_run(3, first, RunOutcome::success("x", first))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
}

#[tokio::test]
async fn test_conditional_cursor_and_due_selection() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let now = planned();

    let schedule = store
        .insert_schedule(new_schedule("plug", now - Duration::minutes(1)))
        .await
        .unwrap();
    let mut disabled = store
        .insert_schedule(new_schedule("lamp", now - Duration::minutes(2)))
        .await
        .unwrap();
    disabled.enabled = false;
    store.update_schedule(&disabled).await.unwrap();

    let due = store.due_schedules(now, 50).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, schedule.id);

    let slot = schedule.next_run_at;
    let next = now + Duration::days(1);
    assert!(store
        .advance_cursor(schedule.id, slot, next, Some(now))
        .await
        .unwrap());
    assert!(!store
        .advance_cursor(schedule.id, slot, slot + Duration::minutes(1), None)
        .await
        .unwrap());

    let stored = store.get_schedule(schedule.id).await.unwrap().unwrap();
    assert_eq!(stored.next_run_at, next);
    assert_eq!(stored.last_run_at, Some(now));
    assert!(store.due_schedules(now, 50).await.unwrap().is_empty());

    assert!(store.delete_schedule(schedule.id).await.unwrap());
    assert!(!store.delete_schedule(schedule.id).await.unwrap());
    assert!(matches!(
        store.update_schedule(&stored).await,
        Err(StorageError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_audit_log_upsert_and_filter() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let t0 = planned();

    store
        .record_command(
            CommandLogEntry::new("req-1", "plug", CommandAction::On, CommandResult::Failed, t0)
                .with_error("timeout"),
        )
        .await
        .unwrap();
    store
        .record_command(CommandLogEntry::new(
            "req-2",
            "lamp",
            CommandAction::Off,
            CommandResult::Published,
            t0 + Duration::seconds(5),
        ))
        .await
        .unwrap();
    store
        .record_command(CommandLogEntry::new(
            "req-1",
            "plug",
            CommandAction::On,
            CommandResult::Published,
            t0 + Duration::seconds(10),
        ))
        .await
        .unwrap();

    let all = store.recent_commands(None, 10).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].request_id, "req-2");

    let plug = store.recent_commands(Some("plug"), 10).await.unwrap();
    assert_eq!(plug.len(), 1);
    assert_eq!(plug[0].result, CommandResult::Published);
    assert_eq!(plug[0].error_message, None);
    assert_eq!(plug[0].issued_at, t0);
    assert_eq!(plug[0].updated_at, t0 + Duration::seconds(10));
}
