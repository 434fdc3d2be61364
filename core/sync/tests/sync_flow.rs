//! End-to-end sync runs against in-memory and SQLite stores.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use fitsync_common::{
    Client, ClientMeasurement, EntityFields, Record, RecordId, SyncStatus, Table,
};
use fitsync_storage::{
    create_local, delete_local, update_local, KeyValueStore, MemoryKvStore, MemoryStore, NewRecord, SqliteStore,
};
use fitsync_sync::client::CURSOR_PARAM;
use fitsync_sync::cursor::CURSOR_KEY;
use fitsync_sync::transport::{Method, MockReply};
use fitsync_sync::{
    MockTransport, RemoteResponse, SkipReason, SyncConfig, SyncCoordinator, SyncOutcome,
    SyncPhase, SyncState,
};

const PULL: &str = "sync/pull";
const PUSH: &str = "sync/push";

struct Harness {
    store: MemoryStore,
    transport: Arc<MockTransport>,
    kv: Arc<MemoryKvStore>,
    coordinator: Arc<SyncCoordinator>,
}

fn harness() -> Harness {
    let store = MemoryStore::new();
    let transport = Arc::new(MockTransport::new());
    let kv = Arc::new(MemoryKvStore::new());
    let config = SyncConfig::default().with_min_sync_interval(Duration::ZERO);
    let coordinator = Arc::new(SyncCoordinator::new(
        Arc::new(store.clone()),
        transport.clone(),
        kv.clone(),
        &config,
    ));
    Harness {
        store,
        transport,
        kv,
        coordinator,
    }
}

fn client_fields(email: &str) -> EntityFields {
    EntityFields::Clients(Client {
        trainer_id: Some("t1".into()),
        first_name: "Local".into(),
        email: Some(email.into()),
        ..Default::default()
    })
}

async fn seed_client(store: &MemoryStore, id: &str, email: &str, status: SyncStatus) -> Record {
    let mut record = NewRecord::remote(RecordId::from(id), client_fields(email)).into_record();
    record.sync_status = status;
    store.insert(record.clone()).await;
    record
}

fn pull_reply(changes: Value, timestamp: i64) -> RemoteResponse {
    RemoteResponse::ok(json!({ "changes": changes, "timestamp": timestamp }))
}

#[tokio::test]
async fn test_pushed_create_adopts_server_id_by_email() {
    let h = harness();
    seed_client(&h.store, "tmp1", "a@x.com", SyncStatus::Created).await;
    h.transport.respond_with(
        Method::Post,
        PUSH,
        RemoteResponse::ok(json!({
            "success": true,
            "changes": { "clients": { "created": [
                { "id": "srv42", "email": "a@x.com", "trainerId": "t1" }
            ] } }
        })),
    );

    let outcome = h.coordinator.sync().await;
    let report = outcome.report().expect("run should complete");
    assert_eq!(report.pushed, 1);
    assert_eq!(report.outbound.marked(), 1);

    let records = h.store.records(Table::Clients).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id.as_str(), "srv42");
    assert_eq!(records[0].sync_status, SyncStatus::Synced);
    assert_eq!(records[0].field("email"), Some(json!("a@x.com")));

    let pushes = h.transport.calls_to(Method::Post, PUSH);
    let body = pushes[0].body.as_ref().unwrap();
    assert_eq!(body["changes"]["clients"]["created"][0]["id"], json!("tmp1"));
}

#[tokio::test]
async fn test_inbound_create_merges_unsynced_local_record() {
    let h = harness();
    seed_client(&h.store, "tmp9", "b@x.com", SyncStatus::Created).await;
    h.transport.respond_with(
        Method::Get,
        PULL,
        pull_reply(
            json!({ "clients": { "created": [
                { "id": "c1", "email": "b@x.com", "firstName": "Server", "trainerId": "t1" }
            ] } }),
            1000,
        ),
    );

    let outcome = h.coordinator.sync().await;
    let report = outcome.report().expect("run should complete");
    assert_eq!(report.inbound.tables[0].reconciled, 1);

    let records = h.store.records(Table::Clients).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id.as_str(), "c1");
    assert_eq!(records[0].sync_status, SyncStatus::Synced);
    assert_eq!(records[0].field("first_name"), Some(json!("Server")));

    // The merged record is clean, so nothing is pushed.
    assert!(h.transport.calls_to(Method::Post, PUSH).is_empty());
}

#[tokio::test]
async fn test_repeated_inbound_delete_is_harmless() {
    let h = harness();
    seed_client(&h.store, "c3", "d@x.com", SyncStatus::Synced).await;
    h.transport.respond_with(
        Method::Get,
        PULL,
        pull_reply(json!({ "clients": { "deleted": ["c3"] } }), 2000),
    );

    let first = h.coordinator.sync().await;
    assert_eq!(first.report().unwrap().inbound.tables[0].deleted, 1);
    let second = h.coordinator.sync().await;
    let report = second.report().expect("second run should complete");
    assert_eq!(report.inbound.tables[0].deleted, 0);
    assert!(report.inbound.is_clean());
    assert!(h.store.records(Table::Clients).await.is_empty());
}

#[tokio::test]
async fn test_failed_apply_keeps_cursor_and_retry_recovers() {
    let h = harness();
    h.kv.set(CURSOR_KEY, "100").await.unwrap();
    h.store.set_unavailable(Table::WorkoutSessions, true);
    h.transport.respond_with(
        Method::Get,
        PULL,
        pull_reply(
            json!({
                "clients": { "created": [{ "id": "c1", "email": "b@x.com", "trainerId": "t1" }] },
                "workout_sessions": { "created": [
                    { "id": "w1", "title": "Legs", "clientId": "c1", "trainerId": "t1" }
                ] }
            }),
            200,
        ),
    );

    let outcome = h.coordinator.sync().await;
    assert!(matches!(
        outcome,
        SyncOutcome::Failed { phase: SyncPhase::Pull, .. }
    ));
    assert_eq!(h.kv.get(CURSOR_KEY).await.unwrap(), Some("100".to_string()));
    assert!(h.store.records(Table::Clients).await.is_empty());
    assert_eq!(h.coordinator.status().state, SyncState::Error);

    h.store.set_unavailable(Table::WorkoutSessions, false);
    let outcome = h.coordinator.sync().await;
    assert!(outcome.is_completed());
    assert_eq!(h.kv.get(CURSOR_KEY).await.unwrap(), Some("200".to_string()));
    assert_eq!(h.store.records(Table::Clients).await.len(), 1);
    assert_eq!(h.store.records(Table::WorkoutSessions).await.len(), 1);

    // Both pulls started from the old cursor.
    let pulls = h.transport.calls_to(Method::Get, PULL);
    assert_eq!(pulls.len(), 2);
    for pull in pulls {
        assert_eq!(pull.query, vec![(CURSOR_PARAM.to_string(), "100".to_string())]);
    }
    let status = h.coordinator.status();
    assert_eq!(status.state, SyncState::Idle);
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn test_failed_commit_keeps_cursor() {
    let h = harness();
    h.transport.respond_with(
        Method::Get,
        PULL,
        pull_reply(
            json!({ "clients": { "created": [{ "id": "c1", "email": "b@x.com" }] } }),
            300,
        ),
    );
    h.store.fail_next_commit();

    let outcome = h.coordinator.sync().await;
    assert!(matches!(
        outcome,
        SyncOutcome::Failed { phase: SyncPhase::Pull, .. }
    ));
    assert_eq!(h.kv.get(CURSOR_KEY).await.unwrap(), None);
    assert!(h.store.records(Table::Clients).await.is_empty());
}

#[tokio::test]
async fn test_nothing_dirty_means_no_push() {
    let h = harness();
    seed_client(&h.store, "c1", "a@x.com", SyncStatus::Synced).await;

    let outcome = h.coordinator.sync().await;
    assert_eq!(outcome.report().unwrap().pushed, 0);
    assert_eq!(h.transport.call_count(), 1);
    assert!(h.transport.calls_to(Method::Post, PUSH).is_empty());
}

#[tokio::test]
async fn test_trigger_during_run_is_dropped() {
    let h = harness();
    h.transport.set_latency(Some(Duration::from_millis(200)));

    let coordinator = h.coordinator.clone();
    let (first, second) = tokio::join!(coordinator.sync(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.coordinator.force_sync().await
    });

    assert!(first.is_completed());
    assert_eq!(second, SyncOutcome::Skipped(SkipReason::InProgress));
    assert_eq!(h.transport.call_count(), 1);
    assert!(!h.coordinator.is_running());
}

#[tokio::test]
async fn test_weight_is_pushed_in_kilograms() {
    let h = harness();
    create_local(
        &h.store,
        EntityFields::ClientMeasurements(ClientMeasurement {
            client_id: Some("c1".into()),
            trainer_id: Some("t1".into()),
            measurement_type: "weight".into(),
            value: 176.37,
            unit: "lbs".into(),
            measured_at: 1_700_000_000_000,
            notes: None,
        }),
    )
    .await
    .unwrap();
    h.transport
        .respond_with(Method::Post, PUSH, RemoteResponse::ok(json!({ "success": true })));

    assert!(h.coordinator.sync().await.is_completed());

    let pushes = h.transport.calls_to(Method::Post, PUSH);
    let body = pushes[0].body.as_ref().unwrap();
    let sent = &body["changes"]["client_measurements"]["created"][0];
    let kg = sent["weightKg"].as_f64().unwrap();
    assert!((kg - 80.0).abs() < 0.01, "weightKg was {}", kg);
    assert_eq!(sent["bodyFatPercentage"], Value::Null);
    assert!(h
        .store
        .records(Table::ClientMeasurements)
        .await
        .iter()
        .all(|r| r.sync_status == SyncStatus::Synced));
}

#[tokio::test]
async fn test_network_failure_is_recoverable() {
    let h = harness();
    let record = create_local(&h.store, client_fields("n@x.com")).await.unwrap();
    h.transport.enqueue(
        Method::Get,
        PULL,
        MockReply::NetworkError("connection reset".into()),
    );

    let outcome = h.coordinator.sync().await;
    match outcome {
        SyncOutcome::Failed { phase, message } => {
            assert_eq!(phase, SyncPhase::Pull);
            assert!(message.contains("connection reset"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(h.transport.calls_to(Method::Post, PUSH).is_empty());

    h.transport
        .respond_with(Method::Post, PUSH, RemoteResponse::ok(json!({ "success": true })));
    assert!(h.coordinator.sync().await.is_completed());
    let record = h.store.get(Table::Clients, &record.id).await.unwrap();
    assert_eq!(record.sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn test_edits_after_sync_are_pushed_as_updates() {
    let h = harness();
    h.transport
        .respond_with(Method::Post, PUSH, RemoteResponse::ok(json!({ "success": true })));
    let record = create_local(&h.store, client_fields("u@x.com")).await.unwrap();
    assert!(h.coordinator.sync().await.is_completed());

    update_local(&h.store, &record.id, client_fields("u2@x.com"))
        .await
        .unwrap();
    assert!(h.coordinator.sync().await.is_completed());

    let pushes = h.transport.calls_to(Method::Post, PUSH);
    assert_eq!(pushes.len(), 2);
    let second = pushes[1].body.as_ref().unwrap();
    assert_eq!(second["changes"]["clients"]["updated"][0]["email"], json!("u2@x.com"));
    assert!(second["changes"]["clients"].get("created").map_or(true, |c| c
        .as_array()
        .map_or(true, Vec::is_empty)));
}

#[tokio::test]
async fn test_pushed_delete_is_purged_and_not_resent() {
    let h = harness();
    h.transport
        .respond_with(Method::Post, PUSH, RemoteResponse::ok(json!({ "success": true })));
    seed_client(&h.store, "c1", "d@x.com", SyncStatus::Synced).await;
    delete_local(&h.store, Table::Clients, &RecordId::from("c1"))
        .await
        .unwrap();

    let report = h.coordinator.sync().await.report().cloned().unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(report.outbound.tables[0].purged, 1);
    assert!(h.store.records(Table::Clients).await.is_empty());

    assert!(h.coordinator.sync().await.is_completed());
    let pushes = h.transport.calls_to(Method::Post, PUSH);
    assert_eq!(pushes.len(), 1);
    let body = pushes[0].body.as_ref().unwrap();
    assert_eq!(body["changes"]["clients"]["deleted"], json!(["c1"]));
}

#[tokio::test]
async fn test_record_deleted_before_first_push_never_reaches_server() {
    let h = harness();
    h.transport
        .respond_with(Method::Post, PUSH, RemoteResponse::ok(json!({ "success": true })));
    let record = create_local(&h.store, client_fields("n@x.com")).await.unwrap();
    delete_local(&h.store, Table::Clients, &record.id).await.unwrap();

    for _ in 0..3 {
        assert!(h.coordinator.sync().await.is_completed());
    }
    assert!(h.transport.calls_to(Method::Post, PUSH).is_empty());
    assert!(h.store.records(Table::Clients).await.is_empty());
}

#[tokio::test]
async fn test_inbound_update_keeps_local_preferences() {
    let h = harness();
    let mut record = NewRecord::remote(
        RecordId::from("c1"),
        EntityFields::Clients(Client {
            first_name: "Ann".into(),
            email: Some("a@x.com".into()),
            preferences: Some(json!({ "theme": "dark" })),
            ..Default::default()
        }),
    )
    .into_record();
    record.sync_status = SyncStatus::Synced;
    h.store.insert(record).await;
    h.transport.respond_with(
        Method::Get,
        PULL,
        pull_reply(
            json!({ "clients": { "updated": [
                { "id": "c1", "firstName": "Annie", "email": "a@x.com", "trainerId": "t1" }
            ] } }),
            2000,
        ),
    );

    assert!(h.coordinator.sync().await.is_completed());
    let record = h.store.get(Table::Clients, &RecordId::from("c1")).await.unwrap();
    assert_eq!(record.field("first_name"), Some(json!("Annie")));
    assert_eq!(record.field("preferences"), Some(json!({ "theme": "dark" })));
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert!(h.transport.calls_to(Method::Post, PUSH).is_empty());
}

#[tokio::test]
async fn test_sqlite_store_round_trip() {
    let dir = tempfile::TempDir::new().unwrap();
    let sqlite = SqliteStore::open(dir.path().join("fitsync.db")).unwrap();
    let transport = Arc::new(MockTransport::new());
    let coordinator = SyncCoordinator::new(
        Arc::new(sqlite.clone()),
        transport.clone(),
        Arc::new(sqlite.clone()),
        &SyncConfig::default(),
    );
    transport.respond_with(
        Method::Get,
        PULL,
        pull_reply(
            json!({
                "clients": { "created": [{ "id": "c1", "email": "s@x.com", "trainerId": "t1" }] },
                "client_measurements": { "created": [
                    { "id": "m1", "clientId": "c1", "bodyFatPercentage": 18.5, "measuredDate": "2024-01-15" }
                ] }
            }),
            500,
        ),
    );

    assert!(coordinator.sync().await.is_completed());
    assert_eq!(sqlite.count(Table::Clients).await.unwrap(), 1);
    assert_eq!(sqlite.count(Table::ClientMeasurements).await.unwrap(), 1);
    assert_eq!(sqlite.get(CURSOR_KEY).await.unwrap(), Some("500".to_string()));
}
