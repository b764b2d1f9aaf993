//! Postgres-backed integration tests.
//!
//! These are ignored by default and are intended to run in CI (or locally)
//! with `DATABASE_URL` set.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use chrono::Utc;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use booking_ingest::domain::{AuditEventBuilder, AuditEventType, AuditQuery, IngestEvent};
use booking_ingest::infra::postgres::{
    PgAuditLog, PgEventStore, PgJobQueue, PgLeaseStore, PgNonceStore,
};
use booking_ingest::infra::{
    AuditLog, EventRepository, JobKind, JobQueue, LeaseStore, NonceStore,
};
use booking_ingest::server::{auth_state, build_app, build_router, Storage};
use booking_ingest::BookingEventPayload;

use common::*;

async fn connect_db() -> Option<sqlx::PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&url)
        .await
        .ok()?;
    booking_ingest::migrations::run_postgres(&pool).await.ok()?;
    Some(pool)
}

fn event(key: &str, booking_ref: &str) -> IngestEvent {
    let payload: BookingEventPayload =
        serde_json::from_value(booking_payload(booking_ref, "CREATED")).unwrap();
    IngestEvent::new(key, payload)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn postgres_concurrent_inserts_share_one_event() {
    let Some(pool) = connect_db().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let store = Arc::new(PgEventStore::new(pool));
    let key = random_key("pg-conc");

    let mut handles = Vec::new();
    for _ in 0..10 {
        let store = store.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            store
                .insert_if_absent(event(&key, "PG-CONC-1"))
                .await
                .unwrap()
        }));
    }

    let mut ids = HashSet::new();
    let mut created = 0;
    for handle in handles {
        let (event, was_created) = handle.await.unwrap();
        ids.insert(event.event_id);
        if was_created {
            created += 1;
        }
    }
    assert_eq!(ids.len(), 1);
    assert_eq!(created, 1);

    let found = store.find_by_idempotency_key(&key).await.unwrap().unwrap();
    assert!(ids.contains(&found.event_id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn postgres_smoke_lifecycle_through_router() {
    let Some(pool) = connect_db().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };

    let config = test_config(&[]);
    let app = build_app(&config, Storage::postgres(pool, false)).unwrap();
    let router = build_router(app.state.clone(), &config, auth_state(&config.auth)).unwrap();

    let booking_ref = random_key("PG-SMOKE");
    let body = serde_json::to_vec(&booking_payload(&booking_ref, "CREATED")).unwrap();
    let key = random_key("pg-smoke");
    let (status, receipt) = send(&router, signed_request(INGEST_ROUTE, &key, body)).await;
    assert_eq!(status, StatusCode::ACCEPTED, "{receipt}");
    assert_eq!(receipt["processStatus"], "DONE");
    let event_id = receipt["eventId"].as_str().unwrap().to_string();

    let fail = axum::http::Request::builder()
        .method("POST")
        .uri(format!("{}/fail", event_path(&event_id)))
        .header("content-type", "application/json")
        .body(axum::body::Body::from(
            json!({ "reasonCode": "SMOKE_FAILURE" }).to_string(),
        ))
        .unwrap();
    let (status, failed) = send(&router, fail).await;
    assert_eq!(status, StatusCode::ACCEPTED, "{failed}");
    let dl_key = failed["deadLetterKey"].as_str().unwrap().to_string();

    let ready = axum::http::Request::builder()
        .method("PATCH")
        .uri(format!("/api/v1/dead-letter/{dl_key}/status/READY"))
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, _) = send(&router, ready).await;
    assert_eq!(status, StatusCode::OK);

    let replay = axum::http::Request::builder()
        .method("POST")
        .uri(format!("{}/replay", event_path(&event_id)))
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, replay) = send(&router, replay).await;
    assert_eq!(status, StatusCode::ACCEPTED, "{replay}");
    assert_eq!(replay["status"], "SUCCEEDED");

    let get = axum::http::Request::builder()
        .uri(event_path(&event_id))
        .body(axum::body::Body::empty())
        .unwrap();
    let (_, view) = send(&router, get).await;
    assert_eq!(view["processStatus"], "DONE");
    assert_eq!(view["deadLetter"]["status"], "SUCCEEDED");
}

#[tokio::test]
#[ignore]
async fn postgres_audit_is_newest_first_and_filterable() {
    let Some(pool) = connect_db().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let audit = PgAuditLog::new(pool);
    let subject = Uuid::new_v4();

    for step in 0..3 {
        audit
            .append(
                AuditEventBuilder::new(AuditEventType::EventReceived, "pg-test")
                    .subject(subject)
                    .detail("step", step)
                    .build(),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let events = audit
        .query(&AuditQuery {
            subject_id: Some(subject.to_string()),
            limit: 10,
            ..AuditQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].detail["step"], 2);
    assert_eq!(events[2].detail["step"], 0);

    // Nothing this fresh is old enough to clean up.
    audit.cleanup(30).await.unwrap();
    assert!(audit.count().await.unwrap() >= 3);
}

#[tokio::test]
#[ignore]
async fn postgres_nonce_store_rejects_reuse_until_purged() {
    let Some(pool) = connect_db().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let nonces = PgNonceStore::new(pool);
    let nonce = Uuid::new_v4().to_string();
    let expires = Utc::now() + chrono::Duration::seconds(1);

    assert!(nonces.check_and_record(&nonce, expires).await.unwrap());
    assert!(!nonces.check_and_record(&nonce, expires).await.unwrap());

    let purged = nonces
        .purge_expired(Utc::now() + chrono::Duration::seconds(5))
        .await
        .unwrap();
    assert!(purged >= 1);
    assert!(nonces
        .check_and_record(&nonce, Utc::now() + chrono::Duration::minutes(5))
        .await
        .unwrap());
}

#[tokio::test]
#[ignore]
async fn postgres_lease_has_single_holder() {
    let Some(pool) = connect_db().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let leases = PgLeaseStore::new(pool);
    let name = random_key("lease");

    assert!(leases
        .try_acquire(&name, "node-a", Duration::from_secs(60))
        .await
        .unwrap());
    assert!(!leases
        .try_acquire(&name, "node-b", Duration::from_secs(60))
        .await
        .unwrap());
    // Re-acquiring as the holder renews.
    assert!(leases
        .try_acquire(&name, "node-a", Duration::from_secs(60))
        .await
        .unwrap());

    leases.release(&name, "node-a").await.unwrap();
    assert!(leases
        .try_acquire(&name, "node-b", Duration::from_secs(60))
        .await
        .unwrap());
}

#[tokio::test]
#[ignore]
async fn postgres_queue_pause_blocks_dequeue() {
    let Some(pool) = connect_db().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let events = PgEventStore::new(pool.clone());
    let queue = PgJobQueue::new(pool);

    let (stored, _) = events
        .insert_if_absent(event(&random_key("pg-queue"), "PG-QUEUE-1"))
        .await
        .unwrap();
    queue
        .enqueue(stored.event_id, JobKind::Process, Duration::ZERO)
        .await
        .unwrap();

    queue.set_paused(true).await.unwrap();
    let paused = queue.dequeue("worker-1", Duration::from_secs(30)).await;
    queue.set_paused(false).await.unwrap();
    assert!(paused.unwrap().is_none());
    assert!(queue.counts().await.unwrap().waiting >= 1);

    let mut leased = None;
    while let Some(job) = queue
        .dequeue("worker-1", Duration::from_secs(30))
        .await
        .unwrap()
    {
        let mine = job.event_id == stored.event_id;
        queue.ack(job.id).await.unwrap();
        if mine {
            leased = Some(job);
            break;
        }
    }
    let job = leased.expect("job for the enqueued event");
    assert_eq!(job.kind, JobKind::Process);
    assert_eq!(job.deliveries, 1);
}
