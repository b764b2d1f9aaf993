//! Read-only reconciliation between ingestion state and the booking domain
//!
//! For every booking that has DONE events, the latest one by `eventTime` is
//! compared with the authoritative [`BookingRecord`]. Each comparison
//! domain reports a consistency ratio against its threshold. Mismatches
//! are reported, never corrected.

pub mod scheduler;

pub use scheduler::{ReconciliationScheduler, RECONCILIATION_LEASE};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    AuditEventBuilder, AuditEventType, BookingRecord, BookingStatus, DomainError, IngestEvent,
    ProcessStatus,
};
use crate::infra::{AuditLog, BookingDomain, EventRepository, IngestError, Result};
use crate::metrics::{metric_names, MetricsRegistry};

/// Allowed difference between ingested and recorded prices
pub const PRICE_TOLERANCE: f64 = 0.005;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileDomain {
    Ingest,
    Booking,
    Payment,
    Catalog,
}

impl ReconcileDomain {
    pub const ALL: [ReconcileDomain; 4] = [
        ReconcileDomain::Ingest,
        ReconcileDomain::Booking,
        ReconcileDomain::Payment,
        ReconcileDomain::Catalog,
    ];
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileThresholds {
    pub ingest: f64,
    pub booking: f64,
    pub payment: f64,
    pub catalog: f64,
}

impl Default for ReconcileThresholds {
    fn default() -> Self {
        Self {
            ingest: 1.0,
            booking: 0.999,
            payment: 0.999,
            catalog: 0.995,
        }
    }
}

impl ReconcileThresholds {
    fn get(&self, domain: ReconcileDomain) -> f64 {
        match domain {
            ReconcileDomain::Ingest => self.ingest,
            ReconcileDomain::Booking => self.booking,
            ReconcileDomain::Payment => self.payment,
            ReconcileDomain::Catalog => self.catalog,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub thresholds: ReconcileThresholds,
    /// DONE events read per run
    pub scan_limit: usize,
    /// Itemized mismatches kept in a report
    pub max_mismatches: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            thresholds: ReconcileThresholds::default(),
            scan_limit: 10_000,
            max_mismatches: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainReport {
    pub domain: ReconcileDomain,
    pub checked: u64,
    pub mismatched: u64,
    /// Share of checked items that matched; 1.0 when nothing was checked
    pub ratio: f64,
    pub threshold: f64,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Mismatch {
    pub domain: ReconcileDomain,
    pub external_booking_ref: String,
    pub event_id: Uuid,
    pub field: &'static str,
    pub expected: serde_json::Value,
    pub actual: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub events_scanned: u64,
    pub bookings_checked: u64,
    pub passed: bool,
    pub domains: Vec<DomainReport>,
    pub mismatches: Vec<Mismatch>,
    pub mismatches_truncated: bool,
}

#[derive(Default)]
struct Tally {
    counts: HashMap<ReconcileDomain, (u64, u64)>,
    mismatches: Vec<Mismatch>,
    truncated: bool,
}

impl Tally {
    fn check(&mut self, domain: ReconcileDomain, ok: bool) {
        let entry = self.counts.entry(domain).or_default();
        entry.0 += 1;
        if !ok {
            entry.1 += 1;
        }
    }

    fn mismatch(&mut self, limit: usize, mismatch: Mismatch) {
        if self.mismatches.len() < limit {
            self.mismatches.push(mismatch);
        } else {
            self.truncated = true;
        }
    }
}

pub struct Reconciler {
    events: Arc<dyn EventRepository>,
    domain: Arc<dyn BookingDomain>,
    audit: Arc<dyn AuditLog>,
    metrics: Arc<MetricsRegistry>,
    config: ReconcileConfig,
}

fn domain_error(e: DomainError) -> IngestError {
    IngestError::Internal(format!("booking domain: {e}"))
}

impl Reconciler {
    pub fn new(
        events: Arc<dyn EventRepository>,
        domain: Arc<dyn BookingDomain>,
        audit: Arc<dyn AuditLog>,
        metrics: Arc<MetricsRegistry>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            events,
            domain,
            audit,
            metrics,
            config,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(&self, actor: &str) -> Result<ReconciliationReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let limit = self.config.max_mismatches;

        let done = self
            .events
            .list_by_status(ProcessStatus::Done, self.config.scan_limit)
            .await?;

        let mut tally = Tally::default();
        let mut latest: HashMap<&str, &IngestEvent> = HashMap::new();

        for event in &done {
            let applied = self
                .domain
                .is_applied(event.event_id)
                .await
                .map_err(domain_error)?;
            tally.check(ReconcileDomain::Ingest, applied);
            if !applied {
                tally.mismatch(
                    limit,
                    Mismatch {
                        domain: ReconcileDomain::Ingest,
                        external_booking_ref: event.external_booking_ref().to_string(),
                        event_id: event.event_id,
                        field: "applied",
                        expected: true.into(),
                        actual: false.into(),
                    },
                );
            }

            latest
                .entry(event.external_booking_ref())
                .and_modify(|current| {
                    if event.payload.event_time > current.payload.event_time {
                        *current = event;
                    }
                })
                .or_insert(event);
        }

        for (reference, event) in &latest {
            let record = self.domain.find(reference).await.map_err(domain_error)?;
            compare(&mut tally, limit, event, record.as_ref());
        }

        let domains: Vec<DomainReport> = ReconcileDomain::ALL
            .iter()
            .map(|&domain| {
                let (checked, mismatched) = tally.counts.get(&domain).copied().unwrap_or((0, 0));
                let ratio = if checked == 0 {
                    1.0
                } else {
                    (checked - mismatched) as f64 / checked as f64
                };
                let threshold = self.config.thresholds.get(domain);
                DomainReport {
                    domain,
                    checked,
                    mismatched,
                    ratio,
                    threshold,
                    passed: ratio >= threshold,
                }
            })
            .collect();

        let report = ReconciliationReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            events_scanned: done.len() as u64,
            bookings_checked: latest.len() as u64,
            passed: domains.iter().all(|d| d.passed),
            domains,
            mismatches: tally.mismatches,
            mismatches_truncated: tally.truncated,
        };

        let mismatched: u64 = report.domains.iter().map(|d| d.mismatched).sum();
        self.metrics
            .inc_counter(metric_names::RECONCILIATION_RUNS)
            .await;
        self.metrics
            .add_counter(metric_names::RECONCILIATION_MISMATCHES, mismatched)
            .await;

        let audit = AuditEventBuilder::new(AuditEventType::ReconciliationCompleted, actor)
            .subject(run_id)
            .detail("passed", report.passed)
            .detail("eventsScanned", report.events_scanned)
            .detail("mismatched", mismatched)
            .detail("domains", &report.domains)
            .build();
        if let Err(e) = self.audit.append(audit).await {
            warn!(%run_id, error = %e, "Failed to append audit event");
        }

        info!(
            %run_id,
            passed = report.passed,
            events = report.events_scanned,
            mismatched,
            "Reconciliation completed"
        );
        Ok(report)
    }
}

fn compare(tally: &mut Tally, limit: usize, event: &IngestEvent, record: Option<&BookingRecord>) {
    let reference = event.external_booking_ref();
    let payload = &event.payload;
    let push = |tally: &mut Tally, domain, field, expected: serde_json::Value, actual| {
        tally.mismatch(
            limit,
            Mismatch {
                domain,
                external_booking_ref: reference.to_string(),
                event_id: event.event_id,
                field,
                expected,
                actual,
            },
        )
    };

    let Some(record) = record else {
        for domain in [
            ReconcileDomain::Booking,
            ReconcileDomain::Payment,
            ReconcileDomain::Catalog,
        ] {
            tally.check(domain, false);
        }
        push(
            tally,
            ReconcileDomain::Booking,
            "record",
            "present".into(),
            serde_json::Value::Null,
        );
        return;
    };

    let expected_status = BookingStatus::expected_for(payload.event_type);
    let status_ok = record.status == expected_status;
    tally.check(ReconcileDomain::Booking, status_ok);
    if !status_ok {
        push(
            tally,
            ReconcileDomain::Booking,
            "status",
            expected_status.as_str().into(),
            record.status.as_str().into(),
        );
    }

    let booking = &payload.booking;
    let price_ok = (record.total_price - booking.total_price).abs() <= PRICE_TOLERANCE;
    let currency_ok = record.currency == booking.currency;
    tally.check(ReconcileDomain::Payment, price_ok && currency_ok);
    if !price_ok {
        push(
            tally,
            ReconcileDomain::Payment,
            "totalPrice",
            booking.total_price.into(),
            record.total_price.into(),
        );
    }
    if !currency_ok {
        push(
            tally,
            ReconcileDomain::Payment,
            "currency",
            booking.currency.clone().into(),
            record.currency.clone().into(),
        );
    }

    let catalog_fields: [(&'static str, serde_json::Value, serde_json::Value); 4] = [
        (
            "tourDate",
            booking.tour_date.to_string().into(),
            record.tour_date.to_string().into(),
        ),
        (
            "tourTime",
            booking.tour_time.clone().into(),
            record.tour_time.clone().into(),
        ),
        ("adult", booking.adult.into(), record.adult.into()),
        ("child", booking.child.into(), record.child.into()),
    ];
    let mut catalog_ok = true;
    for (field, expected, actual) in catalog_fields {
        if expected != actual {
            catalog_ok = false;
            push(tally, ReconcileDomain::Catalog, field, expected, actual);
        }
    }
    tally.check(ReconcileDomain::Catalog, catalog_ok);
}
