//! Prometheus counters for scheduling and credit activity.
//!
//! Counters are registered in the default registry on first use. [`render`] returns the
//! text exposition format for whatever scrapes the embedding process.

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, TextEncoder, register_int_counter, register_int_counter_vec};

static BOOKINGS_CREATED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tutorctl_bookings_created_total",
        "Bookings created, by origin (direct, template, bulk_edit)",
        &["origin"]
    )
    .expect("Failed to register tutorctl_bookings_created_total metric")
});

static BOOKINGS_CANCELLED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tutorctl_bookings_cancelled_total",
        "Bookings cancelled, by whether credits were refunded",
        &["refunded"]
    )
    .expect("Failed to register tutorctl_bookings_cancelled_total metric")
});

static CREDITS_MOVED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tutorctl_credits_total",
        "Credits moved through the ledger, by operation (deduct, refund, grant)",
        &["operation"]
    )
    .expect("Failed to register tutorctl_credits_total metric")
});

static TEMPLATE_APPLICATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tutorctl_template_applications_total",
        "Template applications, by outcome (applied, dry_run, failed)",
        &["outcome"]
    )
    .expect("Failed to register tutorctl_template_applications_total metric")
});

static ROLLBACKS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("tutorctl_rollbacks_total", "Template applications rolled back")
        .expect("Failed to register tutorctl_rollbacks_total metric")
});

static BULK_EDITS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("tutorctl_bulk_edits_total", "Bulk edits applied, by modification type", &["modification_type"])
        .expect("Failed to register tutorctl_bulk_edits_total metric")
});

static SERIALIZATION_CONFLICTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "tutorctl_serialization_conflicts_total",
        "Transactions aborted by the database because of a concurrent writer"
    )
    .expect("Failed to register tutorctl_serialization_conflicts_total metric")
});

pub fn record_booking_created(origin: &str) {
    BOOKINGS_CREATED.with_label_values(&[origin]).inc();
}

pub fn record_booking_cancelled(refunded: bool) {
    let label = if refunded { "true" } else { "false" };
    BOOKINGS_CANCELLED.with_label_values(&[label]).inc();
}

/// Amounts are never negative; anything below zero is recorded as zero.
pub fn record_credits(operation: &str, amount: i64) {
    CREDITS_MOVED.with_label_values(&[operation]).inc_by(amount.max(0) as u64);
}

pub fn record_template_application(outcome: &str) {
    TEMPLATE_APPLICATIONS.with_label_values(&[outcome]).inc();
}

pub fn record_rollback() {
    ROLLBACKS.inc();
}

pub fn record_bulk_edit(modification_type: &str) {
    BULK_EDITS.with_label_values(&[modification_type]).inc();
}

pub fn record_serialization_conflict() {
    SERIALIZATION_CONFLICTS.inc();
}

#[cfg(test)]
pub(crate) fn bookings_created(origin: &str) -> u64 {
    BOOKINGS_CREATED.with_label_values(&[origin]).get()
}

/// Text exposition of every registered metric.
pub fn render() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
