//! Metrics collection for backup orchestration
//!
//! Provides Prometheus-compatible metrics for run outcomes, admission
//! pressure, retry behaviour and the verify/restore pipeline.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};
use std::time::Instant;

lazy_static! {
    /// Finished runs by terminal status and trigger kind
    static ref BACKUP_RUNS: IntCounterVec = register_int_counter_vec!(
        "fleet_backup_runs_total",
        "Total number of finished backup runs",
        &["status", "trigger"]
    ).expect("register fleet_backup_runs_total");

    /// Runs currently holding a concurrency slot
    static ref ACTIVE_RUNS: IntGauge = register_int_gauge!(
        "fleet_backup_active_runs",
        "Number of admitted runs that have not finished"
    ).expect("register fleet_backup_active_runs");

    /// Denied admissions by reason
    static ref ADMISSION_REJECTIONS: IntCounterVec = register_int_counter_vec!(
        "fleet_backup_admission_rejections_total",
        "Admission requests denied by the run registry",
        &["reason"]
    ).expect("register fleet_backup_admission_rejections_total");

    /// Run wall-clock duration
    static ref RUN_DURATION: HistogramVec = register_histogram_vec!(
        "fleet_backup_run_duration_seconds",
        "Backup run duration in seconds",
        &["backup_type", "status"],
        vec![1.0, 10.0, 60.0, 300.0, 900.0, 3600.0, 4.0 * 3600.0, 12.0 * 3600.0]
    ).expect("register fleet_backup_run_duration_seconds");

    /// Retry decisions per operation
    static ref RETRY_EVENTS: IntCounterVec = register_int_counter_vec!(
        "fleet_backup_retry_events_total",
        "Retry coordinator decisions",
        &["operation", "outcome"]
    ).expect("register fleet_backup_retry_events_total");

    /// Verification reports by verdict
    static ref VERIFICATIONS: IntCounterVec = register_int_counter_vec!(
        "fleet_backup_verifications_total",
        "Integrity verification reports produced",
        &["result"]
    ).expect("register fleet_backup_verifications_total");

    /// Restore invocations by verdict
    static ref RESTORES: IntCounterVec = register_int_counter_vec!(
        "fleet_backup_restores_total",
        "Restore operations performed",
        &["result"]
    ).expect("register fleet_backup_restores_total");
}

pub fn record_run_admitted() {
    ACTIVE_RUNS.inc();
}

/// Record a run leaving the registry
pub fn record_run_finished(status: &str, trigger: &str, backup_type: &str, duration_secs: f64) {
    ACTIVE_RUNS.dec();
    BACKUP_RUNS.with_label_values(&[status, trigger]).inc();
    RUN_DURATION
        .with_label_values(&[backup_type, status])
        .observe(duration_secs);
}

pub fn record_admission_rejected(reason: &str) {
    ADMISSION_REJECTIONS.with_label_values(&[reason]).inc();
}

pub fn record_retry(operation: &str, outcome: &str) {
    RETRY_EVENTS.with_label_values(&[operation, outcome]).inc();
}

pub fn record_verification(passed: bool) {
    let result = if passed { "passed" } else { "failed" };
    VERIFICATIONS.with_label_values(&[result]).inc();
}

pub fn record_restore(success: bool) {
    let result = if success { "success" } else { "failure" };
    RESTORES.with_label_values(&[result]).inc();
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer
    #[inline]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    #[inline]
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Export metrics in Prometheus text format
pub fn gather_text() -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert metrics to UTF-8: {}", e).into())
}
