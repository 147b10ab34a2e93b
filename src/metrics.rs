//! Operation metrics.
//!
//! Counters and histograms go through the `metrics` facade, so recording
//! is a no-op until a recorder is installed.  The CLI installs a
//! Prometheus recorder with `init_metrics()` and prints `render()`.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

use crate::errors::StorageError;

// -- Metric name constants ----------------------------------------------------

/// Total storage operations (counter). Labels: operation, outcome.
pub const OPERATIONS_TOTAL: &str = "s3cs_operations_total";

/// Operation duration in seconds (histogram). Labels: operation.
pub const OPERATION_DURATION_SECONDS: &str = "s3cs_operation_duration_seconds";

/// Total bytes sent in successful uploads (counter).
pub const UPLOAD_BYTES_TOTAL: &str = "s3cs_upload_bytes_total";

// -- Operation names ------------------------------------------------------------

pub const OP_LIST_BUCKETS: &str = "list_buckets";
pub const OP_LIST_OBJECTS: &str = "list_objects";
pub const OP_UPLOAD: &str = "upload";
pub const OP_PRESIGN: &str = "presign";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder. Idempotent within this crate;
/// fails if another recorder was installed elsewhere first.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Register metric descriptions with the global recorder.
pub fn describe_metrics() {
    describe_counter!(OPERATIONS_TOTAL, "Total storage operations by type and outcome");
    describe_histogram!(
        OPERATION_DURATION_SECONDS,
        "Storage operation duration in seconds"
    );
    describe_counter!(UPLOAD_BYTES_TOTAL, "Total bytes uploaded");
}

/// Prometheus exposition text, if the recorder is installed.
pub fn render() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

// -- Recording ------------------------------------------------------------------

/// Outcome label: `success` or the error code.
pub fn outcome_label<T>(result: &Result<T, StorageError>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(e) => e.code(),
    }
}

/// Times one operation from creation to [`finish`](Self::finish).
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    /// Record the count and duration under `outcome`.
    pub fn finish(self, outcome: &'static str) {
        counter!(OPERATIONS_TOTAL, "operation" => self.operation, "outcome" => outcome)
            .increment(1);
        histogram!(OPERATION_DURATION_SECONDS, "operation" => self.operation)
            .record(self.start.elapsed().as_secs_f64());
    }

    /// Record `result` and hand it back.
    pub fn observe<T>(self, result: Result<T, StorageError>) -> Result<T, StorageError> {
        self.finish(outcome_label(&result));
        result
    }
}

pub fn record_upload_bytes(bytes: u64) {
    counter!(UPLOAD_BYTES_TOTAL).increment(bytes);
}

// -- Tests --------------------------------------------------------------------
