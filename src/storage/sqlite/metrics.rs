//! Operation metrics for the catalogue store.

use crate::Result;
use std::time::Instant;

/// Label value for every operation recorded by this crate.
pub const BACKEND: &str = "sqlite";

/// Records operation metrics for storage operations.
///
/// This function records two metrics for each operation:
/// 1. `storage_operations_total` - Counter for operation count by status
/// 2. `storage_operation_duration_ms` - Histogram for operation latency
pub fn record_operation_metrics(
    backend: &'static str,
    operation: &'static str,
    start: Instant,
    status: &'static str,
) {
    metrics::counter!(
        "storage_operations_total",
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        "storage_operation_duration_ms",
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .record(start.elapsed().as_secs_f64() * 1000.0);
}

/// Runs `f` and records its outcome under `operation`.
pub fn timed<T>(operation: &'static str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let start = Instant::now();
    let result = f();
    let status = if result.is_ok() { "success" } else { "error" };
    record_operation_metrics(BACKEND, operation, start, status);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use metrics_exporter_prometheus::PrometheusBuilder;

    #[test]
    fn test_timed_passes_result_through() {
        let ok = timed("test_ok", || Ok(7));
        assert_eq!(ok.unwrap(), 7);

        let err: Result<()> = timed("test_err", || Err(Error::Usage("boom".to_string())));
        assert!(matches!(err, Err(Error::Usage(_))));
    }

    #[test]
    fn test_record_operation_metrics_labels() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            record_operation_metrics(BACKEND, "insert_book", Instant::now(), "success");
        });
        let rendered = handle.render();
        assert!(rendered.contains("storage_operations_total"));
        assert!(rendered.contains("operation=\"insert_book\""));
    }
}
