//! Prometheus metrics.
//!
//! The store emits counters and histograms through the `metrics` facade
//! unconditionally. Installing the recorder is opt-in; without it the
//! macros are no-ops.

use crate::config::StoreConfig;
use crate::{Error, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Metrics configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsConfig {
    /// Whether the recorder is installed.
    pub enabled: bool,
}

impl MetricsConfig {
    /// Builds metrics configuration from store config with env overrides.
    #[must_use]
    pub fn from_settings(config: &StoreConfig) -> Self {
        let mut metrics = Self {
            enabled: config.metrics_enabled,
        };
        if let Some(enabled) = parse_bool_env("SHELFSTORE_METRICS_ENABLED") {
            metrics.enabled = enabled;
        }
        metrics
    }
}

/// Handle onto the installed recorder.
#[derive(Debug, Clone)]
pub struct MetricsHandle {
    prometheus: PrometheusHandle,
}

impl MetricsHandle {
    /// Renders all metrics in the Prometheus text exposition format.
    #[must_use]
    pub fn render(&self) -> String {
        self.prometheus.render()
    }
}

static GLOBAL_METRICS: OnceLock<MetricsHandle> = OnceLock::new();

/// Returns the process-wide handle if a recorder was installed.
#[must_use]
pub fn global_handle() -> Option<&'static MetricsHandle> {
    GLOBAL_METRICS.get()
}

/// Installs the Prometheus recorder as the global `metrics` recorder.
///
/// No HTTP listener is started; callers render on demand.
pub fn install_prometheus(config: MetricsConfig) -> Result<Option<MetricsHandle>> {
    if !config.enabled {
        return Ok(None);
    }

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::OperationFailed {
            operation: "metrics_recorder_install".to_string(),
            cause: e.to_string(),
        })?;

    let handle = MetricsHandle { prometheus };
    let _ = GLOBAL_METRICS.set(handle.clone());
    Ok(Some(handle))
}

fn parse_bool_env(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|value| {
        let value = value.to_lowercase();
        value == "true" || value == "1" || value == "yes"
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry_smoke() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            return;
        }

        metrics::counter!("test_metrics_registry_total").increment(1);
        let rendered = handle.render();
        assert!(rendered.contains("test_metrics_registry_total"));
    }

    #[test]
    fn test_disabled_installs_nothing() {
        let handle = install_prometheus(MetricsConfig { enabled: false }).unwrap();
        assert!(handle.is_none());
    }
}
