/*!
Observability infrastructure for flowstore.

- Structured logging setup through `tracing-subscriber`
- Prometheus counters for saves and archives (behind the `metrics` feature)
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{FlowStoreError, Result};

#[cfg(feature = "metrics")]
static METRICS: OnceLock<FlowStoreMetrics> = OnceLock::new();

/// Metrics collected by the flow configuration store
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct FlowStoreMetrics {
    pub saves_total: Counter,
    pub save_failures_total: Counter,
    pub rename_retries_total: Counter,
    pub archives_total: Counter,
    pub archive_failures_total: Counter,
    pub document_size_bytes: Histogram,

    registry: Registry,
}

#[cfg(feature = "metrics")]
impl FlowStoreMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| {
            let counter = Counter::new(name, help).map_err(|e| {
                FlowStoreError::config(format!("Failed to create {name} metric: {e}"))
            })?;
            registry.register(Box::new(counter.clone())).map_err(|e| {
                FlowStoreError::config(format!("Failed to register {name}: {e}"))
            })?;
            Ok::<_, FlowStoreError>(counter)
        };

        let saves_total = counter(
            "flowstore_saves_total",
            "Flow configuration saves committed",
        )?;
        let save_failures_total = counter(
            "flowstore_save_failures_total",
            "Flow configuration saves that failed",
        )?;
        let rename_retries_total = counter(
            "flowstore_rename_retries_total",
            "Commit renames repeated after a failed attempt",
        )?;
        let archives_total = counter(
            "flowstore_archives_total",
            "Archive entries written",
        )?;
        let archive_failures_total = counter(
            "flowstore_archive_failures_total",
            "Archive attempts that failed",
        )?;

        let document_size_bytes = Histogram::with_opts(
            HistogramOpts::new(
                "flowstore_document_size_bytes",
                "Uncompressed size of saved flow configurations",
            )
            .buckets(prometheus::exponential_buckets(1024.0, 4.0, 10).map_err(|e| {
                FlowStoreError::config(format!("Invalid histogram buckets: {e}"))
            })?),
        )
        .map_err(|e| {
            FlowStoreError::config(format!("Failed to create document_size_bytes metric: {e}"))
        })?;
        registry
            .register(Box::new(document_size_bytes.clone()))
            .map_err(|e| {
                FlowStoreError::config(format!("Failed to register document_size_bytes: {e}"))
            })?;

        Ok(Self {
            saves_total,
            save_failures_total,
            rename_retries_total,
            archives_total,
            archive_failures_total,
            document_size_bytes,
            registry,
        })
    }

    /// Get the process-wide metrics instance
    pub fn global() -> Option<&'static FlowStoreMetrics> {
        if let Some(metrics) = METRICS.get() {
            return Some(metrics);
        }
        match Self::new() {
            Ok(metrics) => Some(METRICS.get_or_init(|| metrics)),
            Err(e) => {
                tracing::warn!("Metrics unavailable: {}", e);
                None
            }
        }
    }

    /// Render all metrics in the Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| FlowStoreError::config(format!("Failed to encode metrics: {e}")))?;
        String::from_utf8(buffer)
            .map_err(|e| FlowStoreError::config(format!("Metrics are not UTF-8: {e}")))
    }
}

pub(crate) fn record_save(size_bytes: u64) {
    #[cfg(feature = "metrics")]
    {
        if let Some(metrics) = FlowStoreMetrics::global() {
            metrics.saves_total.inc();
            metrics.document_size_bytes.observe(size_bytes as f64);
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = size_bytes;
}

pub(crate) fn record_save_failure() {
    #[cfg(feature = "metrics")]
    {
        if let Some(metrics) = FlowStoreMetrics::global() {
            metrics.save_failures_total.inc();
        }
    }
}

pub(crate) fn record_rename_retry() {
    #[cfg(feature = "metrics")]
    {
        if let Some(metrics) = FlowStoreMetrics::global() {
            metrics.rename_retries_total.inc();
        }
    }
}

pub(crate) fn record_archive(succeeded: bool) {
    #[cfg(feature = "metrics")]
    {
        if let Some(metrics) = FlowStoreMetrics::global() {
            if succeeded {
                metrics.archives_total.inc();
            } else {
                metrics.archive_failures_total.inc();
            }
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = succeeded;
}

/// Install the global tracing subscriber
///
/// The filter comes from `RUST_LOG` and defaults to `info`. With `json` set,
/// events are emitted as JSON lines.
pub fn init_observability(json: bool) -> Result<()> {
    init_with_filter(json, "info")
}

/// Install the global tracing subscriber with a fallback filter directive
pub fn init_with_filter(json: bool, default_directive: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .map_err(|e| FlowStoreError::config(format!("Invalid log filter: {e}")))?;

    let result = if json {
        let subscriber = TracingRegistry::default()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(true));
        set_global_default(subscriber)
    } else {
        let subscriber = TracingRegistry::default()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false));
        set_global_default(subscriber)
    };
    result.map_err(|e| {
        FlowStoreError::config(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!("flowstore observability initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_initialization_fails() {
        let _ = init_observability(false);
        assert!(init_observability(true).is_err());
    }

    #[test]
    fn test_recorders_are_callable_without_subscriber() {
        record_save(128);
        record_save_failure();
        record_rename_retry();
        record_archive(true);
        record_archive(false);
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_metrics_gathering() {
        record_save(2048);
        let metrics = FlowStoreMetrics::global().unwrap();
        let text = metrics.gather_metrics().unwrap();
        assert!(text.contains("flowstore_saves_total"));
        assert!(text.contains("flowstore_document_size_bytes"));
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_rename_retry_counter_increments() {
        let metrics = FlowStoreMetrics::global().unwrap();
        let before = metrics.rename_retries_total.get();
        record_rename_retry();
        assert!(metrics.rename_retries_total.get() >= before + 1.0);
        assert!(metrics
            .gather_metrics()
            .unwrap()
            .contains("flowstore_rename_retries_total"));
    }
}
