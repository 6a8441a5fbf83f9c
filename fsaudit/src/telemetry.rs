//! OpenTelemetry metrics export module
//!
//! Metrics are exported over OTLP/gRPC only when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set; otherwise every `record_*` helper is
//! a no-op.

use anyhow::{Context, Result};
use log::info;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

use crate::consumer::AuditRecord;
use crate::detector::Alert;

/// Metric export interval in seconds
const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

static METRICS: OnceLock<FsAuditMetrics> = OnceLock::new();

static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

/// Attached tracepoints per probe, read by the `active_probes` gauge.
static ACTIVE_PROBES: OnceLock<RwLock<HashMap<String, u64>>> = OnceLock::new();

fn active_probes_map() -> &'static RwLock<HashMap<String, u64>> {
    ACTIVE_PROBES.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Note: Do NOT add _total suffix to Counter names (Prometheus adds it automatically)
pub struct FsAuditMetrics {
    pub file_events: Counter<u64>,
    pub write_requested_bytes: Counter<u64>,
    pub empty_filename_events: Counter<u64>,
    pub dropped_events: Counter<u64>,
    pub burst_alerts: Counter<u64>,
}

impl FsAuditMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            file_events: meter
                .u64_counter("file_events")
                .with_description("Number of captured open/write/unlink calls")
                .with_unit("events")
                .build(),
            write_requested_bytes: meter
                .u64_counter("write_requested_bytes")
                .with_description("Bytes requested by captured write calls")
                .with_unit("bytes")
                .build(),
            empty_filename_events: meter
                .u64_counter("empty_filename_events")
                .with_description("Open/unlink records whose path could not be read")
                .with_unit("events")
                .build(),
            dropped_events: meter
                .u64_counter("dropped_events")
                .with_description("Records lost to a full perf ring or relay")
                .with_unit("events")
                .build(),
            burst_alerts: meter
                .u64_counter("burst_alerts")
                .with_description("Processes flagged for rapid writes or deletions")
                .with_unit("alerts")
                .build(),
        }
    }
}

fn get_otlp_endpoint() -> Option<String> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    if endpoint.is_empty() {
        return None;
    }

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint)
    }
}

/// Initialize OpenTelemetry metrics provider
///
/// Skips initialization if OTEL_EXPORTER_OTLP_ENDPOINT is not set.
pub fn init_metrics() -> Result<()> {
    let endpoint = match get_otlp_endpoint() {
        Some(ep) => ep,
        None => {
            info!("OTEL_EXPORTER_OTLP_ENDPOINT not set. Metrics export disabled.");
            return Ok(());
        }
    };

    info!("OTLP endpoint: {}", endpoint);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create OTLP metric exporter")?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(Duration::from_secs(METRIC_EXPORT_INTERVAL_SECS))
        .build();

    let resource = Resource::default().merge(&Resource::new(vec![
        KeyValue::new("service.name", "fsaudit"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("fsaudit");

    let _active_probes_gauge = meter
        .u64_observable_gauge("active_probes")
        .with_description("Number of attached syscall tracepoints")
        .with_unit("probes")
        .with_callback(|observer| {
            if let Ok(probes) = active_probes_map().read() {
                for (probe_name, count) in probes.iter() {
                    observer.observe(*count, &[KeyValue::new("probe", probe_name.clone())]);
                }
            }
        })
        .build();

    let _ = METRICS.set(FsAuditMetrics::new(&meter));

    info!("OpenTelemetry metrics initialized successfully");
    Ok(())
}

pub fn metrics() -> Option<&'static FsAuditMetrics> {
    METRICS.get()
}

pub fn record_active_probe(probe_name: &str, count: u64) {
    if let Ok(mut probes) = active_probes_map().write() {
        probes.insert(probe_name.to_string(), count);
        info!("Active probe registered: {} = {}", probe_name, count);
    }
}

#[cfg(test)]
fn active_probe_count(probe_name: &str) -> Option<u64> {
    active_probes_map().read().ok()?.get(probe_name).copied()
}

pub fn record_file_event(record: &AuditRecord) {
    if let Some(m) = metrics() {
        let attrs = [
            KeyValue::new("syscall", record.kind.as_str()),
            KeyValue::new("process", record.comm.clone()),
        ];
        m.file_events.add(1, &attrs);

        if let Some(bytes) = record.bytes {
            m.write_requested_bytes.add(bytes, &attrs);
        }
        if record.filename.as_deref() == Some("") {
            m.empty_filename_events.add(1, &attrs);
        }
    }
}

pub fn record_dropped_events(source: &'static str, count: u64) {
    if let Some(m) = metrics() {
        m.dropped_events
            .add(count, &[KeyValue::new("source", source)]);
    }
}

pub fn record_alert(alert: &Alert) {
    if let Some(m) = metrics() {
        m.burst_alerts
            .add(1, &[KeyValue::new("activity", alert.activity.as_str())]);
    }
}

/// Flushes pending metrics and shuts down the MeterProvider
pub fn shutdown_metrics() {
    if let Some(provider) = METER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            log::warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_get_otlp_endpoint_not_set() {
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
        assert!(get_otlp_endpoint().is_none());
    }

    #[test]
    #[serial]
    fn test_get_otlp_endpoint_empty() {
        unsafe { std::env::set_var("OTEL_EXPORTER_OTLP_ENDPOINT", "") };
        assert!(get_otlp_endpoint().is_none());
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
    }

    #[test]
    #[serial]
    fn test_get_otlp_endpoint_adds_http_prefix() {
        unsafe { std::env::set_var("OTEL_EXPORTER_OTLP_ENDPOINT", "collector:4317") };
        assert_eq!(get_otlp_endpoint(), Some("http://collector:4317".to_string()));
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
    }

    #[test]
    #[serial]
    fn test_init_without_endpoint_is_a_noop() {
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
        init_metrics().unwrap();
        assert!(metrics().is_none());
    }

    #[test]
    fn test_active_probe_registry() {
        record_active_probe("test_probe", 3);
        assert_eq!(active_probe_count("test_probe"), Some(3));
        assert_eq!(active_probe_count("missing_probe"), None);
    }
}
