//! OpenTelemetry metrics export module
//!
//! Exports the Go TLS coordinator counters to an OpenTelemetry Collector.
//!
//! ## OTLP Endpoint Priority
//! 1. Helm values (injected via environment variables)
//! 2. Direct environment variable configuration
//!
//! Without an endpoint every `record_*` helper is a no-op.

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

/// Metric export interval in seconds
const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

/// Global metrics handle
static METRICS: OnceLock<TlsHookMetrics> = OnceLock::new();

/// Global MeterProvider for graceful shutdown
static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

/// Registry name -> (tracked binaries, tracked pids), read by the gauge callbacks
static REGISTRY_SIZES: OnceLock<RwLock<HashMap<String, (u64, u64)>>> = OnceLock::new();

fn registry_sizes() -> &'static RwLock<HashMap<String, (u64, u64)>> {
    REGISTRY_SIZES.get_or_init(|| RwLock::new(HashMap::new()))
}

/// tlshook metrics collection
///
/// Note: Do NOT add _total suffix to Counter names (Prometheus adds it automatically)
pub struct TlsHookMetrics {
    pub go_tls_analysis_time_ms: Counter<u64>,
    pub go_tls_missing_symbols: Counter<u64>,
    pub go_tls_hooks_installed: Counter<u64>,
    pub go_tls_hooks_removed: Counter<u64>,
    pub go_tls_hook_failures: Counter<u64>,
    pub registry_events: Counter<u64>,
}

impl TlsHookMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            go_tls_analysis_time_ms: meter
                .u64_counter("go_tls_analysis_time_ms")
                .with_description("Time spent analyzing Go binaries")
                .with_unit("ms")
                .build(),
            go_tls_missing_symbols: meter
                .u64_counter("go_tls_missing_symbols")
                .with_description("Go binaries skipped because they carry no symbols")
                .with_unit("binaries")
                .build(),
            go_tls_hooks_installed: meter
                .u64_counter("go_tls_hooks_installed")
                .with_description("Number of uprobes attached to Go binaries")
                .with_unit("hooks")
                .build(),
            go_tls_hooks_removed: meter
                .u64_counter("go_tls_hooks_removed")
                .with_description("Number of uprobes detached from Go binaries")
                .with_unit("hooks")
                .build(),
            go_tls_hook_failures: meter
                .u64_counter("go_tls_hook_failures")
                .with_description("Failed uprobe attach or detach operations")
                .with_unit("events")
                .build(),
            registry_events: meter
                .u64_counter("registry_events")
                .with_description("Binary registry outcomes")
                .with_unit("events")
                .build(),
        }
    }
}

/// Priority:
/// 1. OTEL_EXPORTER_OTLP_ENDPOINT environment variable (injected from Helm values)
/// 2. If not set, metrics are disabled (no default fallback)
fn get_otlp_endpoint() -> Option<String> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    normalize_endpoint(&endpoint)
}

fn normalize_endpoint(endpoint: &str) -> Option<String> {
    if endpoint.is_empty() {
        return None;
    }

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint.to_string())
    }
}

/// Initialize OpenTelemetry metrics provider
///
/// Configures metrics export to OTLP Collector via gRPC. `configured` is the
/// endpoint from the settings file, used when the environment variable is
/// not set. Must be called from within a Tokio runtime.
pub fn init_metrics(configured: Option<&str>) -> Result<()> {
    let endpoint = match get_otlp_endpoint().or_else(|| configured.and_then(normalize_endpoint)) {
        Some(ep) => ep,
        None => {
            info!("OTEL_EXPORTER_OTLP_ENDPOINT not set. Metrics export disabled.");
            return Ok(());
        }
    };

    info!("Initializing OpenTelemetry metrics exporter");
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
        KeyValue::new("service.name", "tlshook"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("tlshook");

    let _tracked_binaries_gauge = meter
        .u64_observable_gauge("registry_tracked_binaries")
        .with_description("Binaries with at least one interested process")
        .with_unit("binaries")
        .with_callback(|observer| {
            if let Ok(sizes) = registry_sizes().read() {
                for (registry, (binaries, _)) in sizes.iter() {
                    observer.observe(*binaries, &[KeyValue::new("registry", registry.clone())]);
                }
            }
        })
        .build();

    let _tracked_pids_gauge = meter
        .u64_observable_gauge("registry_tracked_pids")
        .with_description("Processes registered against an instrumented binary")
        .with_unit("processes")
        .with_callback(|observer| {
            if let Ok(sizes) = registry_sizes().read() {
                for (registry, (_, pids)) in sizes.iter() {
                    observer.observe(*pids, &[KeyValue::new("registry", registry.clone())]);
                }
            }
        })
        .build();

    let _ = METRICS.set(TlsHookMetrics::new(&meter));

    info!("OpenTelemetry metrics initialized successfully");
    Ok(())
}

pub fn metrics() -> Option<&'static TlsHookMetrics> {
    METRICS.get()
}

pub fn record_registry_event(registry: &str, outcome: &str) {
    if let Some(m) = metrics() {
        let attrs = [
            KeyValue::new("registry", registry.to_string()),
            KeyValue::new("outcome", outcome.to_string()),
        ];
        m.registry_events.add(1, &attrs);
    }
}

/// Updates the sizes reported by the registry gauges.
pub fn record_registry_size(registry: &str, binaries: u64, pids: u64) {
    if let Ok(mut sizes) = registry_sizes().write() {
        sizes.insert(registry.to_string(), (binaries, pids));
    }
}

// === Go TLS metric helpers ===

pub fn record_analysis_time(elapsed: Duration) {
    if let Some(m) = metrics() {
        m.go_tls_analysis_time_ms.add(elapsed.as_millis() as u64, &[]);
    }
}

pub fn record_missing_symbols() {
    if let Some(m) = metrics() {
        m.go_tls_missing_symbols.add(1, &[]);
    }
}

pub fn record_hooks_installed(count: u64) {
    if let Some(m) = metrics() {
        m.go_tls_hooks_installed.add(count, &[]);
    }
}

pub fn record_hooks_removed(count: u64) {
    if let Some(m) = metrics() {
        m.go_tls_hooks_removed.add(count, &[]);
    }
}

pub fn record_hook_failure(operation: &str, program: &str) {
    if let Some(m) = metrics() {
        let attrs = [
            KeyValue::new("operation", operation.to_string()),
            KeyValue::new("program", program.to_string()),
        ];
        m.go_tls_hook_failures.add(1, &attrs);
    }
}

/// Shutdown OpenTelemetry (graceful shutdown)
/// Flushes pending metrics and shuts down the MeterProvider
pub fn shutdown_metrics() {
    info!("Shutting down OpenTelemetry metrics...");
    if let Some(provider) = METER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            log::warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}
