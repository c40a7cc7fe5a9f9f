//! Structured logging and optional OTLP trace export.
//!
//! Non-dev environments log one JSON object per event. Rule and classification
//! events carry an `owner_user_id` field; the formatter lifts it to a top-level
//! `owner` key so per-tenant log queries do not have to dig into `fields`.

use std::fmt as StdFmt;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::{TraceContextExt, TracerProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{BatchSpanProcessor, SdkTracerProvider, Tracer};
use opentelemetry_sdk::Resource;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::Subscriber;
use tracing::field::{Field, Visit};
use tracing_opentelemetry::{OpenTelemetrySpanExt, OtelData};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::{self, FmtContext};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::reload;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{AppConfig, TelemetryConfig};

const OWNER_FIELD: &str = "owner_user_id";
const EXPORT_TIMEOUT: Duration = Duration::from_secs(3);

type InstallTracer = Box<dyn Fn(Tracer) -> Result<(), TelemetryError> + Send + Sync>;

/// Set once the global subscriber is installed. Later calls can only swap in
/// a tracer.
static OTEL_RELOAD: OnceLock<InstallTracer> = OnceLock::new();
static PROCESS_GUARD: OnceLock<Mutex<Option<TelemetryGuard>>> = OnceLock::new();

/// Keeps the tracer provider alive; the process-wide copy flushes spans when
/// it is dropped as the last holder.
#[derive(Clone)]
pub struct TelemetryGuard {
    provider: Option<Arc<SdkTracerProvider>>,
    flush_on_drop: bool,
}

impl TelemetryGuard {
    fn inert() -> Self {
        Self {
            provider: None,
            flush_on_drop: false,
        }
    }

    pub fn exports_traces(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if !self.flush_on_drop {
            return;
        }
        if let Some(provider) = self.provider.take() {
            if Arc::strong_count(&provider) == 1 {
                let _ = provider.shutdown();
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to set tracing subscriber: {0}")]
    SubscriberInit(String),
    #[error("failed to build OTLP exporter: {0}")]
    ExporterBuild(String),
}

/// Install the global subscriber. `RUST_LOG` drives filtering (default `info`).
/// Safe to call more than once; only the first call installs the subscriber.
pub fn init_telemetry(
    app: &AppConfig,
    telemetry: &TelemetryConfig,
) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|err| TelemetryError::SubscriberInit(err.to_string()))?;

    let provider = build_provider(app, telemetry)?;
    let tracer = provider
        .as_ref()
        .map(|provider| provider.tracer(app.service_name.clone()));

    if app.env.eq_ignore_ascii_case("dev") {
        let layer = fmt::layer()
            .with_target(true)
            .pretty()
            .with_writer(std::io::stderr);
        install_subscriber(layer, env_filter, tracer)?;
    } else {
        let layer = fmt::layer().event_format(JsonEventFormatter);
        install_subscriber(layer, env_filter, tracer)?;
    }

    Ok(match provider {
        Some(provider) => retain_provider(provider),
        None => TelemetryGuard::inert(),
    })
}

/// Logging without trace export, for tools and tests that have no config file.
pub fn init_logging(env: &str) -> Result<(), TelemetryError> {
    let app = AppConfig {
        service_name: "mailsweep".to_string(),
        port: 0,
        env: env.to_string(),
    };
    let telemetry = TelemetryConfig {
        otlp_endpoint: None,
        export_traces: false,
    };
    init_telemetry(&app, &telemetry).map(|_| ())
}

fn build_provider(
    app: &AppConfig,
    telemetry: &TelemetryConfig,
) -> Result<Option<Arc<SdkTracerProvider>>, TelemetryError> {
    let endpoint = match telemetry.otlp_endpoint.as_deref() {
        Some(endpoint) if telemetry.export_traces && !endpoint.is_empty() => endpoint,
        _ => return Ok(None),
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_timeout(EXPORT_TIMEOUT)
        .with_endpoint(endpoint)
        .build()
        .map_err(|err| TelemetryError::ExporterBuild(err.to_string()))?;

    let resource = Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", app.service_name.clone()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("deployment.environment", app.env.clone()),
        ])
        .build();
    let provider = SdkTracerProvider::builder()
        .with_span_processor(BatchSpanProcessor::builder(exporter).build())
        .with_resource(resource)
        .build();

    global::set_tracer_provider(provider.clone());
    global::set_text_map_propagator(opentelemetry_sdk::propagation::TraceContextPropagator::new());

    Ok(Some(Arc::new(provider)))
}

fn retain_provider(provider: Arc<SdkTracerProvider>) -> TelemetryGuard {
    let slot = PROCESS_GUARD.get_or_init(|| Mutex::new(None));
    if let Ok(mut slot) = slot.lock() {
        *slot = Some(TelemetryGuard {
            provider: Some(provider.clone()),
            flush_on_drop: true,
        });
    }

    TelemetryGuard {
        provider: Some(provider),
        flush_on_drop: false,
    }
}

fn install_subscriber(
    fmt_layer: impl tracing_subscriber::Layer<Registry> + Send + Sync + 'static,
    env_filter: EnvFilter,
    tracer: Option<Tracer>,
) -> Result<(), TelemetryError> {
    if let Some(install) = OTEL_RELOAD.get() {
        return match tracer {
            Some(tracer) => install(tracer),
            None => Ok(()),
        };
    }

    let (otel_layer, handle) =
        reload::Layer::new(tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer)));

    let subscriber = Registry::default()
        .with(fmt_layer)
        .with(otel_layer)
        .with(env_filter);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| TelemetryError::SubscriberInit(err.to_string()))?;

    let _ = OTEL_RELOAD.set(Box::new(move |tracer: Tracer| {
        handle
            .modify(|layer| *layer = Some(tracing_opentelemetry::layer().with_tracer(tracer)))
            .map_err(|err| TelemetryError::SubscriberInit(err.to_string()))
    }));

    Ok(())
}

struct JsonEventFormatter;

impl<S, N> FormatEvent<S, N> for JsonEventFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> StdFmt::Result {
        let mut fields = FieldCollector::default();
        event.record(&mut fields);
        let owner = fields.0.remove(OWNER_FIELD);

        let current = ctx.lookup_current();
        let trace_id = current
            .as_ref()
            .and_then(|span| span.extensions().get::<OtelData>().and_then(|data| data.trace_id()))
            .or_else(|| {
                let span_ctx = tracing::Span::current().context().span().span_context().clone();
                span_ctx.is_valid().then(|| span_ctx.trace_id())
            })
            .map(|id| id.to_string());

        let payload = json!({
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "level": event.metadata().level().as_str().to_lowercase(),
            "target": event.metadata().target(),
            "span": current.map(|span| span.name()),
            "trace_id": trace_id,
            "owner": owner,
            "fields": fields.0,
        });

        let line = serde_json::to_string(&payload).map_err(|_| StdFmt::Error)?;
        writeln!(writer, "{line}")
    }
}

#[derive(Default)]
struct FieldCollector(Map<String, Value>);

impl FieldCollector {
    fn put(&mut self, field: &Field, value: impl Into<Value>) {
        self.0.insert(field.name().to_string(), value.into());
    }
}

impl Visit for FieldCollector {
    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value);
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value);
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value);
    }

    fn record_debug(&mut self, field: &Field, value: &dyn StdFmt::Debug) {
        self.put(field, format!("{value:?}"));
    }
}
